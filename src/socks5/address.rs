//! Target address header shared by the SOCKS5 request and the tunnel.
//!
//! ```text
//! +------+----------+------+
//! | ATYP | ADDRESS  | PORT |
//! +------+----------+------+
//! |  1   | Variable |  2   |
//! +------+----------+------+
//! ```
//!
//! ATYP 0x01 is 4 bytes of IPv4, 0x04 is 16 bytes of IPv6 and 0x03 is a
//! length byte followed by that many bytes of domain name.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A connection target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed, otherwise the address
    /// and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Address, usize)>> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };

        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((Address::Socket(SocketAddr::new(IpAddr::V4(ip), port)), 7)))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                let ip = IpAddr::V6(Ipv6Addr::from(octets));
                Ok(Some((Address::Socket(SocketAddr::new(ip, port)), 19)))
            }
            ATYP_DOMAIN => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                if len == 0 {
                    return Err(Error::protocol("empty domain name"));
                }
                if buf.len() < 2 + len + 2 {
                    return Ok(None);
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((Address::Domain(domain.to_string(), port), 4 + len)))
            }
            other => Err(Error::protocol(format!(
                "unknown address type: 0x{:02x}",
                other
            ))),
        }
    }

    /// Append the encoded header to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| Error::protocol("domain name longer than 255 bytes"))?;
                out.push(ATYP_DOMAIN);
                out.push(len);
                out.extend_from_slice(domain.as_bytes());
            }
        }
        out.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }

    /// Encoded header as a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 7,
            Address::Socket(SocketAddr::V6(_)) => 19,
            Address::Domain(domain, _) => 4 + domain.len(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ipv4_addr() {
        let payload = [0x01, 93, 184, 216, 34, 0x01, 0xBB, 0xEE];
        let (addr, used) = Address::parse(&payload).unwrap().unwrap();
        assert_eq!(addr, Address::Socket("93.184.216.34:443".parse().unwrap()));
        assert_eq!(used, 7);
    }

    #[test]
    fn test_parse_domain_addr() {
        let mut payload = vec![0x03, 11];
        payload.extend_from_slice(b"example.com");
        payload.extend_from_slice(&80u16.to_be_bytes());
        let (addr, used) = Address::parse(&payload).unwrap().unwrap();
        assert_eq!(addr, Address::Domain("example.com".into(), 80));
        assert_eq!(used, payload.len());
        assert_eq!(addr.to_string(), "example.com:80");
    }

    #[test]
    fn test_incomplete_and_invalid() {
        assert!(Address::parse(&[]).unwrap().is_none());
        assert!(Address::parse(&[0x01, 1, 2, 3]).unwrap().is_none());
        assert!(Address::parse(&[0x03, 5, b'a']).unwrap().is_none());
        assert!(Address::parse(&[0x04; 10]).unwrap().is_none());
        assert!(Address::parse(&[0x03, 0, 0, 80]).is_err());
        assert!(Address::parse(&[0x05, 0, 0]).is_err());
    }

    #[test]
    fn test_overlong_domain_rejected() {
        let addr = Address::Domain("a".repeat(256), 80);
        assert!(addr.to_bytes().is_err());
    }

    fn arb_address() -> impl Strategy<Value = Address> {
        prop_oneof![
            any::<(u32, u16)>().prop_map(|(ip, port)| Address::Socket(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(ip)),
                port
            ))),
            any::<(u128, u16)>().prop_map(|(ip, port)| Address::Socket(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(ip)),
                port
            ))),
            ("[a-z0-9-]{1,63}(\\.[a-z]{2,10}){0,3}", any::<u16>())
                .prop_map(|(d, port)| Address::Domain(d, port)),
        ]
    }

    proptest! {
        #[test]
        fn prop_parse_matches_encoded_header(
            addr in arb_address(),
            trailing in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let mut bytes = addr.to_bytes().unwrap();
            let header_len = bytes.len();
            bytes.extend_from_slice(&trailing);

            let (parsed, used) = Address::parse(&bytes).unwrap().unwrap();
            prop_assert_eq!(&parsed, &addr);
            prop_assert_eq!(used, header_len);
            prop_assert_eq!(used, addr.encoded_len());

            // Every strict prefix is reported as incomplete.
            for cut in 0..header_len {
                prop_assert!(Address::parse(&bytes[..cut]).unwrap().is_none());
            }
        }
    }
}
