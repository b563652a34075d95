//! SOCKS5 codec (RFC 1928 subset) for the client-facing side.
//!
//! Parsers are incremental: they take whatever bytes have arrived and
//! return `Ok(None)` until a complete message is available, so the TCP
//! session can feed them straight from non-blocking reads.
//!
//! Supported: no-authentication method, CONNECT and UDP ASSOCIATE,
//! IPv4/IPv6/domain address types, unfragmented UDP datagrams.

mod address;

pub use address::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Reply status codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressNotSupported = 0x08,
}

/// Client greeting: the list of offered authentication methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    /// Parse `VER NMETHODS METHODS...`.
    pub fn parse(buf: &[u8]) -> Result<Option<(Greeting, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version {}", buf[0])));
        }
        let nmethods = buf[1] as usize;
        if nmethods == 0 {
            return Err(Error::protocol("greeting offers no methods"));
        }
        if buf.len() < 2 + nmethods {
            return Ok(None);
        }
        Ok(Some((
            Greeting {
                methods: buf[2..2 + nmethods].to_vec(),
            },
            2 + nmethods,
        )))
    }

    pub fn accepts_no_auth(&self) -> bool {
        self.methods.contains(&METHOD_NO_AUTH)
    }
}

/// Method selection reply.
pub fn method_reply(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// Client request: command plus target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: Address,
}

impl Request {
    /// Parse `VER CMD RSV ATYP ADDR PORT`.
    pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version {}", buf[0])));
        }
        let command = buf[1];
        match Address::parse(&buf[3..])? {
            Some((target, used)) => Ok(Some((Request { command, target }, 3 + used))),
            None => Ok(None),
        }
    }
}

/// Reply status for a request that failed to parse.
pub fn request_error_reply(buf: &[u8]) -> Reply {
    match buf.get(3) {
        Some(&atyp) if !matches!(atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) => {
            Reply::AddressNotSupported
        }
        _ => Reply::GeneralFailure,
    }
}

/// Build `VER REP RSV ATYP BND.ADDR BND.PORT`; `bound` defaults to 0.0.0.0:0.
pub fn reply(status: Reply, bound: Option<SocketAddr>) -> Vec<u8> {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[SOCKS5_VERSION, status as u8, 0x00]);
    // Socket addresses always encode.
    let _ = Address::Socket(bound).write_to(&mut out);
    out
}

/// Parsed SOCKS5 UDP request datagram.
///
/// ```text
/// +-----+------+------+----------+----------+----------+
/// | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +-----+------+------+----------+----------+----------+
/// |  2  |  1   |  1   | Variable |    2     | Variable |
/// +-----+------+------+----------+----------+----------+
/// ```
#[derive(Debug)]
pub struct UdpRequest<'a> {
    pub target: Address,
    /// Address header plus payload, i.e. everything after FRAG
    pub body: &'a [u8],
    pub payload: &'a [u8],
}

/// Parse a client datagram. Fragmented datagrams are rejected.
pub fn parse_udp_request(buf: &[u8]) -> Result<UdpRequest<'_>> {
    if buf.len() < 4 {
        return Err(Error::protocol("UDP request too short"));
    }
    if buf[2] != 0x00 {
        return Err(Error::protocol("fragmented UDP request"));
    }
    let body = &buf[3..];
    let (target, used) = Address::parse(body)?
        .ok_or_else(|| Error::protocol("UDP request address truncated"))?;
    Ok(UdpRequest {
        target,
        body,
        payload: &body[used..],
    })
}

/// Prefix `RSV FRAG` to an address-plus-payload body for the client.
pub fn udp_response(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    out.extend_from_slice(body);
    out
}
