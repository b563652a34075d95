//! Static name sources: the hosts file and the resolv.conf nameserver list.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use tracing::debug;

/// Static hostname to address mappings.
#[derive(Debug, Clone, Default)]
pub struct HostsFile {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a hosts file; a missing or unreadable file yields no entries.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!("Hosts file {} not loaded: {}", path.display(), e);
                Self::new()
            }
        }
    }

    /// Add an entry
    pub fn add(&mut self, name: &str, ip: IpAddr) {
        self.entries
            .entry(name.trim_end_matches('.').to_ascii_lowercase())
            .or_default()
            .push(ip);
    }

    /// Pick an address for `name`, preferring the requested family.
    pub fn lookup(&self, name: &str, prefer_ipv6: bool) -> Option<IpAddr> {
        let ips = self
            .entries
            .get(&name.trim_end_matches('.').to_ascii_lowercase())?;
        ips.iter()
            .find(|ip| ip.is_ipv6() == prefer_ipv6)
            .or_else(|| ips.first())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse hosts file content
    pub fn parse(content: &str) -> Self {
        let mut hosts = Self::new();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let mut parts = line.split_whitespace();
            let Some(ip) = parts.next().and_then(|p| p.parse::<IpAddr>().ok()) else {
                continue;
            };
            for name in parts {
                hosts.add(name, ip);
            }
        }

        debug!("Parsed {} hosts entries", hosts.len());
        hosts
    }
}

/// Nameservers listed in resolv.conf content, on port 53.
pub fn parse_resolv_conf(content: &str) -> Vec<SocketAddr> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => {
                    // Drop any IPv6 zone suffix.
                    let addr = addr.split('%').next().unwrap_or(addr);
                    addr.parse::<IpAddr>().ok()
                }
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, 53))
        .collect()
}

/// Load nameservers from a resolv.conf file; missing file yields none.
pub fn load_resolv_conf(path: &Path) -> Vec<SocketAddr> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_resolv_conf(&content),
        Err(e) => {
            debug!("{} not loaded: {}", path.display(), e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_hosts_parse() {
        let content = r#"
# This is a comment
127.0.0.1   localhost
192.168.1.1 router gateway # inline comment
::1         localhost ip6-localhost
not-an-ip   ignored
"#;

        let hosts = HostsFile::parse(content);

        assert_eq!(
            hosts.lookup("Router", false),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
        );
        assert!(hosts.lookup("gateway.", false).is_some());
        assert!(hosts.lookup("comment", false).is_none());
        assert!(hosts.lookup("ignored", false).is_none());
    }

    #[test]
    fn test_hosts_family_preference() {
        let hosts = HostsFile::parse("127.0.0.1 localhost\n::1 localhost\n");
        assert_eq!(
            hosts.lookup("localhost", false),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(
            hosts.lookup("localhost", true),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );

        let v4_only = HostsFile::parse("10.0.0.1 box\n");
        assert!(v4_only.lookup("box", true).is_some());
    }

    #[test]
    fn test_resolv_conf() {
        let content = "\
# generated
search example.org
nameserver 10.0.0.53
nameserver fe80::1%eth0
nameserver bogus
options ndots:2
";
        let servers = parse_resolv_conf(content);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0], "10.0.0.53:53".parse().unwrap());
        assert_eq!(servers[1].port(), 53);
    }
}
