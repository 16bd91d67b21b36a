//! Host/port addressing.
//!
//! IPv6 literals are canonicalized on construction so equality is
//! case-insensitive and bracket-insensitive; name forms are never resolved
//! (`localhost` and `127.0.0.1` stay distinct).

use std::fmt;
use std::net::Ipv6Addr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: &str, port: u16) -> HostAndPort {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        let canonical = match trimmed.parse::<Ipv6Addr>() {
            Ok(addr) => {
                let segments = addr.segments();
                segments
                    .iter()
                    .map(|s| format!("{s:x}"))
                    .collect::<Vec<_>>()
                    .join(":")
            }
            Err(_) => trimmed.to_owned(),
        };
        HostAndPort {
            host: canonical,
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_loopback_canonicalizes_to_expanded_form() {
        let host = HostAndPort::new("::1", 11210);
        assert_eq!(host.host(), "0:0:0:0:0:0:0:1");
    }

    #[test]
    fn ipv6_equality_is_case_insensitive() {
        let upper = HostAndPort::new("FE80::A", 8091);
        let lower = HostAndPort::new("fe80::a", 8091);
        assert_eq!(upper, lower);
    }

    #[test]
    fn brackets_are_stripped_on_construction() {
        assert_eq!(
            HostAndPort::new("[::1]", 8091),
            HostAndPort::new("::1", 8091)
        );
    }

    #[test]
    fn name_forms_are_not_resolved() {
        assert_ne!(
            HostAndPort::new("localhost", 8091),
            HostAndPort::new("127.0.0.1", 8091)
        );
    }

    #[test]
    fn display_bracket_wraps_ipv6_only() {
        assert_eq!(
            HostAndPort::new("::1", 8091).to_string(),
            "[0:0:0:0:0:0:0:1]:8091"
        );
        assert_eq!(
            HostAndPort::new("node1.example.com", 8091).to_string(),
            "node1.example.com:8091"
        );
    }
}
