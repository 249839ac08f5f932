//! Multi-address normalization.
//!
//! The gateway accepts composable multi-addresses (`/ip4/…/tcp/…`) as
//! well as the legacy `host:port` form, which is normalized at every
//! input boundary.

use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p::Multiaddr;

use clawchat_types::{ClawchatError, Result};

/// Parses an address string into a [`Multiaddr`], normalizing the
/// legacy `host:port` form to `/ip4/<host>/tcp/<port>` (or `/dns4/…`
/// for hostnames, `/ip6/…` for bracketed IPv6 literals).
pub fn normalize_multiaddr(input: &str) -> Result<Multiaddr> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ClawchatError::Protocol {
            reason: "empty address".into(),
        });
    }

    if input.starts_with('/') {
        return input.parse().map_err(|e| ClawchatError::Protocol {
            reason: format!("invalid multiaddr '{input}': {e}"),
        });
    }

    // Legacy host:port. IPv6 literals come bracketed: [::1]:9000.
    let (host, port) = split_host_port(input)?;
    let port: u16 = port.parse().map_err(|_| ClawchatError::Protocol {
        reason: format!("invalid port in '{input}'"),
    })?;

    let rendered = if let Ok(v4) = host.parse::<Ipv4Addr>() {
        format!("/ip4/{v4}/tcp/{port}")
    } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
        format!("/ip6/{v6}/tcp/{port}")
    } else {
        format!("/dns4/{host}/tcp/{port}")
    };

    rendered.parse().map_err(|e| ClawchatError::Protocol {
        reason: format!("invalid address '{input}': {e}"),
    })
}

fn split_host_port(input: &str) -> Result<(&str, &str)> {
    if let Some(rest) = input.strip_prefix('[') {
        // [v6]:port
        let (host, tail) = rest.split_once(']').ok_or_else(|| ClawchatError::Protocol {
            reason: format!("unterminated IPv6 literal in '{input}'"),
        })?;
        let port = tail.strip_prefix(':').ok_or_else(|| ClawchatError::Protocol {
            reason: format!("missing port in '{input}'"),
        })?;
        return Ok((host, port));
    }

    input.rsplit_once(':').ok_or_else(|| ClawchatError::Protocol {
        reason: format!("address '{input}' is neither a multiaddr nor host:port"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiaddr_passes_through() -> Result<()> {
        let addr = normalize_multiaddr("/ip4/127.0.0.1/tcp/19000")?;
        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/tcp/19000");
        Ok(())
    }

    #[test]
    fn host_port_normalizes_to_ip4() -> Result<()> {
        let addr = normalize_multiaddr("127.0.0.1:19000")?;
        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/tcp/19000");
        Ok(())
    }

    #[test]
    fn hostname_normalizes_to_dns4() -> Result<()> {
        let addr = normalize_multiaddr("gateway.example.org:9000")?;
        assert_eq!(addr.to_string(), "/dns4/gateway.example.org/tcp/9000");
        Ok(())
    }

    #[test]
    fn bracketed_ipv6_normalizes() -> Result<()> {
        let addr = normalize_multiaddr("[::1]:9000")?;
        assert_eq!(addr.to_string(), "/ip6/::1/tcp/9000");
        Ok(())
    }

    #[test]
    fn junk_rejected() {
        assert!(normalize_multiaddr("").is_err());
        assert!(normalize_multiaddr("no-port-here").is_err());
        assert!(normalize_multiaddr("127.0.0.1:notaport").is_err());
        assert!(normalize_multiaddr("/ip4/999.0.0.1/tcp/1").is_err());
    }
}
