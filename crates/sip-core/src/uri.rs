// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// Parsed representation of a SIP URI (RFC 3261 §19).
///
/// Only `sip:` and `sips:` schemes are modeled; the user agent has no
/// use for tel or absolute URIs. The textual form is re-rendered from
/// the parts via [`fmt::Display`], so mutating `host` or `port` keeps
/// the rendered URI consistent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl SipUri {
    /// Constructs a `sip:` URI with the given host and default settings.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            sips: false,
            user: None,
            host: host.into(),
            port: None,
            params: BTreeMap::new(),
        }
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        // URI headers (?h=v) carry no meaning for the dialog layer.
        let addr_part = match rest.split_once('?') {
            Some((addr, _headers)) => addr,
            None => rest,
        };

        let mut params = BTreeMap::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if let Some((k, v)) = param.split_once('=') {
                params.insert(
                    SmolStr::new(k.trim().to_owned()),
                    Some(SmolStr::new(v.trim().to_owned())),
                );
            } else {
                params.insert(SmolStr::new(param.to_owned()), None);
            }
        }

        let (user, host_port) = match base.split_once('@') {
            Some((user, host)) => (
                percent_decode_str(user.trim())
                    .decode_utf8()
                    .ok()
                    .map(|s| SmolStr::new(s.to_string())),
                host.trim(),
            ),
            None => (None, base.trim()),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        let host = percent_decode_str(host)
            .decode_utf8()
            .ok()?
            .to_ascii_lowercase();

        Some(Self {
            sips,
            user,
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Returns the `transport` URI parameter lowercased, defaulting to udp.
    pub fn transport_param(&self) -> SmolStr {
        self.params
            .get("transport")
            .and_then(|v| v.as_ref())
            .map(|v| SmolStr::new(v.to_ascii_lowercase()))
            .unwrap_or_else(|| SmolStr::new("udp"))
    }

    /// Returns `true` when the host is a loopback IP literal.
    pub fn is_loopback(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", if self.sips { "sips" } else { "sip" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Splits a host[:port] or IPv6 literal "[host]:port" string.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if input.starts_with('[') {
        let end = input.find(']')?;
        let host = &input[1..end];
        let remainder = &input[end + 1..];
        if let Some(port_str) = remainder.strip_prefix(':') {
            let port = port_str.parse().ok()?;
            Some((host, Some(port)))
        } else {
            Some((host, None))
        }
    } else if let Some(idx) = input.rfind(':') {
        if input.matches(':').count() > 1 {
            return None;
        }
        let (host, port_str) = input.split_at(idx);
        if port_str.len() > 1 && port_str[1..].chars().all(|c| c.is_ascii_digit()) {
            let port = port_str[1..].parse().ok()?;
            Some((host, Some(port)))
        } else {
            Some((input, None))
        }
    } else {
        Some((input, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_uri() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert!(!uri.sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_str(), "example.com");
        assert_eq!(uri.port, None);
    }

    #[test]
    fn parses_port_and_params() {
        let uri = SipUri::parse("sip:bob@example.com:5080;transport=tcp;lr").unwrap();
        assert_eq!(uri.port, Some(5080));
        assert_eq!(uri.transport_param().as_str(), "tcp");
        assert!(uri.params.contains_key("lr"));
    }

    #[test]
    fn transport_defaults_to_udp() {
        let uri = SipUri::parse("sip:bob@example.com").unwrap();
        assert_eq!(uri.transport_param().as_str(), "udp");
    }

    #[test]
    fn detects_loopback_literals() {
        assert!(SipUri::parse("sip:127.0.0.1").unwrap().is_loopback());
        assert!(SipUri::parse("sip:[::1]").unwrap().is_loopback());
        assert!(!SipUri::parse("sip:example.com").unwrap().is_loopback());
        assert!(!SipUri::parse("sip:192.0.2.10").unwrap().is_loopback());
    }

    #[test]
    fn rejects_non_sip_schemes() {
        assert!(SipUri::parse("tel:+15551234567").is_none());
        assert!(SipUri::parse("http://example.com").is_none());
    }

    #[test]
    fn rejects_unbracketed_ipv6_host() {
        assert!(SipUri::parse("sip:2001:db8::1").is_none());
    }

    #[test]
    fn display_round_trips_components() {
        let uri = SipUri::parse("sip:alice@example.com:5060;transport=tcp").unwrap();
        assert_eq!(uri.to_string(), "sip:alice@example.com:5060;transport=tcp");
    }

    #[test]
    fn display_reflects_mutation() {
        let mut uri = SipUri::parse("sip:alice@0.0.0.0").unwrap();
        uri.host = SmolStr::new("192.0.2.1");
        uri.port = Some(5062);
        assert_eq!(uri.to_string(), "sip:alice@192.0.2.1:5062");
    }

    #[test]
    fn display_brackets_ipv6() {
        let uri = SipUri::parse("sips:carol@[2001:db8::1]:5061").unwrap();
        assert_eq!(uri.to_string(), "sips:carol@[2001:db8::1]:5061");
    }
}
