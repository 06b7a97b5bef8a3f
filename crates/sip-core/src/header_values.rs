// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! String-level accessors for the headers the dialog layer consumes.
//!
//! These operate on raw header values without a full grammar; the
//! transaction stack has already validated the wire form.

use smol_str::SmolStr;

use crate::{headers::Headers, uri::SipUri};

/// Returns the first header value with the given name.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a SmolStr> {
    headers.get(name)
}

/// Returns the Call-ID header value.
pub fn call_id(headers: &Headers) -> Option<&SmolStr> {
    headers.get("Call-ID")
}

/// Returns the CSeq sequence number and method token.
pub fn cseq(headers: &Headers) -> Option<(u32, SmolStr)> {
    let value = headers.get("CSeq")?;
    let (num, method) = value.split_once(' ')?;
    let num = num.trim().parse().ok()?;
    Some((num, SmolStr::new(method.trim().to_owned())))
}

/// Extracts the `tag` parameter from a From/To header value.
pub fn tag_param(value: &str) -> Option<&str> {
    let tag = value.split(";tag=").nth(1)?;
    Some(tag.split(';').next().unwrap_or(tag).trim())
}

/// Returns the From tag, if present.
pub fn from_tag(headers: &Headers) -> Option<SmolStr> {
    tag_param(headers.get("From")?).map(|t| SmolStr::new(t.to_owned()))
}

/// Returns the To tag, if present.
pub fn to_tag(headers: &Headers) -> Option<SmolStr> {
    tag_param(headers.get("To")?).map(|t| SmolStr::new(t.to_owned()))
}

/// Extracts the URI embedded in a name-addr or addr-spec header value.
///
/// Handles both `"Display" <sip:uri>;params` and bare `sip:uri;params`
/// forms. In the bare form the params belong to the header, not the
/// URI, so they are dropped.
pub fn name_addr_uri(value: &str) -> Option<SipUri> {
    if let Some(start) = value.find('<') {
        let end = value[start + 1..].find('>')?;
        SipUri::parse(&value[start + 1..start + 1 + end])
    } else {
        let addr = value.split(';').next().unwrap_or(value);
        SipUri::parse(addr.trim())
    }
}

/// Returns the URI from the Contact header, if present.
pub fn contact_uri(headers: &Headers) -> Option<SipUri> {
    name_addr_uri(headers.get("Contact")?)
}

/// Returns the Expires header parsed as seconds.
pub fn expires(headers: &Headers) -> Option<u32> {
    headers.get("Expires")?.trim().parse().ok()
}

/// Returns all Record-Route values in their original order.
pub fn record_routes(headers: &Headers) -> Vec<SmolStr> {
    headers.get_all("Record-Route").cloned().collect()
}

/// Appends a `tag` parameter to a From/To header value when absent.
pub fn with_tag(value: &SmolStr, tag: &str) -> SmolStr {
    if tag_param(value).is_some() {
        value.clone()
    } else {
        SmolStr::new(format!("{};tag={}", value, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Headers {
        let mut headers = Headers::new();
        headers.push("From", "\"Alice\" <sip:alice@example.com>;tag=88sja8x");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "f81d4fae@192.0.2.1");
        headers.push("CSeq", "4711 INVITE");
        headers.push("Contact", "<sip:bob@192.0.2.4:5060;transport=tcp>");
        headers.push("Record-Route", "<sip:p1.example.com;lr>");
        headers.push("Record-Route", "<sip:p2.example.com;lr>");
        headers.push("Expires", "3600");
        headers
    }

    #[test]
    fn reads_call_id_and_cseq() {
        let h = headers();
        assert_eq!(call_id(&h).map(|v| v.as_str()), Some("f81d4fae@192.0.2.1"));
        assert_eq!(cseq(&h), Some((4711, SmolStr::new("INVITE"))));
    }

    #[test]
    fn extracts_tags() {
        let h = headers();
        assert_eq!(from_tag(&h).as_deref(), Some("88sja8x"));
        assert_eq!(to_tag(&h), None);
    }

    #[test]
    fn extracts_contact_uri() {
        let uri = contact_uri(&headers()).unwrap();
        assert_eq!(uri.host.as_str(), "192.0.2.4");
        assert_eq!(uri.port, Some(5060));
        assert_eq!(uri.transport_param().as_str(), "tcp");
    }

    #[test]
    fn name_addr_without_brackets_drops_header_params() {
        let uri = name_addr_uri("sip:carol@example.com;tag=xyz").unwrap();
        assert_eq!(uri.user.as_deref(), Some("carol"));
        assert!(uri.params.is_empty());
    }

    #[test]
    fn collects_record_routes_in_order() {
        let routes = record_routes(&headers());
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].as_str(), "<sip:p1.example.com;lr>");
    }

    #[test]
    fn with_tag_is_idempotent() {
        let tagged = SmolStr::new("<sip:bob@example.com>;tag=abc");
        assert_eq!(with_tag(&tagged, "zzz"), tagged);

        let untagged = SmolStr::new("<sip:bob@example.com>");
        assert_eq!(
            with_tag(&untagged, "zzz").as_str(),
            "<sip:bob@example.com>;tag=zzz"
        );
    }

    #[test]
    fn parses_expires() {
        assert_eq!(expires(&headers()), Some(3600));
    }
}
