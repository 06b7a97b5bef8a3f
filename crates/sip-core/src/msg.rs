// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{header_values, headers::Headers, method::Method, uri::SipUri};

/// First line of a SIP request: `Method SP Request-URI SP SIP/2.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self { method, uri }
    }
}

/// First line of a SIP response: `SIP/2.0 SP Status-Code SP Reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// In-memory SIP request.
///
/// The body is opaque to the dialog layer; SDP payloads are stored and
/// forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.start.method
    }

    pub fn is_invite(&self) -> bool {
        self.start.method == Method::Invite
    }

    /// Returns the Call-ID header value, if present.
    pub fn call_id(&self) -> Option<&SmolStr> {
        header_values::call_id(&self.headers)
    }

    /// Returns the CSeq sequence number and method token.
    pub fn cseq(&self) -> Option<(u32, SmolStr)> {
        header_values::cseq(&self.headers)
    }

    /// Attaches a body, setting Content-Type and Content-Length.
    pub fn set_body(&mut self, content_type: &str, body: Bytes) {
        self.headers
            .replace("Content-Type", SmolStr::new(content_type.to_owned()));
        self.headers
            .replace("Content-Length", SmolStr::new(body.len().to_string()));
        self.body = body;
    }
}

/// In-memory SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Builds a response mirroring the dialog-identifying headers of a
    /// request (Via, From, To, Call-ID, CSeq), per RFC 3261 §8.2.6.2.
    pub fn from_request(request: &Request, code: u16, reason: &str) -> Self {
        let mut headers = Headers::new();
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in request.headers.get_all(name) {
                headers.push(SmolStr::new(name), value.clone());
            }
        }
        headers.push("Content-Length", "0");

        Self {
            start: StatusLine::new(code, SmolStr::new(reason.to_owned())),
            headers,
            body: Bytes::new(),
        }
    }

    pub fn code(&self) -> u16 {
        self.start.code
    }

    pub fn reason(&self) -> &str {
        &self.start.reason
    }

    /// Returns true for any 1xx response, 100 Trying included.
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.start.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }

    /// Returns the Call-ID header value, if present.
    pub fn call_id(&self) -> Option<&SmolStr> {
        header_values::call_id(&self.headers)
    }

    /// Attaches a body, setting Content-Type and Content-Length.
    pub fn set_body(&mut self, content_type: &str, body: Bytes) {
        self.headers
            .replace("Content-Type", SmolStr::new(content_type.to_owned()));
        self.headers
            .replace("Content-Length", SmolStr::new(body.len().to_string()));
        self.body = body;
    }
}
