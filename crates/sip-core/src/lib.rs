// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-memory SIP message model.
//!
//! This crate carries the typed representation of SIP requests and
//! responses exchanged between the user-agent core and the transaction
//! stack: methods, URIs, ordered header collections, and string-level
//! accessors for the handful of headers the dialog layer cares about
//! (Call-ID, CSeq, tags, Contact, Expires, Record-Route).
//!
//! Wire parsing and serialization of complete messages is deliberately
//! not here; the transaction stack owns the wire.

pub mod header_values;
pub mod headers;
pub mod method;
pub mod msg;
pub mod uri;

pub use header_values::{
    call_id, contact_uri, cseq, expires, from_tag, header, name_addr_uri, record_routes, tag_param,
    to_tag, with_tag,
};
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Request, RequestLine, Response, StatusLine};
pub use uri::SipUri;
