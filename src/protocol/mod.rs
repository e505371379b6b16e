//! AJP13 connector protocol.
//!
//! This module implements the Apache JServ Protocol (AJP13) as spoken between a front-end
//! web server and this connector. It covers the packet layout, the message vocabulary, the
//! byte-level transport abstraction and the per-connection processor that drives a
//! connection through repeated request/response cycles.
//!
//! # Overview
//!
//! A front-end server forwards each HTTP request it receives as a single *forward-request*
//! packet. The connector decodes it into a pooled [`Request`](crate::exchange::Request),
//! hands the exchange to the embedding application's [`Adapter`](crate::exchange::Adapter)
//! and streams the response back as *send-headers*, *send-body-chunk* and *end-response*
//! packets. Request bodies are pulled on demand with *get-body-chunk* packets.
//!
//! Connections are pipelined: once an exchange ends the same connection waits for the next
//! forward-request.
//!
//! # Key Components
//!
//! - [`Message`]: the typed packet vocabulary, in both directions.
//! - [`PacketCodec`]: framing (magic, length prefix) and payload (de)serialization.
//! - [`Transport`]: blocking byte-stream endpoint (TCP, Unix socket, in-memory).
//! - [`AjpProcessor`]: the per-connection request/response state machine.
//!
//! # Binary Format
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────────────┐
//! │ Magic    │ Length   │ Payload                  │
//! │ 2 bytes  │ 2 bytes  │ `Length` bytes           │
//! └──────────┴──────────┴──────────────────────────┘
//! ```
//!
//! - Packets sent to the connector start with `0x12 0x34`, packets sent back start with `AB`.
//! - All integers are big-endian and fixed width.
//! - Strings are a 16-bit length, the UTF-8 bytes and a NUL terminator. A missing
//!   string is the length `0xFFFF` with nothing after it.
//!
//! # See Also
//!
//! - [`exchange`](crate::exchange): the recyclable request/response model filled in here.
//! - [`http11`](crate::http11): the sibling HTTP/1.1 processor.
mod codec;
mod message;
mod processor;
mod transport;

pub use codec::{Direction, FramingError, PacketCodec};
pub use message::{Attribute, ForwardRequest, Message, SendHeaders};
pub use processor::{AjpProcessor, ProcessorState, ReceiveOutcome};
pub use transport::{MemoryTransport, ProtocolTransport, Transport, TransportError};

pub mod constants {
    //! Numeric vocabulary of the AJP13 wire format.

    pub const MAGIC_TO_CONTAINER: u16 = 0x1234;
    pub const MAGIC_TO_SERVER: u16 = 0x4142;

    pub const HEADER_SIZE: usize = 4;
    pub const DEFAULT_PACKET_SIZE: usize = 8192;
    pub const MAX_PACKET_SIZE: usize = 65536;

    /// Bytes of a send-body-chunk packet that are not body data:
    /// header, type, chunk length and NUL terminator.
    pub const BODY_CHUNK_OVERHEAD: usize = HEADER_SIZE + 1 + 2 + 1;

    /// Bytes of a request-body packet that are not body data: header and chunk length.
    pub const BODY_READ_OVERHEAD: usize = HEADER_SIZE + 2;

    /// Encoded length of a missing string.
    pub const NULL_STRING: u16 = 0xFFFF;

    pub mod kind {
        pub const FORWARD_REQUEST: u8 = 2;
        pub const SEND_BODY_CHUNK: u8 = 3;
        pub const SEND_HEADERS: u8 = 4;
        pub const END_RESPONSE: u8 = 5;
        pub const GET_BODY_CHUNK: u8 = 6;
        pub const SHUTDOWN: u8 = 7;
        pub const CPONG: u8 = 9;
        pub const CPING: u8 = 10;
    }

    pub mod attribute {
        pub const CONTEXT: u8 = 1;
        pub const SERVLET_PATH: u8 = 2;
        pub const REMOTE_USER: u8 = 3;
        pub const AUTH_TYPE: u8 = 4;
        pub const QUERY_STRING: u8 = 5;
        pub const ROUTE: u8 = 6;
        pub const SSL_CERT: u8 = 7;
        pub const SSL_CIPHER: u8 = 8;
        pub const SSL_SESSION: u8 = 9;
        pub const REQ_ATTRIBUTE: u8 = 10;
        pub const SSL_KEY_SIZE: u8 = 11;
        pub const SECRET: u8 = 12;
        pub const STORED_METHOD: u8 = 13;
        pub const ARE_DONE: u8 = 0xFF;
    }

    /// Method code announcing that the real method name follows as an attribute.
    pub const METHOD_STORED: u8 = 0xFF;

    /// Method names indexed by `code - 1`.
    pub const METHODS: [&str; 27] = [
        "OPTIONS",
        "GET",
        "HEAD",
        "POST",
        "PUT",
        "DELETE",
        "TRACE",
        "PROPFIND",
        "PROPPATCH",
        "MKCOL",
        "COPY",
        "MOVE",
        "LOCK",
        "UNLOCK",
        "ACL",
        "REPORT",
        "VERSION-CONTROL",
        "CHECKIN",
        "CHECKOUT",
        "UNCHECKOUT",
        "SEARCH",
        "MKWORKSPACE",
        "UPDATE",
        "LABEL",
        "MERGE",
        "BASELINE-CONTROL",
        "MKACTIVITY",
    ];

    /// High byte marking a header name sent as a table code.
    pub const HEADER_CODE_MARK: u16 = 0xA000;

    /// Request header names indexed by `code - 1`.
    pub const REQUEST_HEADERS: [&str; 14] = [
        "accept",
        "accept-charset",
        "accept-encoding",
        "accept-language",
        "authorization",
        "connection",
        "content-type",
        "content-length",
        "cookie",
        "cookie2",
        "host",
        "pragma",
        "referer",
        "user-agent",
    ];

    /// Response header names indexed by `code - 1`.
    pub const RESPONSE_HEADERS: [&str; 11] = [
        "Content-Type",
        "Content-Language",
        "Content-Length",
        "Date",
        "Last-Modified",
        "Location",
        "Set-Cookie",
        "Set-Cookie2",
        "Servlet-Engine",
        "Status",
        "WWW-Authenticate",
    ];

    pub fn method_code(name: &str) -> Option<u8> {
        METHODS
            .iter()
            .position(|m| *m == name)
            .map(|i| (i + 1) as u8)
    }

    pub fn method_name(code: u8) -> Option<&'static str> {
        METHODS.get((code as usize).checked_sub(1)?).copied()
    }

    /// Code for `name`, only when it is spelled exactly as in `table`. Any other spelling
    /// travels as a string so it decodes unchanged.
    pub fn header_code(table: &[&str], name: &str) -> Option<u16> {
        table
            .iter()
            .position(|h| *h == name)
            .map(|i| HEADER_CODE_MARK | (i as u16 + 1))
    }

    pub fn header_name(table: &[&'static str], code: u16) -> Option<&'static str> {
        if code & 0xFF00 != HEADER_CODE_MARK {
            return None;
        }
        table.get(((code & 0xFF) as usize).checked_sub(1)?).copied()
    }
}

pub mod error {
    use thiserror::Error;

    use crate::exchange::ExchangeError;

    use super::{FramingError, TransportError};

    /// Everything that can end a connection.
    #[derive(Debug, Error)]
    pub enum ConnectorError {
        #[error("[framing] {0}")]
        Framing(#[from] FramingError),

        #[error("[transport] {0}")]
        Transport(#[from] TransportError),

        #[error("[exchange] {0}")]
        Exchange(#[from] ExchangeError),

        #[error("[application] {0}")]
        Application(String),

        #[error("forward request did not carry the required secret")]
        SecretMismatch,

        #[error("malformed request, answering with status {status}: {reason}")]
        BadRequest { status: u16, reason: String },
    }

    impl From<std::io::Error> for ConnectorError {
        fn from(value: std::io::Error) -> Self {
            ConnectorError::Transport(TransportError::Io(value))
        }
    }
}
