//! HTTP/1.1 connector protocol.
//!
//! The same exchange model the AJP13 processor fills is served here straight from a client
//! socket. Requests are parsed line by line from a bounded buffer; bodies are delimited by
//! `Content-Length`, chunked transfer coding, or (HTTP/1.0 only) the end of the connection.
//! Responses are framed the same way: an explicit length when the application set one,
//! chunked coding for HTTP/1.1 clients otherwise, and connection close as the last resort.
//!
//! # Key Components
//!
//! - [`Http11Processor`]: the per-connection request/response state machine.
//! - [`ChunkedDecoder`]: resumable decoder for chunked request bodies.
//! - [`parse_request_line`], [`parse_header_line`], [`parse_host`]: request head parsing.
//!
//! Malformed requests end the connection with a bare error response: `400` for syntax
//! errors, `501` for an unknown transfer coding and `505` for an unsupported protocol
//! version.
mod filters;
mod parser;
mod processor;

pub use filters::{ChunkedDecoder, LAST_CHUNK, encode_chunk};
pub use parser::{
    HTTP_09, HTTP_10, HTTP_11, RequestLine, parse_header_line, parse_host, parse_request_line,
};
pub use processor::{DEFAULT_MAX_HEADER_SIZE, Http11Processor};
