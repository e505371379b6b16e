//! Recyclable request/response model.
//!
//! # Overview
//!
//! Every connection processor fills a pooled [`Request`] from the wire, lends it together
//! with its [`Response`] to the embedding application through an [`Exchange`], and resets
//! both once the exchange is over. Nothing in this module touches a socket: reading the
//! request body and writing the response are routed back to the processor through the
//! [`ActionHook`] it installs on the exchange.
//!
//! # Key Components
//!
//! - [`Request`] / [`Response`]: the mutable exchange state.
//! - [`MimeHeaders`]: ordered, case-insensitive, multi-valued header collection.
//! - [`BodyLengthPolicy`]: whether the request body has a declared length.
//! - [`Adapter`]: the application entry point, called once per exchange.
//! - [`ExchangePair`]: the pooled unit, a request with its response.
//!
//! # See Also
//!
//! - [`pool`](crate::pool): where idle pairs wait between exchanges.
//! - [`protocol`](crate::protocol) and [`http11`](crate::http11): the processors that
//!   drive an exchange.
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};

use crate::pool::Recycle;
use crate::protocol::error::ConnectorError;

mod headers;
mod request;
mod response;
pub mod status;

pub use headers::MimeHeaders;
pub use request::{Environment, Request};
pub use response::{DEFAULT_STATUS, Response};

pub use self::error::ExchangeError;

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum ExchangeError {
        #[error("response headers are already committed")]
        Committed,
        #[error("response is already finished")]
        Finished,
        #[error("invalid request uri: {0}")]
        InvalidUri(String),
        #[error("invalid value for header {0}")]
        InvalidHeader(String),
        #[error("missing required field: {0}")]
        MissingField(&'static str),
    }
}

/// Attribute keys under which TLS metadata is stored on a [`Request`].
pub mod tls {
    pub const CERTIFICATE_CHAIN: &str = "tls.certificate_chain";
    pub const CIPHER_SUITE: &str = "tls.cipher_suite";
    pub const SESSION_ID: &str = "tls.session_id";
    pub const KEY_SIZE: &str = "tls.key_size";
}

/// How the end of a request body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyLengthPolicy {
    /// The body is exactly this many bytes.
    KnownLength(u64),
    /// The body ends when the peer says so.
    #[default]
    Unbounded,
}

/// TLS facts about a connection, each independently optional.
pub trait TlsInfo {
    fn cipher_suite(&self) -> Option<String>;
    fn peer_certificate_chain(&self) -> Option<String>;
    fn session_id(&self) -> Option<String>;
    fn key_size(&self) -> Option<u16> {
        None
    }
}

/// Plain [`TlsInfo`] values, as carried by AJP attributes or supplied by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsDetails {
    pub cipher_suite: Option<String>,
    pub certificate_chain: Option<String>,
    pub session_id: Option<String>,
    pub key_size: Option<u16>,
}

impl TlsDetails {
    pub fn is_empty(&self) -> bool {
        self.cipher_suite.is_none()
            && self.certificate_chain.is_none()
            && self.session_id.is_none()
            && self.key_size.is_none()
    }
}

impl TlsInfo for TlsDetails {
    fn cipher_suite(&self) -> Option<String> {
        self.cipher_suite.clone()
    }

    fn peer_certificate_chain(&self) -> Option<String> {
        self.certificate_chain.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn key_size(&self) -> Option<u16> {
        self.key_size
    }
}

pub type ServiceError = Box<dyn Error + Send + Sync>;

/// Application entry point.
///
/// Called once per exchange on the connection's thread. The processor resumes only after
/// `service` returns, and finishes the response itself if the application did not.
pub trait Adapter: Send + Sync {
    fn service(&self, exchange: &mut Exchange<'_>) -> Result<(), ServiceError>;
}

impl<F> Adapter for F
where
    F: Fn(&mut Exchange<'_>) -> Result<(), ServiceError> + Send + Sync,
{
    fn service(&self, exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        self(exchange)
    }
}

/// Calls the adapter once, reporting a returned error or a panic as a message.
pub(crate) fn invoke(adapter: &dyn Adapter, exchange: &mut Exchange<'_>) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| adapter.service(exchange))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("adapter panicked".to_owned()),
    }
}

/// Protocol side of an exchange: the actions a processor performs on the application's
/// behalf.
pub trait ActionHook {
    /// Reads request body bytes into `buf`. Returns 0 at end of body.
    fn read_body(&mut self, request: &mut Request, buf: &mut [u8]) -> Result<usize, ConnectorError>;

    /// Sends the response headers. Calling it again is a no-op.
    fn commit(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError>;

    /// Sends body bytes, committing first if needed.
    fn write_body(
        &mut self,
        request: &Request,
        response: &mut Response,
        chunk: &[u8],
    ) -> Result<(), ConnectorError>;

    /// Ends the response. Calling it again is a no-op.
    fn finish(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError>;
}

/// A request and its response, lent to an [`Adapter`] for one call.
pub struct Exchange<'a> {
    request: &'a mut Request,
    response: &'a mut Response,
    hook: &'a mut dyn ActionHook,
}

impl<'a> Exchange<'a> {
    pub fn new(
        request: &'a mut Request,
        response: &'a mut Response,
        hook: &'a mut dyn ActionHook,
    ) -> Self {
        Self {
            request,
            response,
            hook,
        }
    }

    pub fn request(&self) -> &Request {
        &*self.request
    }

    pub fn response(&self) -> &Response {
        &*self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut *self.response
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectorError> {
        self.hook.read_body(self.request, buf)
    }

    /// Reads the rest of the request body.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, ConnectorError> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), ExchangeError> {
        self.response.set_status(status)
    }

    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ExchangeError> {
        self.response.add_header(name, value)
    }

    pub fn commit(&mut self) -> Result<(), ConnectorError> {
        self.hook.commit(self.request, self.response)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectorError> {
        if self.response.is_finished() {
            return Err(ExchangeError::Finished.into());
        }
        self.hook.write_body(self.request, self.response, bytes)
    }

    pub fn finish(&mut self) -> Result<(), ConnectorError> {
        self.hook.finish(self.request, self.response)
    }
}

/// The pooled unit: a request with its paired response.
#[derive(Debug, Default)]
pub struct ExchangePair {
    pub request: Request,
    pub response: Response,
}

impl Recycle for ExchangePair {
    fn recycle(&mut self) {
        self.request.reset();
        self.response.reset();
    }
}
