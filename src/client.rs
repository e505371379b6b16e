//! Front-end side of AJP13.
//!
//! [`AjpClient`] plays the role a web server plays in front of the connector: it forwards
//! requests, feeds request bodies when asked and collects the response packets. The CLI
//! and the integration tests use it to talk to a running connector.
use std::{
    net::{TcpStream, ToSocketAddrs},
    os::unix::net::UnixStream,
    path::Path,
};

use log::debug;

use crate::protocol::{
    Direction, ForwardRequest, FramingError, Message, PacketCodec, ProtocolTransport, Transport,
    TransportError, error::ConnectorError,
};

/// Everything the connector sent back for one forwarded request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AjpResponse {
    pub status: u16,
    pub message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Whether the connector will serve another request on this connection.
    pub reuse: bool,
}

impl AjpResponse {
    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl ForwardRequest {
    /// A body-less request for `uri` with a `Host` header, ready to be forwarded.
    pub fn new(method: &str, uri: &str, host: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (uri, None),
        };
        Self {
            method: method.to_owned(),
            protocol: Some("HTTP/1.1".to_owned()),
            request_uri: Some(path.to_owned()),
            remote_addr: Some("127.0.0.1".to_owned()),
            server_name: Some(host.to_owned()),
            server_port: 80,
            query_string: query,
            headers: vec![("host".to_owned(), host.to_owned())],
            ..Default::default()
        }
    }
}

pub struct AjpClient<T: Transport> {
    io: ProtocolTransport<T>,
}

impl AjpClient<TcpStream> {
    pub fn connect(addr: impl ToSocketAddrs, codec: PacketCodec) -> Result<Self, ConnectorError> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self::new(stream, codec))
    }
}

impl AjpClient<UnixStream> {
    pub fn connect_unix(path: impl AsRef<Path>, codec: PacketCodec) -> Result<Self, ConnectorError> {
        let stream = UnixStream::connect(path)?;
        Ok(Self::new(stream, codec))
    }
}

impl<T: Transport> AjpClient<T> {
    pub fn new(transport: T, codec: PacketCodec) -> Self {
        Self {
            io: ProtocolTransport::new(transport, codec),
        }
    }

    pub fn transport(&self) -> &T {
        self.io.get_ref()
    }

    /// Sends a CPing and waits for the CPong.
    pub fn ping(&mut self) -> Result<(), ConnectorError> {
        self.io.write_message(&Message::CPing)?;
        self.io.flush()?;
        match self.next_message()? {
            Message::CPong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Forwards `request` and feeds `body` to the connector as it asks for it.
    ///
    /// With a `Content-Length` header the first chunk goes out right behind the request;
    /// otherwise the body is only sent on demand and closed with an empty packet.
    pub fn forward(&mut self, request: &ForwardRequest, body: &[u8]) -> Result<AjpResponse, ConnectorError> {
        let known_length = request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-length"));

        self.io
            .write_message(&Message::ForwardRequest(Box::new(request.clone())))?;
        let mut remaining = body;
        if known_length && !remaining.is_empty() {
            let first = remaining.len().min(self.io.codec().max_read_chunk());
            self.io.write_body(&remaining[..first])?;
            remaining = &remaining[first..];
        }
        self.io.flush()?;

        let mut response = AjpResponse::default();
        loop {
            match self.next_message()? {
                Message::SendHeaders(headers) => {
                    response.status = headers.status;
                    response.message = headers.message;
                    response.headers = headers.headers;
                }
                Message::SendBodyChunk(chunk) => response.body.extend_from_slice(&chunk),
                Message::GetBodyChunk { length } => {
                    let n = remaining
                        .len()
                        .min(usize::from(length))
                        .min(self.io.codec().max_read_chunk());
                    self.io.write_body(&remaining[..n])?;
                    self.io.flush()?;
                    remaining = &remaining[n..];
                }
                Message::EndResponse { reuse } => {
                    response.reuse = reuse;
                    debug!(
                        "{} {:?} -> {} ({} body bytes)",
                        request.method,
                        request.request_uri,
                        response.status,
                        response.body.len()
                    );
                    return Ok(response);
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    /// Asks the connector to stop serving.
    pub fn shutdown(&mut self) -> Result<(), ConnectorError> {
        self.io.write_message(&Message::Shutdown)?;
        self.io.flush()
    }

    pub fn close(&mut self) -> Result<(), ConnectorError> {
        self.io.close()
    }

    fn next_message(&mut self) -> Result<Message, ConnectorError> {
        self.io
            .read_message(Direction::ToServer)?
            .ok_or_else(|| TransportError::Closed.into())
    }
}

fn unexpected(message: &Message) -> ConnectorError {
    FramingError::UnexpectedType {
        direction: Direction::ToServer,
        code: message.kind(),
    }
    .into()
}
