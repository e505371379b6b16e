use std::io::{self, Write};
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::exchange::{
    ActionHook, Adapter, BodyLengthPolicy, Environment, Exchange, ExchangeError, ExchangePair,
    Request, Response, invoke, status,
};
use crate::pool::{Lease, ObjectPool};
use crate::protocol::{
    ProcessorState, ReceiveOutcome, Transport, TransportError, error::ConnectorError,
};

use super::filters::{ChunkedDecoder, LAST_CHUNK, encode_chunk};
use super::parser::{
    HTTP_11, bad_request, parse_header_line, parse_host, parse_request_line,
};

pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192;

/// How the request body is delimited.
#[derive(Debug, Clone, Copy)]
enum InputMode {
    /// `Content-Length` bytes, tracked by the request's available counter.
    Identity,
    /// Everything until the client closes (HTTP/1.0 without a length).
    UntilClose,
    Chunked(ChunkedDecoder),
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    /// `Content-Length` delimited; holds the bytes still allowed out.
    Identity(u64),
    Chunked,
    UntilClose,
    /// HEAD requests and statuses that forbid a body.
    Discard,
}

/// Drives one HTTP/1.1 connection through repeated request/response cycles.
pub struct Http11Processor<T: Transport> {
    stream: T,
    inbound: Vec<u8>,
    start: usize,
    end: usize,
    outbound: Vec<u8>,
    max_header_size: usize,
    server_header: Option<String>,
    state: ProcessorState,
    keep_alive: bool,
    http09: bool,
    http11: bool,
    head: bool,
    expect_continue: bool,
    input: InputMode,
    output: OutputMode,
}

impl<T: Transport> Http11Processor<T> {
    pub fn new(transport: T) -> Self {
        Self::with_buffer(transport, Vec::new())
    }

    /// Uses `buffer` (typically pooled) for outgoing bytes.
    pub fn with_buffer(transport: T, buffer: Vec<u8>) -> Self {
        Self {
            stream: transport,
            inbound: vec![0; DEFAULT_MAX_HEADER_SIZE],
            start: 0,
            end: 0,
            outbound: buffer,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            server_header: None,
            state: ProcessorState::AwaitingRequest,
            keep_alive: true,
            http09: false,
            http11: true,
            head: false,
            expect_continue: false,
            input: InputMode::Identity,
            output: OutputMode::Identity(0),
        }
    }

    /// Limit on the request line plus headers of one request.
    pub fn with_max_header_size(mut self, max: usize) -> Self {
        self.max_header_size = max;
        self.inbound.resize(max.max(DEFAULT_MAX_HEADER_SIZE), 0);
        self
    }

    /// Value of the `Server` header added to responses that do not set one.
    pub fn with_server_header(mut self, server: Option<String>) -> Self {
        self.server_header = server;
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.stream
    }

    pub fn into_parts(self) -> (T, Vec<u8>) {
        (self.stream, self.outbound)
    }

    /// Serves requests until the client closes the connection or one of them cannot be
    /// kept alive. The transport is closed on every exit path.
    pub fn process(
        &mut self,
        adapter: &dyn Adapter,
        pool: &Arc<ObjectPool<ExchangePair>>,
    ) -> Result<ReceiveOutcome, ConnectorError> {
        let result = self.serve(adapter, pool);
        self.close();
        result
    }

    fn serve(
        &mut self,
        adapter: &dyn Adapter,
        pool: &Arc<ObjectPool<ExchangePair>>,
    ) -> Result<ReceiveOutcome, ConnectorError> {
        loop {
            let mut pair = pool.lease();
            match self.receive_next_request(&mut pair.request) {
                Ok(ReceiveOutcome::Request) => {}
                Ok(outcome) => return Ok(outcome),
                Err(ConnectorError::BadRequest { status, reason }) => {
                    warn!("rejecting request with {status}: {reason}");
                    self.send_error(status)?;
                    return Err(ConnectorError::BadRequest { status, reason });
                }
                Err(e) => return Err(e),
            }

            let ExchangePair { request, response } = &mut *pair;
            self.service(adapter, request, response)?;
            if self.keep_alive {
                if let Err(e) = self.drain(request) {
                    debug!("could not drain the request body: {e}");
                    self.keep_alive = false;
                }
            }
            if !self.keep_alive {
                return Ok(ReceiveOutcome::Closed);
            }
            self.recycle(pair);
        }
    }

    /// Parses the next request line and header block into `request`.
    pub fn receive_next_request(
        &mut self,
        request: &mut Request,
    ) -> Result<ReceiveOutcome, ConnectorError> {
        self.state = ProcessorState::AwaitingRequest;
        let result = self.receive(request);
        self.state = match result {
            Ok(ReceiveOutcome::Request) => ProcessorState::HeadersParsed,
            _ => ProcessorState::Closed,
        };
        result
    }

    fn receive(&mut self, request: &mut Request) -> Result<ReceiveOutcome, ConnectorError> {
        let mut budget = self.max_header_size;
        let line = loop {
            match self.read_line(&mut budget)? {
                None => return Ok(ReceiveOutcome::Closed),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };
        let request_line = parse_request_line(&line)?;
        self.http09 = request_line.is_http09();
        self.http11 = request_line.is_http11();
        self.keep_alive = self.http11;

        if !self.http09 {
            loop {
                let line = self
                    .read_line(&mut budget)?
                    .ok_or(TransportError::Closed)?;
                if line.is_empty() {
                    break;
                }
                if line.starts_with([' ', '\t']) {
                    return Err(bad_request(400, "folded header lines are not accepted"));
                }
                let (name, value) = parse_header_line(&line)?;
                request
                    .add_header(name, value)
                    .map_err(|e| bad_request(400, e.to_string()))?;
            }
        }

        let secure = self.stream.tls_info().is_some();
        let peer = self.stream.peer();
        let env = Environment {
            method: request_line.method,
            request_uri: request_line.uri,
            protocol: request_line.protocol,
            secure,
            remote_host: peer.clone(),
            remote_addr: peer,
            ..Default::default()
        };
        request
            .populate_from_environment(env)
            .map_err(|e| bad_request(400, e.to_string()))?;
        request.split_query();
        if let Some(info) = self.stream.tls_info() {
            request.ingest_tls(info);
        }

        match request.header("host").map(str::to_owned) {
            Some(host) => {
                let (name, port) = parse_host(&host, secure)?;
                request.set_server(name, port);
            }
            None if self.http11 => return Err(bad_request(400, "missing Host header")),
            None => {}
        }

        if let Some(connection) = request.header("connection") {
            for token in connection.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    self.keep_alive = false;
                } else if token.eq_ignore_ascii_case("keep-alive") && !self.http09 {
                    self.keep_alive = true;
                }
            }
        }

        self.input = self.input_mode(request)?;
        self.head = request.method() == "HEAD";
        self.expect_continue = self.http11
            && request
                .header("expect")
                .is_some_and(|v| v.to_ascii_lowercase().contains("100-continue"));

        debug!(
            "{} {} {} from {}",
            request.method(),
            request.request_uri(),
            request.protocol(),
            request.remote_addr()
        );
        Ok(ReceiveOutcome::Request)
    }

    fn input_mode(&mut self, request: &mut Request) -> Result<InputMode, ConnectorError> {
        let coding = match request.header("transfer-encoding") {
            Some(value) if self.http11 => value
                .split(',')
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty() && c != "identity")
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };

        match coding.as_slice() {
            [] => {}
            [chunked] if chunked == "chunked" => {
                request.set_body_policy(BodyLengthPolicy::Unbounded);
                return Ok(InputMode::Chunked(ChunkedDecoder::new()));
            }
            _ => {
                return Err(bad_request(
                    501,
                    format!("unsupported transfer coding {}", coding.join(", ")),
                ));
            }
        }

        if let BodyLengthPolicy::KnownLength(_) = request.body_policy() {
            return Ok(InputMode::Identity);
        }
        if self.http11 || self.http09 {
            request.set_body_policy(BodyLengthPolicy::KnownLength(0));
            return Ok(InputMode::Identity);
        }
        self.keep_alive = false;
        Ok(InputMode::UntilClose)
    }

    /// Reads one line, without its terminator, charging it to `budget`. `None` when the
    /// stream ends before the line starts.
    fn read_line(&mut self, budget: &mut usize) -> Result<Option<String>, ConnectorError> {
        loop {
            let pending = &self.inbound[self.start..self.end];
            if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                if pos + 1 > *budget {
                    return Err(bad_request(400, "request header section too large"));
                }
                *budget -= pos + 1;
                let line = pending[..pos].strip_suffix(b"\r").unwrap_or(&pending[..pos]);
                let line = std::str::from_utf8(line)
                    .map_err(|_| bad_request(400, "request header is not valid UTF-8"))?
                    .to_owned();
                self.start += pos + 1;
                return Ok(Some(line));
            }
            if pending.len() >= *budget {
                return Err(bad_request(400, "request header section too large"));
            }
            if self.fill()? == 0 {
                if self.start == self.end {
                    return Ok(None);
                }
                return Err(TransportError::Closed.into());
            }
        }
    }

    /// Reads more bytes from the stream after the buffered ones.
    fn fill(&mut self) -> Result<usize, ConnectorError> {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.end == self.inbound.len() {
            self.inbound.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.inbound.len() {
            return Err(bad_request(400, "request header section too large"));
        }
        loop {
            match self.stream.read(&mut self.inbound[self.end..]) {
                Ok(n) => {
                    self.end += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e).into()),
            }
        }
    }

    /// Serves buffered bytes first, then reads straight from the stream.
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnectorError> {
        if self.start < self.end {
            let n = buf.len().min(self.end - self.start);
            buf[..n].copy_from_slice(&self.inbound[self.start..self.start + n]);
            self.start += n;
            return Ok(n);
        }
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e).into()),
            }
        }
    }

    /// Reads request body bytes. Returns 0 at the end of the body.
    pub fn do_read(&mut self, request: &mut Request, buf: &mut [u8]) -> Result<usize, ConnectorError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.expect_continue && !request.is_body_exhausted() {
            self.expect_continue = false;
            self.send(b"HTTP/1.1 100 Continue\r\n\r\n")?;
            self.stream.flush().map_err(TransportError::Io)?;
        }
        if self.state == ProcessorState::ApplicationProcessing {
            self.state = ProcessorState::BodyInProgress;
        }

        match self.input {
            InputMode::Identity => {
                let wanted = request.readable(buf.len());
                if wanted == 0 {
                    return Ok(0);
                }
                let n = self.read_raw(&mut buf[..wanted])?;
                if n == 0 {
                    return Err(TransportError::Closed.into());
                }
                request.consume(n);
                Ok(n)
            }
            InputMode::UntilClose => self.read_raw(buf),
            InputMode::Chunked(mut decoder) => {
                let result = self.read_chunked(&mut decoder, buf);
                self.input = InputMode::Chunked(decoder);
                result
            }
        }
    }

    fn read_chunked(
        &mut self,
        decoder: &mut ChunkedDecoder,
        buf: &mut [u8],
    ) -> Result<usize, ConnectorError> {
        loop {
            if decoder.is_done() {
                return Ok(0);
            }
            if self.start == self.end && self.fill()? == 0 {
                return Err(TransportError::Closed.into());
            }
            let (consumed, produced) = decoder.decode(&self.inbound[self.start..self.end], buf)?;
            self.start += consumed;
            if produced > 0 {
                return Ok(produced);
            }
        }
    }

    /// Discards whatever the application left unread so the next request can be parsed.
    fn drain(&mut self, request: &mut Request) -> Result<(), ConnectorError> {
        let mut scratch = [0u8; 4096];
        while self.do_read(request, &mut scratch)? > 0 {}
        Ok(())
    }

    /// Writes the status line and headers. Only the first call writes anything.
    pub fn end_headers(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError> {
        if response.is_committed() {
            return Ok(());
        }
        if self.http09 {
            response.mark_committed();
            self.output = OutputMode::UntilClose;
            self.state = ProcessorState::ResponseHeadersCommitted;
            return Ok(());
        }

        // A body the client is still waiting to be invited to send cannot be drained.
        if self.expect_continue && !request.is_body_exhausted() {
            self.keep_alive = false;
        }
        if response
            .headers()
            .get("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            self.keep_alive = false;
        }

        let mut extra: Vec<(&str, String)> = Vec::new();
        self.output = if self.head || status::forbids_body(response.status()) {
            OutputMode::Discard
        } else if let Some(length) = response.content_length() {
            OutputMode::Identity(length)
        } else if self.http11 {
            extra.push(("Transfer-Encoding", "chunked".to_owned()));
            OutputMode::Chunked
        } else {
            self.keep_alive = false;
            OutputMode::UntilClose
        };
        if let Some(server) = &self.server_header {
            if !response.headers().contains("server") {
                extra.push(("Server", server.clone()));
            }
        }
        if !response.headers().contains("connection") {
            if !self.keep_alive {
                extra.push(("Connection", "close".to_owned()));
            } else if !self.http11 {
                extra.push(("Connection", "keep-alive".to_owned()));
            }
        }

        response.mark_committed();
        self.state = ProcessorState::ResponseHeadersCommitted;

        self.outbound.clear();
        // Writing into a Vec cannot fail.
        let _ = write!(
            self.outbound,
            "{HTTP_11} {} {}\r\n",
            response.status(),
            response.message()
        );
        for (name, value) in response.headers().iter() {
            let _ = write!(self.outbound, "{name}: {value}\r\n");
        }
        for (name, value) in &extra {
            let _ = write!(self.outbound, "{name}: {value}\r\n");
        }
        self.outbound.extend_from_slice(b"\r\n");
        trace!("-> {} header bytes", self.outbound.len());
        self.flush_outbound()
    }

    /// Writes response body bytes in the delimiting mode chosen at commit.
    pub fn do_write(
        &mut self,
        request: &Request,
        response: &mut Response,
        bytes: &[u8],
    ) -> Result<(), ConnectorError> {
        if response.is_finished() {
            return Err(ExchangeError::Finished.into());
        }
        self.end_headers(request, response)?;
        if bytes.is_empty() {
            return Ok(());
        }

        self.state = ProcessorState::ResponseBodyInProgress;
        let written = match self.output {
            OutputMode::Discard => return Ok(()),
            OutputMode::Identity(remaining) => {
                // Bytes past the declared length are dropped.
                let allowed = usize::try_from(remaining).map_or(bytes.len(), |r| r.min(bytes.len()));
                if allowed < bytes.len() {
                    debug!(
                        "dropping {} body bytes past the declared content length",
                        bytes.len() - allowed
                    );
                }
                if allowed > 0 {
                    self.send(&bytes[..allowed])?;
                }
                self.output = OutputMode::Identity(remaining - allowed as u64);
                allowed
            }
            OutputMode::UntilClose => {
                self.send(bytes)?;
                bytes.len()
            }
            OutputMode::Chunked => {
                self.outbound.clear();
                encode_chunk(bytes, &mut self.outbound);
                self.flush_outbound()?;
                bytes.len()
            }
        };
        response.record_written(written);
        Ok(())
    }

    /// Ends the response. Only the first call writes the chunked terminator.
    pub fn finish(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError> {
        if response.is_finished() {
            return Ok(());
        }
        self.end_headers(request, response)?;
        response.mark_finished();
        match self.output {
            OutputMode::Chunked => self.send(LAST_CHUNK)?,
            OutputMode::Identity(remaining) if remaining > 0 => {
                debug!("response ended {remaining} bytes short of its content length");
                self.keep_alive = false;
            }
            _ => {}
        }
        self.stream.flush().map_err(TransportError::Io)?;
        self.state = ProcessorState::ResponseFinished;
        Ok(())
    }

    /// Returns the pair to its pool and clears per-exchange protocol state.
    pub fn recycle(&mut self, pair: Lease<ExchangePair>) {
        drop(pair);
        self.head = false;
        self.expect_continue = false;
        self.input = InputMode::Identity;
        self.output = OutputMode::Identity(0);
        self.state = ProcessorState::Recycled;
    }

    fn service(
        &mut self,
        adapter: &dyn Adapter,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), ConnectorError> {
        self.state = ProcessorState::ApplicationProcessing;
        let outcome = invoke(adapter, &mut Exchange::new(request, response, &mut *self));

        let reason = match outcome {
            Ok(()) => return self.finish(request, response),
            Err(reason) => reason,
        };
        error!(
            "{} {} failed: {reason}",
            request.method(),
            request.request_uri()
        );
        self.keep_alive = false;
        if response.reset_to_error(500).is_ok() {
            let delivered = response
                .add_header("Content-Length", "0")
                .map_err(ConnectorError::from)
                .and_then(|()| self.finish(request, response));
            if let Err(e) = delivered {
                debug!("could not deliver the error response: {e}");
            }
        }
        Err(ConnectorError::Application(reason))
    }

    fn send_error(&mut self, status: u16) -> Result<(), ConnectorError> {
        let reason = status::reason_phrase(status).unwrap_or("Error");
        self.outbound.clear();
        let _ = write!(
            self.outbound,
            "{HTTP_11} {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        self.flush_outbound()?;
        self.stream.flush().map_err(TransportError::Io)?;
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectorError> {
        self.stream.write_all(bytes).map_err(TransportError::Io)?;
        Ok(())
    }

    fn flush_outbound(&mut self) -> Result<(), ConnectorError> {
        self.stream
            .write_all(&self.outbound)
            .map_err(TransportError::Io)?;
        Ok(())
    }

    fn close(&mut self) {
        self.state = ProcessorState::Closed;
        if let Err(e) = self.stream.close() {
            debug!("error closing connection: {e}");
        }
    }
}

impl<T: Transport> ActionHook for Http11Processor<T> {
    fn read_body(&mut self, request: &mut Request, buf: &mut [u8]) -> Result<usize, ConnectorError> {
        self.do_read(request, buf)
    }

    fn commit(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError> {
        self.end_headers(request, response)
    }

    fn write_body(
        &mut self,
        request: &Request,
        response: &mut Response,
        chunk: &[u8],
    ) -> Result<(), ConnectorError> {
        self.do_write(request, response, chunk)
    }

    fn finish(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError> {
        Http11Processor::finish(self, request, response)
    }
}
