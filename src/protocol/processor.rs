use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::exchange::{
    ActionHook, Adapter, Environment, Exchange, ExchangeError, ExchangePair, Request, Response,
    TlsDetails, invoke,
};
use crate::pool::{Lease, ObjectPool};

use super::{
    Attribute, Direction, ForwardRequest, FramingError, Message, PacketCodec, ProtocolTransport,
    SendHeaders, Transport, error::ConnectorError,
};

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    AwaitingRequest,
    HeadersParsed,
    BodyInProgress,
    ApplicationProcessing,
    ResponseHeadersCommitted,
    ResponseBodyInProgress,
    ResponseFinished,
    Recycled,
    Closed,
}

/// Result of waiting for the next request on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A request was parsed into the supplied [`Request`].
    Request,
    /// The front-end asked the connector to stop serving.
    Shutdown,
    /// The peer closed the connection between requests.
    Closed,
}

/// Drives one AJP13 connection through repeated request/response cycles.
///
/// The processor is also the [`ActionHook`] of every exchange it hands to the adapter, so
/// body reads and response writes made by the application land here.
pub struct AjpProcessor<T: Transport> {
    io: ProtocolTransport<T>,
    state: ProcessorState,
    required_secret: Option<String>,
    trust_front_end_auth: bool,
    authenticated: bool,
    body: Vec<u8>,
    body_pos: usize,
    end_of_body: bool,
    keep_alive: bool,
}

impl<T: Transport> AjpProcessor<T> {
    pub fn new(transport: T, codec: PacketCodec) -> Self {
        Self::from_transport(ProtocolTransport::new(transport, codec))
    }

    /// Uses `buffer` as the packet buffer; see [`into_parts`](Self::into_parts).
    pub fn with_buffer(transport: T, codec: PacketCodec, buffer: Vec<u8>) -> Self {
        Self::from_transport(ProtocolTransport::with_buffer(transport, codec, buffer))
    }

    fn from_transport(io: ProtocolTransport<T>) -> Self {
        Self {
            io,
            state: ProcessorState::AwaitingRequest,
            required_secret: None,
            trust_front_end_auth: true,
            authenticated: false,
            body: Vec::new(),
            body_pos: 0,
            end_of_body: false,
            keep_alive: true,
        }
    }

    /// Rejects forward requests that do not carry this secret.
    pub fn with_required_secret(mut self, secret: Option<String>) -> Self {
        self.required_secret = secret;
        self
    }

    /// Whether remote user and auth type sent by the front-end are believed.
    pub fn with_trust_front_end_auth(mut self, trust: bool) -> Self {
        self.trust_front_end_auth = trust;
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn transport(&self) -> &T {
        self.io.get_ref()
    }

    pub fn into_parts(self) -> (T, Vec<u8>) {
        self.io.into_parts()
    }

    /// Serves requests until the peer closes the connection or asks for a shutdown.
    ///
    /// One [`ExchangePair`] is leased from `pool` per request. The transport is closed on
    /// every exit path.
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
            match self.receive_next_request(&mut pair.request)? {
                ReceiveOutcome::Request => {}
                outcome => return Ok(outcome),
            }

            let ExchangePair { request, response } = &mut *pair;
            self.service(adapter, request, response)?;
            if !self.keep_alive {
                return Ok(ReceiveOutcome::Closed);
            }
            self.recycle(pair);
        }
    }

    /// Blocks until the next forward request arrives and parses it into `request`.
    ///
    /// CPing packets met on the way are answered and skipped. Any error leaves the
    /// processor [`Closed`](ProcessorState::Closed).
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
        loop {
            let Some(message) = self.io.read_message(Direction::ToContainer)? else {
                debug!("peer closed the connection");
                return Ok(ReceiveOutcome::Closed);
            };
            match message {
                Message::CPing => {
                    self.io.write_message(&Message::CPong)?;
                    self.io.flush()?;
                }
                Message::Shutdown => {
                    if self.required_secret.is_some() && !self.authenticated {
                        warn!("ignoring shutdown from an unauthenticated connection");
                        return Err(ConnectorError::SecretMismatch);
                    }
                    debug!("shutdown requested");
                    return Ok(ReceiveOutcome::Shutdown);
                }
                Message::ForwardRequest(forward) => {
                    self.prepare(request, *forward)?;
                    return Ok(ReceiveOutcome::Request);
                }
                other => {
                    return Err(FramingError::UnexpectedType {
                        direction: Direction::ToContainer,
                        code: other.kind(),
                    }
                    .into());
                }
            }
        }
    }

    /// Fills `request` from a forward request.
    fn prepare(&mut self, request: &mut Request, forward: ForwardRequest) -> Result<(), ConnectorError> {
        self.check_secret(&forward.attributes)?;

        for (name, value) in forward.headers {
            request.add_header(name, value)?;
        }

        let mut tls = TlsDetails::default();
        let mut query_string = forward.query_string;
        let mut remote_user = forward.remote_user;
        let mut auth_type = forward.auth_type;
        for attribute in forward.attributes {
            match attribute {
                Attribute::RemoteUser(user) => remote_user = Some(user),
                Attribute::AuthType(kind) => auth_type = Some(kind),
                Attribute::QueryString(query) => query_string = Some(query),
                Attribute::Route(route) => request.set_route(route),
                Attribute::SslCert(chain) => tls.certificate_chain = Some(chain),
                Attribute::SslCipher(cipher) => tls.cipher_suite = Some(cipher),
                Attribute::SslSession(session) => tls.session_id = Some(session),
                Attribute::SslKeySize(size) => tls.key_size = Some(size),
                Attribute::Request { name, value } => request.set_attribute(name, value),
                other @ (Attribute::Context(_) | Attribute::ServletPath(_) | Attribute::Secret(_)) => {
                    trace!("ignoring attribute {}", other.code());
                }
            }
        }
        if !self.trust_front_end_auth {
            remote_user = None;
            auth_type = None;
        }

        let remote_addr = forward.remote_addr.or_else(|| self.io.get_ref().peer());
        let env = Environment {
            method: forward.method,
            request_uri: forward.request_uri.unwrap_or_default(),
            query_string,
            protocol: forward.protocol.unwrap_or_default(),
            scheme: forward.scheme,
            secure: forward.is_secure || !tls.is_empty(),
            remote_host: forward.remote_host.or_else(|| remote_addr.clone()),
            remote_addr,
            server_name: forward.server_name,
            server_port: forward.server_port,
            auth_type,
            remote_user,
        };
        request.populate_from_environment(env)?;
        request.split_query();

        if !tls.is_empty() {
            request.ingest_tls(&tls);
        } else if let Some(info) = self.io.get_ref().tls_info() {
            request.ingest_tls(info);
        }

        debug!(
            "{} {} {} from {}",
            request.method(),
            request.request_uri(),
            request.protocol(),
            request.remote_addr()
        );

        // The front-end sends the first body chunk unasked when the length is known.
        if request.available().is_some_and(|n| n > 0) {
            self.receive_chunk()?;
        }
        Ok(())
    }

    fn check_secret(&mut self, attributes: &[Attribute]) -> Result<(), ConnectorError> {
        let Some(required) = &self.required_secret else {
            return Ok(());
        };
        let presented = attributes.iter().find_map(|attribute| match attribute {
            Attribute::Secret(secret) => Some(secret),
            _ => None,
        });
        if presented != Some(required) {
            warn!("forward request with a missing or wrong secret");
            return Err(ConnectorError::SecretMismatch);
        }
        self.authenticated = true;
        Ok(())
    }

    /// Reads one request-body packet into the body buffer. False at end of body.
    fn receive_chunk(&mut self) -> Result<bool, ConnectorError> {
        let chunk = self.io.read_body()?;
        self.body.clear();
        self.body.extend_from_slice(chunk);
        self.body_pos = 0;
        if self.body.is_empty() {
            self.end_of_body = true;
            return Ok(false);
        }
        Ok(true)
    }

    /// Serves body bytes to the application, asking the front-end for more when the
    /// buffered chunk is used up. Returns 0 once the body is exhausted.
    pub fn do_read(&mut self, request: &mut Request, buf: &mut [u8]) -> Result<usize, ConnectorError> {
        if buf.is_empty() || self.end_of_body || request.is_body_exhausted() {
            return Ok(0);
        }
        if self.state == ProcessorState::ApplicationProcessing {
            self.state = ProcessorState::BodyInProgress;
        }

        if self.body_pos >= self.body.len() {
            let wanted = request.readable(self.io.codec().max_read_chunk());
            let length = u16::try_from(wanted).unwrap_or(u16::MAX);
            self.io.write_message(&Message::GetBodyChunk { length })?;
            self.io.flush()?;
            if !self.receive_chunk()? {
                return Ok(0);
            }
        }

        let n = request
            .readable(buf.len())
            .min(self.body.len() - self.body_pos);
        buf[..n].copy_from_slice(&self.body[self.body_pos..self.body_pos + n]);
        self.body_pos += n;
        request.consume(n);
        Ok(n)
    }

    /// Sends the response status and headers. Only the first call writes anything.
    ///
    /// HTTP/0.9 responses have no header block, so for them the call only marks the
    /// response committed.
    pub fn end_headers(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError> {
        if !response.mark_committed() {
            return Ok(());
        }
        self.state = ProcessorState::ResponseHeadersCommitted;
        if request.protocol().eq_ignore_ascii_case("HTTP/0.9") {
            return Ok(());
        }

        let headers = SendHeaders {
            status: response.status(),
            message: Some(response.message()),
            headers: response
                .headers()
                .iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
        };
        self.io.write_message(&Message::SendHeaders(headers))
    }

    /// Writes response body bytes, split into packets of at most the largest body chunk.
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
        for chunk in bytes.chunks(self.io.codec().max_body_chunk()) {
            self.io.write_body_chunk(chunk)?;
            response.record_written(chunk.len());
        }
        Ok(())
    }

    /// Ends the response. Only the first call sends an end-response packet.
    pub fn finish(&mut self, request: &Request, response: &mut Response) -> Result<(), ConnectorError> {
        if response.is_finished() {
            return Ok(());
        }
        self.end_headers(request, response)?;
        response.mark_finished();
        self.io.write_message(&Message::EndResponse {
            reuse: self.keep_alive,
        })?;
        self.io.flush()?;
        self.state = ProcessorState::ResponseFinished;
        Ok(())
    }

    /// Returns the pair to its pool and clears per-exchange protocol state.
    pub fn recycle(&mut self, pair: Lease<ExchangePair>) {
        drop(pair);
        self.body.clear();
        self.body_pos = 0;
        self.end_of_body = false;
        self.state = ProcessorState::Recycled;
        trace!("exchange recycled");
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
        self.abort(request, response);
        Err(ConnectorError::Application(reason))
    }

    /// Ends a failed exchange. A 500 is sent if the headers are still unsent; the
    /// connection is closed either way.
    fn abort(&mut self, request: &Request, response: &mut Response) {
        self.keep_alive = false;
        if response.reset_to_error(500).is_err() {
            return;
        }
        if let Err(e) = self.finish(request, response) {
            debug!("could not deliver the error response: {e}");
        }
    }

    fn close(&mut self) {
        self.state = ProcessorState::Closed;
        if let Err(e) = self.io.close() {
            debug!("error closing connection: {e}");
        }
    }
}

impl<T: Transport> ActionHook for AjpProcessor<T> {
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
        AjpProcessor::finish(self, request, response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::exchange::{BodyLengthPolicy, ServiceError, tls};
    use crate::protocol::MemoryTransport;

    fn codec() -> PacketCodec {
        PacketCodec::default()
    }

    fn pool() -> Arc<ObjectPool<ExchangePair>> {
        Arc::new(ObjectPool::new(4))
    }

    fn forward(method: &str, uri: &str, headers: &[(&str, &str)]) -> ForwardRequest {
        ForwardRequest {
            method: method.to_owned(),
            protocol: Some("HTTP/1.1".to_owned()),
            request_uri: Some(uri.to_owned()),
            remote_addr: Some("10.0.0.1".to_owned()),
            server_name: Some("localhost".to_owned()),
            server_port: 80,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn input(packets: &[Message]) -> Vec<u8> {
        packets
            .iter()
            .flat_map(|message| codec().encode(message).unwrap())
            .collect()
    }

    fn with_body(mut bytes: Vec<u8>, chunks: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for chunk in chunks {
            codec().encode_body_into(chunk, &mut buf).unwrap();
            bytes.extend_from_slice(&buf);
        }
        bytes
    }

    fn request_packet(forward: ForwardRequest) -> Message {
        Message::ForwardRequest(Box::new(forward))
    }

    fn responses(output: &[u8]) -> Vec<Message> {
        let mut reader = ProtocolTransport::new(MemoryTransport::new(output.to_vec()), codec());
        let mut messages = Vec::new();
        while let Some(message) = reader.read_message(Direction::ToServer).unwrap() {
            messages.push(message);
        }
        messages
    }

    fn run(
        processor: &mut AjpProcessor<MemoryTransport>,
        adapter: &dyn Adapter,
    ) -> Result<ReceiveOutcome, ConnectorError> {
        processor.process(adapter, &pool())
    }

    fn text_headers(status: u16, message: &str) -> Message {
        Message::SendHeaders(SendHeaders {
            status,
            message: Some(message.to_owned()),
            headers: vec![("Content-Type".to_owned(), "text/plain".to_owned())],
        })
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl Adapter for Recording {
        fn service(&self, exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
            let request = exchange.request();
            self.seen.lock().unwrap().push((
                request.request_uri().to_owned(),
                request.query_string().to_owned(),
                request.header("Host").map(str::to_owned),
            ));
            exchange.set_status(200)?;
            exchange.add_header("Content-Type", "text/plain")?;
            exchange.write(b"hi")?;
            Ok(())
        }
    }

    #[test]
    fn serves_a_get_request() {
        let bytes = input(&[request_packet(forward(
            "GET",
            "/hello?x=1",
            &[("Host", "localhost")],
        ))]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());
        let adapter = Recording::default();

        assert_eq!(run(&mut processor, &adapter).unwrap(), ReceiveOutcome::Closed);

        assert_eq!(
            adapter.seen.lock().unwrap().as_slice(),
            &[(
                "/hello".to_owned(),
                "x=1".to_owned(),
                Some("localhost".to_owned())
            )]
        );
        assert_eq!(
            responses(processor.transport().output()),
            vec![
                text_headers(200, "OK"),
                Message::SendBodyChunk(b"hi".to_vec()),
                Message::EndResponse { reuse: true },
            ]
        );
        assert!(processor.transport().is_closed());
        assert_eq!(processor.state(), ProcessorState::Closed);
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Adapter for Counting {
        fn service(&self, _: &mut Exchange<'_>) -> Result<(), ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn shutdown_skips_the_adapter() {
        let adapter = Counting::default();
        let bytes = input(&[Message::Shutdown]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        let outcome = processor.process(&adapter, &pool()).unwrap();

        assert_eq!(outcome, ReceiveOutcome::Shutdown);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        assert!(processor.transport().output().is_empty());
        assert!(processor.transport().is_closed());
    }

    #[test]
    fn receive_reports_shutdown_and_close() {
        let bytes = input(&[Message::Shutdown]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());
        let mut request = Request::new();
        assert_eq!(
            processor.receive_next_request(&mut request).unwrap(),
            ReceiveOutcome::Shutdown
        );
        assert_eq!(processor.state(), ProcessorState::Closed);

        let mut processor = AjpProcessor::new(MemoryTransport::default(), codec());
        assert_eq!(
            processor.receive_next_request(&mut request).unwrap(),
            ReceiveOutcome::Closed
        );
    }

    #[test]
    fn framing_error_closes() {
        let mut bytes = input(&[request_packet(forward("GET", "/", &[]))]);
        bytes[0] = 0x99;
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());
        let mut request = Request::new();

        let err = processor.receive_next_request(&mut request).unwrap_err();
        assert!(matches!(err, ConnectorError::Framing(FramingError::BadMagic(_))));
        assert_eq!(processor.state(), ProcessorState::Closed);
    }

    #[test]
    fn cping_is_answered_while_waiting() {
        let bytes = input(&[Message::CPing, Message::CPing]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        let outcome = run(&mut processor, &Recording::default()).unwrap();

        assert_eq!(outcome, ReceiveOutcome::Closed);
        assert_eq!(
            responses(processor.transport().output()),
            vec![Message::CPong, Message::CPong]
        );
    }

    fn read_byte_by_byte(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        let mut body = Vec::new();
        let mut byte = [0u8; 1];
        let mut last = exchange.request().available();
        while exchange.read(&mut byte)? == 1 {
            body.push(byte[0]);
            let now = exchange.request().available();
            assert!(now < last);
            last = now;
        }
        assert_eq!(exchange.request().available(), Some(0));
        assert_eq!(exchange.read(&mut byte)?, 0);
        exchange.add_header("Content-Type", "text/plain")?;
        exchange.write(&body)?;
        Ok(())
    }

    #[test]
    fn known_length_body_is_pulled_on_demand() {
        let bytes = input(&[request_packet(forward(
            "POST",
            "/upload",
            &[("Content-Length", "5")],
        ))]);
        let bytes = with_body(bytes, &[b"hel", b"lo"]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        run(&mut processor, &read_byte_by_byte).unwrap();

        assert_eq!(
            responses(processor.transport().output()),
            vec![
                Message::GetBodyChunk { length: 2 },
                text_headers(200, "OK"),
                Message::SendBodyChunk(b"hello".to_vec()),
                Message::EndResponse { reuse: true },
            ]
        );
    }

    fn echo(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        let mut body = Vec::new();
        exchange.read_to_end(&mut body)?;
        assert_eq!(exchange.request().body_policy(), BodyLengthPolicy::Unbounded);
        assert_eq!(exchange.read(&mut [0u8; 8])?, 0);
        exchange.write(&body)?;
        Ok(())
    }

    #[test]
    fn unbounded_body_reads_until_empty_packet() {
        let bytes = input(&[request_packet(forward("POST", "/stream", &[]))]);
        let bytes = with_body(bytes, &[b"abc", b"de", b""]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        run(&mut processor, &echo).unwrap();

        let max = codec().max_read_chunk() as u16;
        assert_eq!(
            responses(processor.transport().output()),
            vec![
                Message::GetBodyChunk { length: max },
                Message::GetBodyChunk { length: max },
                Message::GetBodyChunk { length: max },
                Message::SendHeaders(SendHeaders {
                    status: 200,
                    message: Some("OK".to_owned()),
                    headers: vec![],
                }),
                Message::SendBodyChunk(b"abcde".to_vec()),
                Message::EndResponse { reuse: true },
            ]
        );
    }

    fn commit_and_finish_twice(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        exchange.set_status(204)?;
        exchange.commit()?;
        exchange.commit()?;
        exchange.finish()?;
        exchange.finish()?;
        Ok(())
    }

    #[test]
    fn commit_and_finish_are_idempotent() {
        let bytes = input(&[request_packet(forward("GET", "/", &[]))]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        run(&mut processor, &commit_and_finish_twice).unwrap();

        assert_eq!(
            responses(processor.transport().output()),
            vec![
                Message::SendHeaders(SendHeaders {
                    status: 204,
                    message: Some("No Content".to_owned()),
                    headers: vec![],
                }),
                Message::EndResponse { reuse: true },
            ]
        );
    }

    fn fails_early(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        exchange.add_header("X-Partial", "1")?;
        Err("database unavailable".into())
    }

    fn fails_late(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        exchange.write(b"partial")?;
        Err("lost the rest".into())
    }

    fn panics(_: &mut Exchange<'_>) -> Result<(), ServiceError> {
        panic!("adapter bug");
    }

    #[test]
    fn application_error_before_commit_sends_500() {
        for adapter in [&fails_early as &dyn Adapter, &panics] {
            let bytes = input(&[
                request_packet(forward("GET", "/", &[])),
                request_packet(forward("GET", "/never", &[])),
            ]);
            let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

            let err = run(&mut processor, adapter).unwrap_err();

            assert!(matches!(err, ConnectorError::Application(_)));
            assert_eq!(
                responses(processor.transport().output()),
                vec![
                    Message::SendHeaders(SendHeaders {
                        status: 500,
                        message: Some("Internal Server Error".to_owned()),
                        headers: vec![],
                    }),
                    Message::EndResponse { reuse: false },
                ]
            );
            assert!(processor.transport().is_closed());
        }
    }

    #[test]
    fn application_error_after_commit_just_closes() {
        let bytes = input(&[request_packet(forward("GET", "/", &[]))]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        let err = run(&mut processor, &fails_late).unwrap_err();

        assert!(matches!(err, ConnectorError::Application(_)));
        let messages = responses(processor.transport().output());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], Message::SendBodyChunk(b"partial".to_vec()));
        assert!(processor.transport().is_closed());
    }

    fn large(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        exchange.write(&vec![b'x'; 20_000])?;
        Ok(())
    }

    #[test]
    fn large_writes_are_split() {
        let bytes = input(&[request_packet(forward("GET", "/big", &[]))]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        run(&mut processor, &large).unwrap();

        let sizes: Vec<usize> = responses(processor.transport().output())
            .into_iter()
            .filter_map(|message| match message {
                Message::SendBodyChunk(chunk) => Some(chunk.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![8184, 8184, 3632]);
    }

    #[test]
    fn pipelined_requests_reuse_pooled_pairs() {
        let bytes = input(&[
            request_packet(forward("GET", "/one?a=1", &[("Host", "a")])),
            request_packet(forward("GET", "/two", &[])),
        ]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());
        let adapter = Recording::default();
        let pool = pool();

        processor.process(&adapter, &pool).unwrap();

        assert_eq!(
            adapter.seen.lock().unwrap().as_slice(),
            &[
                ("/one".to_owned(), "a=1".to_owned(), Some("a".to_owned())),
                ("/two".to_owned(), String::new(), None),
            ]
        );
        assert_eq!(responses(processor.transport().output()).len(), 6);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn secret_is_enforced() {
        let bytes = input(&[request_packet(forward("GET", "/", &[]))]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec())
            .with_required_secret(Some("s3cret".to_owned()));

        let err = run(&mut processor, &Recording::default()).unwrap_err();
        assert!(matches!(err, ConnectorError::SecretMismatch));
        assert!(processor.transport().output().is_empty());

        let mut authorised = forward("GET", "/", &[]);
        authorised.attributes = vec![Attribute::Secret("s3cret".to_owned())];
        let bytes = input(&[request_packet(authorised), Message::Shutdown]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec())
            .with_required_secret(Some("s3cret".to_owned()));

        let outcome = run(&mut processor, &Recording::default()).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Shutdown);
    }

    #[test]
    fn unauthenticated_shutdown_is_refused() {
        let bytes = input(&[Message::Shutdown]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec())
            .with_required_secret(Some("s3cret".to_owned()));

        let err = run(&mut processor, &Recording::default()).unwrap_err();
        assert!(matches!(err, ConnectorError::SecretMismatch));
    }

    #[test]
    fn attributes_populate_the_request() {
        let mut secure = forward("GET", "/account", &[]);
        secure.remote_user = Some("front".to_owned());
        secure.attributes = vec![
            Attribute::SslCipher("TLS_AES_256_GCM_SHA384".to_owned()),
            Attribute::SslKeySize(256),
            Attribute::Route("node7".to_owned()),
            Attribute::Request {
                name: "JK_LB_ACTIVATION".to_owned(),
                value: "ACT".to_owned(),
            },
            Attribute::QueryString("page=2".to_owned()),
        ];
        let bytes = input(&[request_packet(secure)]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec())
            .with_trust_front_end_auth(false);
        let mut request = Request::new();

        processor.receive_next_request(&mut request).unwrap();

        assert_eq!(processor.state(), ProcessorState::HeadersParsed);
        assert_eq!(request.scheme(), "https");
        assert_eq!(request.attribute(tls::CIPHER_SUITE), Some("TLS_AES_256_GCM_SHA384"));
        assert_eq!(request.attribute(tls::KEY_SIZE), Some("256"));
        assert_eq!(request.attribute(tls::SESSION_ID), None);
        assert_eq!(request.attribute("JK_LB_ACTIVATION"), Some("ACT"));
        assert_eq!(request.route(), Some("node7"));
        assert_eq!(request.query_string(), "page=2");
        assert_eq!(request.remote_user(), None);
        assert_eq!(request.remote_host(), "10.0.0.1");
    }

    #[test]
    fn transport_tls_used_for_secure_requests() {
        let mut secure = forward("GET", "/", &[]);
        secure.is_secure = true;
        let bytes = input(&[request_packet(secure)]);
        let transport = MemoryTransport::new(bytes).with_tls(TlsDetails {
            session_id: Some("feed".to_owned()),
            ..Default::default()
        });
        let mut processor = AjpProcessor::new(transport, codec());
        let mut request = Request::new();

        processor.receive_next_request(&mut request).unwrap();

        assert_eq!(request.attribute(tls::SESSION_ID), Some("feed"));
    }

    fn plain_text(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
        exchange.write(b"old school")?;
        Ok(())
    }

    #[test]
    fn http09_has_no_header_packet() {
        let mut legacy = forward("GET", "/", &[]);
        legacy.protocol = Some("HTTP/0.9".to_owned());
        let bytes = input(&[request_packet(legacy)]);
        let mut processor = AjpProcessor::new(MemoryTransport::new(bytes), codec());

        run(&mut processor, &plain_text).unwrap();

        assert_eq!(
            responses(processor.transport().output()),
            vec![
                Message::SendBodyChunk(b"old school".to_vec()),
                Message::EndResponse { reuse: true },
            ]
        );
    }
}
