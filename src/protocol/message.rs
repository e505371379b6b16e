//! Typed AJP13 messages and their payload encoding.
//!
//! Payloads are written through bincode's [`Encoder`]/[`Decoder`] using the connector's
//! big-endian, fixed-width configuration, so every integer lands on the wire exactly as the
//! protocol lays it out. Strings and header names have wire shapes of their own and are
//! written by hand on top of the primitive encoders.
use bincode::{
    Decode, Encode,
    de::{Decoder, read::Reader},
    enc::{Encoder, write::Writer},
    error::{DecodeError, EncodeError},
};

use super::{
    Direction,
    constants::{
        HEADER_CODE_MARK, METHOD_STORED, NULL_STRING, REQUEST_HEADERS, RESPONSE_HEADERS,
        attribute, header_code, header_name, kind, method_code, method_name,
    },
};

/// Optional entries trailing the headers of a forward request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Context(String),
    ServletPath(String),
    RemoteUser(String),
    AuthType(String),
    QueryString(String),
    Route(String),
    SslCert(String),
    SslCipher(String),
    SslSession(String),
    Request { name: String, value: String },
    SslKeySize(u16),
    Secret(String),
}

impl Attribute {
    pub fn code(&self) -> u8 {
        match self {
            Attribute::Context(_) => attribute::CONTEXT,
            Attribute::ServletPath(_) => attribute::SERVLET_PATH,
            Attribute::RemoteUser(_) => attribute::REMOTE_USER,
            Attribute::AuthType(_) => attribute::AUTH_TYPE,
            Attribute::QueryString(_) => attribute::QUERY_STRING,
            Attribute::Route(_) => attribute::ROUTE,
            Attribute::SslCert(_) => attribute::SSL_CERT,
            Attribute::SslCipher(_) => attribute::SSL_CIPHER,
            Attribute::SslSession(_) => attribute::SSL_SESSION,
            Attribute::Request { .. } => attribute::REQ_ATTRIBUTE,
            Attribute::SslKeySize(_) => attribute::SSL_KEY_SIZE,
            Attribute::Secret(_) => attribute::SECRET,
        }
    }
}

/// Environment and headers of one request, as sent by the front-end server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardRequest {
    pub method: String,
    pub protocol: Option<String>,
    pub request_uri: Option<String>,
    pub remote_addr: Option<String>,
    pub remote_host: Option<String>,
    pub server_name: Option<String>,
    pub server_port: u16,
    pub is_secure: bool,
    pub remote_user: Option<String>,
    pub auth_type: Option<String>,
    pub query_string: Option<String>,
    pub scheme: Option<String>,
    pub headers: Vec<(String, String)>,
    pub attributes: Vec<Attribute>,
}

/// Status line and headers of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendHeaders {
    pub status: u16,
    pub message: Option<String>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ForwardRequest(Box<ForwardRequest>),
    SendBodyChunk(Vec<u8>),
    SendHeaders(SendHeaders),
    EndResponse { reuse: bool },
    GetBodyChunk { length: u16 },
    Shutdown,
    CPong,
    CPing,
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::ForwardRequest(_) => kind::FORWARD_REQUEST,
            Message::SendBodyChunk(_) => kind::SEND_BODY_CHUNK,
            Message::SendHeaders(_) => kind::SEND_HEADERS,
            Message::EndResponse { .. } => kind::END_RESPONSE,
            Message::GetBodyChunk { .. } => kind::GET_BODY_CHUNK,
            Message::Shutdown => kind::SHUTDOWN,
            Message::CPong => kind::CPONG,
            Message::CPing => kind::CPING,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::of_kind(self.kind()).unwrap_or(Direction::ToServer)
    }
}

impl Encode for Message {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.kind().encode(encoder)?;

        match self {
            Message::ForwardRequest(req) => req.encode(encoder),
            Message::SendBodyChunk(chunk) => put_bytes(encoder, chunk),
            Message::SendHeaders(headers) => headers.encode(encoder),
            Message::EndResponse { reuse } => reuse.encode(encoder),
            Message::GetBodyChunk { length } => length.encode(encoder),
            Message::Shutdown | Message::CPong | Message::CPing => Ok(()),
        }
    }
}

impl<Context> Decode<Context> for Message {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let code = get_u8(decoder)?;

        match code {
            kind::FORWARD_REQUEST => Ok(Message::ForwardRequest(Box::new(
                <ForwardRequest as Decode<Context>>::decode(decoder)?,
            ))),
            kind::SEND_BODY_CHUNK => Ok(Message::SendBodyChunk(get_bytes(decoder)?)),
            kind::SEND_HEADERS => Ok(Message::SendHeaders(
                <SendHeaders as Decode<Context>>::decode(decoder)?,
            )),
            kind::END_RESPONSE => Ok(Message::EndResponse {
                reuse: get_bool(decoder)?,
            }),
            kind::GET_BODY_CHUNK => Ok(Message::GetBodyChunk {
                length: get_u16(decoder)?,
            }),
            kind::SHUTDOWN => Ok(Message::Shutdown),
            kind::CPONG => Ok(Message::CPong),
            kind::CPING => Ok(Message::CPing),
            other => Err(DecodeError::OtherString(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

impl Encode for ForwardRequest {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let code = method_code(&self.method);
        code.unwrap_or(METHOD_STORED).encode(encoder)?;

        put_string(encoder, self.protocol.as_deref())?;
        put_string(encoder, self.request_uri.as_deref())?;
        put_string(encoder, self.remote_addr.as_deref())?;
        put_string(encoder, self.remote_host.as_deref())?;
        put_string(encoder, self.server_name.as_deref())?;
        self.server_port.encode(encoder)?;
        self.is_secure.encode(encoder)?;
        put_string(encoder, self.remote_user.as_deref())?;
        put_string(encoder, self.auth_type.as_deref())?;
        put_string(encoder, self.query_string.as_deref())?;
        put_string(encoder, self.scheme.as_deref())?;

        put_count(encoder, self.headers.len())?;
        for (name, value) in &self.headers {
            put_header_name(encoder, &REQUEST_HEADERS, name)?;
            put_string(encoder, Some(value))?;
        }

        if code.is_none() {
            attribute::STORED_METHOD.encode(encoder)?;
            put_string(encoder, Some(&self.method))?;
        }
        for attr in &self.attributes {
            attr.encode(encoder)?;
        }
        attribute::ARE_DONE.encode(encoder)
    }
}

impl<Context> Decode<Context> for ForwardRequest {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let code = get_u8(decoder)?;
        let mut method = match code {
            METHOD_STORED => None,
            code => match method_name(code) {
                Some(name) => Some(name.to_string()),
                None => {
                    return Err(DecodeError::OtherString(format!(
                        "unknown method code {code}"
                    )));
                }
            },
        };

        let mut req = ForwardRequest {
            protocol: get_string(decoder)?,
            request_uri: get_string(decoder)?,
            remote_addr: get_string(decoder)?,
            remote_host: get_string(decoder)?,
            server_name: get_string(decoder)?,
            server_port: get_u16(decoder)?,
            is_secure: get_bool(decoder)?,
            remote_user: get_string(decoder)?,
            auth_type: get_string(decoder)?,
            query_string: get_string(decoder)?,
            scheme: get_string(decoder)?,
            ..Default::default()
        };

        let count = get_u16(decoder)?;
        for _ in 0..count {
            let name = get_header_name(decoder, &REQUEST_HEADERS)?;
            let value = get_string(decoder)?.unwrap_or_default();
            req.headers.push((name, value));
        }

        loop {
            let code = get_u8(decoder)?;
            let attr = match code {
                attribute::ARE_DONE => break,
                attribute::STORED_METHOD => {
                    method = Some(get_string(decoder)?.unwrap_or_default());
                    continue;
                }
                attribute::CONTEXT => Attribute::Context(get_text(decoder)?),
                attribute::SERVLET_PATH => Attribute::ServletPath(get_text(decoder)?),
                attribute::REMOTE_USER => Attribute::RemoteUser(get_text(decoder)?),
                attribute::AUTH_TYPE => Attribute::AuthType(get_text(decoder)?),
                attribute::QUERY_STRING => Attribute::QueryString(get_text(decoder)?),
                attribute::ROUTE => Attribute::Route(get_text(decoder)?),
                attribute::SSL_CERT => Attribute::SslCert(get_text(decoder)?),
                attribute::SSL_CIPHER => Attribute::SslCipher(get_text(decoder)?),
                attribute::SSL_SESSION => Attribute::SslSession(get_text(decoder)?),
                attribute::REQ_ATTRIBUTE => Attribute::Request {
                    name: get_text(decoder)?,
                    value: get_text(decoder)?,
                },
                attribute::SSL_KEY_SIZE => Attribute::SslKeySize(get_u16(decoder)?),
                attribute::SECRET => Attribute::Secret(get_text(decoder)?),
                other => {
                    return Err(DecodeError::OtherString(format!(
                        "unknown attribute code {other}"
                    )));
                }
            };
            req.attributes.push(attr);
        }

        req.method = method.ok_or(DecodeError::Other(
            "stored method code without a stored method attribute",
        ))?;
        Ok(req)
    }
}

impl Encode for Attribute {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.code().encode(encoder)?;

        match self {
            Attribute::Context(v)
            | Attribute::ServletPath(v)
            | Attribute::RemoteUser(v)
            | Attribute::AuthType(v)
            | Attribute::QueryString(v)
            | Attribute::Route(v)
            | Attribute::SslCert(v)
            | Attribute::SslCipher(v)
            | Attribute::SslSession(v)
            | Attribute::Secret(v) => put_string(encoder, Some(v)),
            Attribute::Request { name, value } => {
                put_string(encoder, Some(name))?;
                put_string(encoder, Some(value))
            }
            Attribute::SslKeySize(size) => size.encode(encoder),
        }
    }
}

impl Encode for SendHeaders {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.status.encode(encoder)?;
        put_string(encoder, self.message.as_deref())?;
        put_count(encoder, self.headers.len())?;
        for (name, value) in &self.headers {
            put_header_name(encoder, &RESPONSE_HEADERS, name)?;
            put_string(encoder, Some(value))?;
        }
        Ok(())
    }
}

impl<Context> Decode<Context> for SendHeaders {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let status = get_u16(decoder)?;
        let message = get_string(decoder)?;
        let count = get_u16(decoder)?;

        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = get_header_name(decoder, &RESPONSE_HEADERS)?;
            let value = get_string(decoder)?.unwrap_or_default();
            headers.push((name, value));
        }

        Ok(SendHeaders {
            status,
            message,
            headers,
        })
    }
}

pub(super) fn put_string<E: Encoder>(encoder: &mut E, s: Option<&str>) -> Result<(), EncodeError> {
    match s {
        None => NULL_STRING.encode(encoder),
        Some(s) => put_bytes(encoder, s.as_bytes()),
    }
}

/// Length, raw bytes and the NUL terminator.
pub(super) fn put_bytes<E: Encoder>(encoder: &mut E, bytes: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(bytes.len())
        .ok()
        .filter(|len| *len != NULL_STRING)
        .ok_or(EncodeError::Other("field longer than 65534 bytes"))?;
    len.encode(encoder)?;
    encoder.writer().write(bytes)?;
    0_u8.encode(encoder)
}

fn put_count<E: Encoder>(encoder: &mut E, count: usize) -> Result<(), EncodeError> {
    u16::try_from(count)
        .map_err(|_| EncodeError::Other("more than 65535 headers"))?
        .encode(encoder)
}

fn put_header_name<E: Encoder>(
    encoder: &mut E,
    table: &[&str],
    name: &str,
) -> Result<(), EncodeError> {
    match header_code(table, name) {
        Some(code) => code.encode(encoder),
        None => put_string(encoder, Some(name)),
    }
}

pub(super) fn get_u8<D: Decoder>(decoder: &mut D) -> Result<u8, DecodeError> {
    <u8 as Decode<D::Context>>::decode(decoder)
}

pub(super) fn get_u16<D: Decoder>(decoder: &mut D) -> Result<u16, DecodeError> {
    <u16 as Decode<D::Context>>::decode(decoder)
}

fn get_bool<D: Decoder>(decoder: &mut D) -> Result<bool, DecodeError> {
    <bool as Decode<D::Context>>::decode(decoder)
}

pub(super) fn get_raw<D: Decoder>(decoder: &mut D, len: usize) -> Result<Vec<u8>, DecodeError> {
    decoder.claim_bytes_read(len)?;
    let mut buf = vec![0; len];
    decoder.reader().read(&mut buf)?;
    Ok(buf)
}

fn get_terminated<D: Decoder>(decoder: &mut D, len: u16) -> Result<Vec<u8>, DecodeError> {
    let bytes = get_raw(decoder, len as usize)?;
    match get_u8(decoder)? {
        0 => Ok(bytes),
        _ => Err(DecodeError::Other("field is missing its NUL terminator")),
    }
}

fn get_string<D: Decoder>(decoder: &mut D) -> Result<Option<String>, DecodeError> {
    let len = get_u16(decoder)?;
    if len == NULL_STRING {
        return Ok(None);
    }

    let bytes = get_terminated(decoder, len)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| DecodeError::OtherString(format!("string is not UTF-8: {e}")))
}

fn get_text<D: Decoder>(decoder: &mut D) -> Result<String, DecodeError> {
    Ok(get_string(decoder)?.unwrap_or_default())
}

fn get_bytes<D: Decoder>(decoder: &mut D) -> Result<Vec<u8>, DecodeError> {
    let len = get_u16(decoder)?;
    if len == NULL_STRING {
        return Ok(Vec::new());
    }
    get_terminated(decoder, len)
}

/// A header name is either a table code (`0xA0nn`) or a regular string whose
/// length occupies the same two bytes.
fn get_header_name<D: Decoder>(
    decoder: &mut D,
    table: &[&'static str],
) -> Result<String, DecodeError> {
    let mark = get_u16(decoder)?;
    if let Some(name) = header_name(table, mark) {
        return Ok(name.to_string());
    }
    if mark & 0xFF00 == HEADER_CODE_MARK {
        return Err(DecodeError::OtherString(format!(
            "unknown header code {mark:#06x}"
        )));
    }
    if mark == NULL_STRING {
        return Err(DecodeError::Other("header name is missing"));
    }

    let bytes = get_terminated(decoder, mark)?;
    String::from_utf8(bytes)
        .map_err(|e| DecodeError::OtherString(format!("header name is not UTF-8: {e}")))
}
