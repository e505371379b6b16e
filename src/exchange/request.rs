use std::collections::HashMap;

use log::trace;

use super::{BodyLengthPolicy, ExchangeError, MimeHeaders, TlsInfo, tls};

/// Connection-level facts about a request, gathered by a processor before the request is
/// populated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub method: String,
    pub request_uri: String,
    pub query_string: Option<String>,
    pub protocol: String,
    /// Explicit scheme; derived from `secure` when absent.
    pub scheme: Option<String>,
    pub secure: bool,
    pub remote_addr: Option<String>,
    pub remote_host: Option<String>,
    pub server_name: Option<String>,
    pub server_port: u16,
    pub auth_type: Option<String>,
    pub remote_user: Option<String>,
}

/// One inbound exchange.
///
/// A `Request` lives in a pool and is reused across exchanges, so nothing here is ever
/// constructed with final values: processors fill it in with
/// [`populate_from_environment`](Request::populate_from_environment), header ingestion and
/// attribute ingestion, and [`reset`](Request::reset) returns it to its initial state.
#[derive(Debug, Default)]
pub struct Request {
    method: String,
    request_uri: String,
    decoded_uri: String,
    query_string: String,
    protocol: String,
    scheme: String,
    secure: bool,
    remote_addr: String,
    remote_host: String,
    server_name: String,
    server_port: u16,
    auth_type: Option<String>,
    remote_user: Option<String>,
    route: Option<String>,
    content_type: Option<String>,
    headers: MimeHeaders,
    attributes: HashMap<String, String>,
    body: BodyLengthPolicy,
    available: u64,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the environment fields in one step.
    ///
    /// Every derived value is computed before anything is assigned, so a failure leaves the
    /// request exactly as it was. An absolute URI (`http://host/path`) is reduced to its path
    /// and the authority replaces the `host` header.
    pub fn populate_from_environment(&mut self, env: Environment) -> Result<(), ExchangeError> {
        if env.method.is_empty() {
            return Err(ExchangeError::MissingField("method"));
        }
        if env.request_uri.is_empty() {
            return Err(ExchangeError::MissingField("request_uri"));
        }

        let (uri, authority) = strip_absolute(&env.request_uri);
        let (uri, split_query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };
        let decoded_uri = decode_path(uri)?;
        let query_string = split_query
            .map(str::to_owned)
            .or(env.query_string)
            .unwrap_or_default();
        let scheme = env
            .scheme
            .unwrap_or_else(|| if env.secure { "https" } else { "http" }.to_owned());

        if let Some(authority) = authority {
            self.headers.set("host", authority);
        }
        self.request_uri = uri.to_owned();
        self.decoded_uri = decoded_uri;
        self.query_string = query_string;
        self.method = env.method;
        self.protocol = env.protocol;
        self.secure = env.secure || scheme.eq_ignore_ascii_case("https");
        self.scheme = scheme;
        self.remote_addr = env.remote_addr.unwrap_or_default();
        self.remote_host = env.remote_host.unwrap_or_default();
        self.server_name = env.server_name.unwrap_or_default();
        self.server_port = env.server_port;
        self.auth_type = env.auth_type;
        self.remote_user = env.remote_user;

        trace!(
            "populated {} {} (query {:?})",
            self.method, self.request_uri, self.query_string
        );
        Ok(())
    }

    /// Moves everything after the first `?` of the URI into the query string.
    ///
    /// A URI without `?` is left alone, so the split can be repeated safely.
    pub fn split_query(&mut self) {
        if let Some(pos) = self.request_uri.find('?') {
            self.query_string = self.request_uri[pos + 1..].to_owned();
            self.request_uri.truncate(pos);
            if let Some(pos) = self.decoded_uri.find('?') {
                self.decoded_uri.truncate(pos);
            }
        }
    }

    /// Appends a header, keeping earlier values of the same name.
    ///
    /// `Content-Length` and `Content-Type` also update the body policy and content type.
    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ExchangeError> {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ExchangeError::InvalidHeader(name.clone()))?;
            self.set_body_policy(BodyLengthPolicy::KnownLength(length));
        } else if name.eq_ignore_ascii_case("content-type") {
            self.content_type = Some(value.clone());
        }
        self.headers.add(name, value);
        Ok(())
    }

    /// Copies TLS metadata into the attribute map.
    ///
    /// Nothing happens unless the request arrived over a secure scheme; each value is
    /// optional on its own. Returns whether ingestion ran.
    pub fn ingest_tls(&mut self, info: &dyn TlsInfo) -> bool {
        if !self.is_secure() {
            return false;
        }
        if let Some(chain) = info.peer_certificate_chain() {
            self.attributes.insert(tls::CERTIFICATE_CHAIN.to_owned(), chain);
        }
        if let Some(cipher) = info.cipher_suite() {
            self.attributes.insert(tls::CIPHER_SUITE.to_owned(), cipher);
        }
        if let Some(session) = info.session_id() {
            self.attributes.insert(tls::SESSION_ID.to_owned(), session);
        }
        if let Some(size) = info.key_size() {
            self.attributes
                .insert(tls::KEY_SIZE.to_owned(), size.to_string());
        }
        true
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn set_route(&mut self, route: impl Into<String>) {
        self.route = Some(route.into());
    }

    pub fn set_server(&mut self, name: impl Into<String>, port: u16) {
        self.server_name = name.into();
        self.server_port = port;
    }

    pub fn set_body_policy(&mut self, policy: BodyLengthPolicy) {
        self.body = policy;
        self.available = match policy {
            BodyLengthPolicy::KnownLength(length) => length,
            BodyLengthPolicy::Unbounded => 0,
        };
    }

    /// Largest read that stays within the declared body, or `wanted` when unbounded.
    pub fn readable(&self, wanted: usize) -> usize {
        match self.body {
            BodyLengthPolicy::KnownLength(_) => {
                usize::try_from(self.available).map_or(wanted, |left| wanted.min(left))
            }
            BodyLengthPolicy::Unbounded => wanted,
        }
    }

    /// Records body bytes handed to the application.
    pub fn consume(&mut self, delivered: usize) {
        if let BodyLengthPolicy::KnownLength(_) = self.body {
            self.available = self.available.saturating_sub(delivered as u64);
        }
    }

    /// True once a known-length body has been read completely.
    pub fn is_body_exhausted(&self) -> bool {
        matches!(self.body, BodyLengthPolicy::KnownLength(_)) && self.available == 0
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// Percent-decoded path.
    pub fn decoded_uri(&self) -> &str {
        &self.decoded_uri
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn auth_type(&self) -> Option<&str> {
        self.auth_type.as_deref()
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn headers(&self) -> &MimeHeaders {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body_policy(&self) -> BodyLengthPolicy {
        self.body
    }

    /// Body bytes not yet delivered; `None` when the length is unknown.
    pub fn available(&self) -> Option<u64> {
        match self.body {
            BodyLengthPolicy::KnownLength(_) => Some(self.available),
            BodyLengthPolicy::Unbounded => None,
        }
    }

    /// Restores the freshly constructed state, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.method.clear();
        self.request_uri.clear();
        self.decoded_uri.clear();
        self.query_string.clear();
        self.protocol.clear();
        self.scheme.clear();
        self.secure = false;
        self.remote_addr.clear();
        self.remote_host.clear();
        self.server_name.clear();
        self.server_port = 0;
        self.auth_type = None;
        self.remote_user = None;
        self.route = None;
        self.content_type = None;
        self.headers.clear();
        self.attributes.clear();
        self.body = BodyLengthPolicy::default();
        self.available = 0;
    }
}

/// Splits `scheme://authority/path` into the path and the authority.
fn strip_absolute(uri: &str) -> (&str, Option<&str>) {
    let lower = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return (uri, None);
    }
    let rest = match uri.find("://") {
        Some(pos) => &uri[pos + 3..],
        None => return (uri, None),
    };
    match rest.find(['/', '?']) {
        Some(pos) if rest.as_bytes()[pos] == b'/' => (&rest[pos..], Some(&rest[..pos])),
        Some(pos) => ("/", Some(&rest[..pos])),
        None => ("/", Some(rest)),
    }
}

/// Percent-decodes a path. `+` is kept literally.
fn decode_path(path: &str) -> Result<String, ExchangeError> {
    if !path.contains('%') {
        return Ok(path.to_owned());
    }
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| ExchangeError::InvalidUri(path.to_owned()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ExchangeError::InvalidUri(path.to_owned()))
}
