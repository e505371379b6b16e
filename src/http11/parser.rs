use crate::protocol::error::ConnectorError;

pub const HTTP_09: &str = "HTTP/0.9";
pub const HTTP_10: &str = "HTTP/1.0";
pub const HTTP_11: &str = "HTTP/1.1";

/// Parsed `METHOD SP URI [SP PROTOCOL]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
    /// `HTTP/0.9` when the line carried no protocol token.
    pub protocol: String,
}

impl RequestLine {
    pub fn is_http09(&self) -> bool {
        self.protocol == HTTP_09
    }

    pub fn is_http11(&self) -> bool {
        self.protocol == HTTP_11
    }
}

pub(crate) fn bad_request(status: u16, reason: impl Into<String>) -> ConnectorError {
    ConnectorError::BadRequest {
        status,
        reason: reason.into(),
    }
}

pub fn parse_request_line(line: &str) -> Result<RequestLine, ConnectorError> {
    let mut parts = line.split_ascii_whitespace();
    let (Some(method), Some(uri)) = (parts.next(), parts.next()) else {
        return Err(bad_request(400, "incomplete request line"));
    };
    let protocol = parts.next();
    if parts.next().is_some() {
        return Err(bad_request(400, "trailing data on the request line"));
    }
    if !method.bytes().all(is_token) {
        return Err(bad_request(400, format!("invalid method {method:?}")));
    }

    let protocol = match protocol {
        None => HTTP_09,
        Some(HTTP_10) => HTTP_10,
        Some(HTTP_11) => HTTP_11,
        Some(other) if other.starts_with("HTTP/") => {
            return Err(bad_request(505, format!("unsupported protocol {other}")));
        }
        Some(other) => return Err(bad_request(400, format!("invalid protocol {other:?}"))),
    };

    Ok(RequestLine {
        method: method.to_owned(),
        uri: uri.to_owned(),
        protocol: protocol.to_owned(),
    })
}

/// Splits `Name: value`. The value is trimmed of surrounding whitespace.
pub fn parse_header_line(line: &str) -> Result<(String, String), ConnectorError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| bad_request(400, format!("header line without a colon: {line:?}")))?;
    if name.is_empty() || !name.bytes().all(is_token) {
        return Err(bad_request(400, format!("invalid header name {name:?}")));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

/// Server name and port from a `Host` value such as `example.org`, `example.org:8080` or
/// `[::1]:8443`.
pub fn parse_host(host: &str, secure: bool) -> Result<(String, u16), ConnectorError> {
    let default_port = if secure { 443 } else { 80 };
    let (name, port) = if let Some(rest) = host.strip_prefix('[') {
        let (address, after) = rest
            .split_once(']')
            .ok_or_else(|| bad_request(400, format!("unterminated IPv6 host {host:?}")))?;
        match after {
            "" => (address, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (address, Some(port)),
                None => return Err(bad_request(400, format!("invalid host {host:?}"))),
            },
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host, None),
        }
    };

    let port = match port {
        None | Some("") => default_port,
        Some(port) => port
            .parse()
            .map_err(|_| bad_request(400, format!("invalid port in host {host:?}")))?,
    };
    Ok((name.to_ascii_lowercase(), port))
}

fn is_token(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ConnectorError) -> u16 {
        match err {
            ConnectorError::BadRequest { status, .. } => status,
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn request_lines() {
        let line = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.uri, "/index.html");
        assert!(line.is_http11());

        let legacy = parse_request_line("GET /").unwrap();
        assert!(legacy.is_http09());

        assert_eq!(status_of(parse_request_line("GET / HTTP/2.0").unwrap_err()), 505);
        assert_eq!(status_of(parse_request_line("GET / FTP/1.0").unwrap_err()), 400);
        assert_eq!(status_of(parse_request_line("GET").unwrap_err()), 400);
        assert_eq!(status_of(parse_request_line("G(T / HTTP/1.1").unwrap_err()), 400);
        assert_eq!(
            status_of(parse_request_line("GET / HTTP/1.1 extra").unwrap_err()),
            400
        );
    }

    #[test]
    fn header_lines() {
        assert_eq!(
            parse_header_line("Content-Type:  text/plain ").unwrap(),
            ("Content-Type".to_owned(), "text/plain".to_owned())
        );
        assert_eq!(
            parse_header_line("X-Empty:").unwrap(),
            ("X-Empty".to_owned(), String::new())
        );
        assert_eq!(status_of(parse_header_line("no colon").unwrap_err()), 400);
        assert_eq!(status_of(parse_header_line("Bad Name: x").unwrap_err()), 400);
    }

    #[test]
    fn hosts() {
        assert_eq!(parse_host("Example.org", false).unwrap(), ("example.org".to_owned(), 80));
        assert_eq!(parse_host("example.org", true).unwrap(), ("example.org".to_owned(), 443));
        assert_eq!(
            parse_host("example.org:8080", false).unwrap(),
            ("example.org".to_owned(), 8080)
        );
        assert_eq!(parse_host("[::1]:8443", false).unwrap(), ("::1".to_owned(), 8443));
        assert_eq!(parse_host("[::1]", true).unwrap(), ("::1".to_owned(), 443));
        assert_eq!(status_of(parse_host("example.org:http", false).unwrap_err()), 400);
        assert_eq!(status_of(parse_host("[::1", false).unwrap_err()), 400);
    }
}
