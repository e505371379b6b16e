use super::{ExchangeError, MimeHeaders, status};

pub const DEFAULT_STATUS: u16 = 200;

/// One outbound exchange, paired with a [`Request`](super::Request).
///
/// Status and headers are mutable until the processor commits them to the wire. After
/// that every mutation is rejected with [`ExchangeError::Committed`].
#[derive(Debug)]
pub struct Response {
    status: u16,
    message: Option<String>,
    headers: MimeHeaders,
    committed: bool,
    finished: bool,
    bytes_written: u64,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: DEFAULT_STATUS,
            message: None,
            headers: MimeHeaders::new(),
            committed: false,
            finished: false,
            bytes_written: 0,
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        self.status = status;
        Ok(())
    }

    /// Custom status description. Line breaks are replaced by spaces.
    pub fn set_message(&mut self, message: impl Into<String>) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        let message: String = message.into();
        self.message = Some(message.replace(['\r', '\n'], " "));
        Ok(())
    }

    /// Status description sent on the wire: the custom message, the reason phrase for the
    /// status, or the status number.
    pub fn message(&self) -> String {
        match (&self.message, status::reason_phrase(self.status)) {
            (Some(message), _) => message.clone(),
            (None, Some(reason)) => reason.to_owned(),
            (None, None) => self.status.to_string(),
        }
    }

    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        self.headers.add(name, value);
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        self.headers.set(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<usize, ExchangeError> {
        self.ensure_open()?;
        Ok(self.headers.remove(name))
    }

    pub fn headers(&self) -> &MimeHeaders {
        &self.headers
    }

    /// Parsed `Content-Length` header, if the application set a valid one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Marks the headers as sent. Returns false if they already were.
    pub(crate) fn mark_committed(&mut self) -> bool {
        !std::mem::replace(&mut self.committed, true)
    }

    /// Marks the exchange as complete. Returns false if it already was.
    pub(crate) fn mark_finished(&mut self) -> bool {
        !std::mem::replace(&mut self.finished, true)
    }

    pub(crate) fn record_written(&mut self, bytes: usize) {
        self.bytes_written += bytes as u64;
    }

    /// Replaces whatever the application set with a bare error status.
    pub(crate) fn reset_to_error(&mut self, status: u16) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        self.status = status;
        self.message = None;
        self.headers.clear();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.status = DEFAULT_STATUS;
        self.message = None;
        self.headers.clear();
        self.committed = false;
        self.finished = false;
        self.bytes_written = 0;
    }

    fn ensure_open(&self) -> Result<(), ExchangeError> {
        if self.committed {
            return Err(ExchangeError::Committed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let response = Response::new();
        assert_eq!(response.status(), 200);
        assert_eq!(response.message(), "OK");
        assert!(response.headers().is_empty());
        assert!(!response.is_committed());
        assert!(!response.is_finished());
    }

    #[test]
    fn mutation_rejected_after_commit() {
        let mut response = Response::new();
        response.add_header("Content-Type", "text/plain").unwrap();
        assert!(response.mark_committed());
        assert!(!response.mark_committed());

        assert!(matches!(
            response.add_header("X-Late", "1"),
            Err(ExchangeError::Committed)
        ));
        assert!(matches!(response.set_status(404), Err(ExchangeError::Committed)));
        assert_eq!(response.headers().len(), 1);
        assert_eq!(response.status(), 200);
    }

    #[test]
    fn message_fallbacks() {
        let mut response = Response::new();
        response.set_status(599).unwrap();
        assert_eq!(response.message(), "599");

        response.set_message("Bad\r\nThing").unwrap();
        assert_eq!(response.message(), "Bad  Thing");
    }

    #[test]
    fn reset_restores_defaults() {
        let mut response = Response::new();
        response.set_status(404).unwrap();
        response.add_header("Content-Length", "5").unwrap();
        assert_eq!(response.content_length(), Some(5));
        response.mark_committed();
        response.record_written(5);
        response.mark_finished();

        response.reset();

        assert_eq!(response.status(), 200);
        assert!(response.headers().is_empty());
        assert!(!response.is_committed());
        assert!(!response.is_finished());
        assert_eq!(response.bytes_written(), 0);
    }
}
