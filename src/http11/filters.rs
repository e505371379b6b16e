//! Chunked transfer coding.
//!
//! The decoder is incremental: it consumes whatever input is at hand and can be resumed at
//! any byte boundary, so the processor feeds it straight from its socket buffer.
use std::io::Write;

use super::parser::bad_request;
use crate::protocol::error::ConnectorError;

/// Terminating chunk with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size { value: u64, digits: usize, extension: bool },
    Data(u64),
    DataEnd,
    Trailer { empty_line: bool },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: State::Size {
                value: 0,
                digits: 0,
                extension: false,
            },
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decodes from `input` into `out`.
    ///
    /// Returns `(consumed, produced)`. Stops early once `out` is full, at the end of the
    /// body, or when input runs out.
    pub fn decode(&mut self, input: &[u8], out: &mut [u8]) -> Result<(usize, usize), ConnectorError> {
        let mut consumed = 0;
        let mut produced = 0;

        while consumed < input.len() && self.state != State::Done {
            if let State::Data(left) = self.state {
                if produced == out.len() {
                    break;
                }
                let n = (left.min(usize::MAX as u64) as usize)
                    .min(input.len() - consumed)
                    .min(out.len() - produced);
                out[produced..produced + n].copy_from_slice(&input[consumed..consumed + n]);
                consumed += n;
                produced += n;
                self.state = match left - n as u64 {
                    0 => State::DataEnd,
                    rest => State::Data(rest),
                };
                continue;
            }

            let b = input[consumed];
            consumed += 1;
            self.state = self.step(b)?;
        }

        Ok((consumed, produced))
    }

    fn step(&self, b: u8) -> Result<State, ConnectorError> {
        let next = match self.state {
            State::Size {
                value,
                digits,
                extension,
            } => match b {
                b'\n' if digits == 0 => return Err(bad_request(400, "chunk without a size")),
                b'\n' if value == 0 => State::Trailer { empty_line: true },
                b'\n' => State::Data(value),
                b'\r' => self.state,
                _ if extension => self.state,
                b';' => State::Size {
                    value,
                    digits,
                    extension: true,
                },
                b' ' | b'\t' => self.state,
                _ => {
                    let digit = (b as char)
                        .to_digit(16)
                        .ok_or_else(|| bad_request(400, "invalid chunk size"))?;
                    if digits >= 16 {
                        return Err(bad_request(400, "chunk size too large"));
                    }
                    State::Size {
                        value: value * 16 + u64::from(digit),
                        digits: digits + 1,
                        extension,
                    }
                }
            },
            State::DataEnd => match b {
                b'\r' => State::DataEnd,
                b'\n' => State::Size {
                    value: 0,
                    digits: 0,
                    extension: false,
                },
                _ => return Err(bad_request(400, "missing CRLF after chunk data")),
            },
            State::Trailer { empty_line } => match b {
                b'\r' => self.state,
                b'\n' if empty_line => State::Done,
                b'\n' => State::Trailer { empty_line: true },
                _ => State::Trailer { empty_line: false },
            },
            State::Data(_) | State::Done => self.state,
        };
        Ok(next)
    }
}

/// Appends `data` as one chunk. Empty data writes nothing; it would end the body.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    // Writing into a Vec cannot fail.
    let _ = write!(out, "{:x}\r\n", data.len());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8], step: usize) -> Result<Vec<u8>, ConnectorError> {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        let mut out = [0u8; 3];
        for piece in input.chunks(step) {
            let mut offset = 0;
            while offset < piece.len() && !decoder.is_done() {
                let (consumed, produced) = decoder.decode(&piece[offset..], &mut out)?;
                offset += consumed;
                body.extend_from_slice(&out[..produced]);
            }
        }
        assert!(decoder.is_done());
        Ok(body)
    }

    #[test]
    fn decodes_across_any_split() {
        let input = b"5;name=value\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n";
        for step in 1..input.len() {
            assert_eq!(decode_all(input, step).unwrap(), b"hello world", "step {step}");
        }
    }

    #[test]
    fn stops_at_the_end_of_the_body() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = [0u8; 16];
        let input = b"2\r\nab\r\n0\r\n\r\nGET / HTTP/1.1\r\n";

        let (consumed, produced) = decoder.decode(input, &mut out).unwrap();

        assert_eq!(&out[..produced], b"ab");
        assert_eq!(consumed, 12);
        assert!(decoder.is_done());
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_all(b"zz\r\n", 4).is_err());
        assert!(decode_all(b"\r\n", 2).is_err());
        assert!(decode_all(b"1\r\nabc", 6).is_err());
    }

    #[test]
    fn encodes_chunks() {
        let mut out = Vec::new();
        encode_chunk(b"", &mut out);
        encode_chunk(b"hello world!", &mut out);
        out.extend_from_slice(LAST_CHUNK);
        assert_eq!(out, b"c\r\nhello world!\r\n0\r\n\r\n");

        let decoded = decode_all(&out, out.len()).unwrap();
        assert_eq!(decoded, b"hello world!");
    }
}
