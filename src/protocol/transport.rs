use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;

use log::trace;
use thiserror::Error;

use crate::exchange::{TlsDetails, TlsInfo};

use super::{
    Direction, FramingError, Message, PacketCodec, constants::HEADER_SIZE,
    error::ConnectorError,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection mid-packet")]
    Closed,
}

/// Blocking byte-stream endpoint a processor talks through.
pub trait Transport: Send {
    /// Reads into `buf`; 0 means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    /// Printable address of the remote end, for logs and the remote-address fallback.
    fn peer(&self) -> Option<String> {
        None
    }

    /// TLS facts, when the stream is secured below this layer.
    fn tls_info(&self) -> Option<&dyn TlsInfo> {
        None
    }

    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn close(&mut self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }

    fn peer(&self) -> Option<String> {
        self.peer_addr().ok().map(|addr| addr.to_string())
    }
}

impl Transport for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn close(&mut self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }

    fn peer(&self) -> Option<String> {
        self.peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
    }
}

/// In-memory transport: scripted input, captured output.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    input: Vec<u8>,
    position: usize,
    output: Vec<u8>,
    max_read: Option<usize>,
    tls: Option<TlsDetails>,
    peer: Option<String>,
    closed: bool,
}

impl MemoryTransport {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    /// Serves at most `max` bytes per read, to exercise reassembly.
    pub fn with_fragmented_reads(mut self, max: usize) -> Self {
        self.max_read = Some(max.max(1));
        self
    }

    pub fn with_tls(mut self, tls: TlsDetails) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let left = &self.input[self.position..];
        let n = left
            .len()
            .min(buf.len())
            .min(self.max_read.unwrap_or(usize::MAX));
        buf[..n].copy_from_slice(&left[..n]);
        self.position += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn peer(&self) -> Option<String> {
        self.peer.clone()
    }

    fn tls_info(&self) -> Option<&dyn TlsInfo> {
        self.tls.as_ref().map(|tls| tls as &dyn TlsInfo)
    }
}

/// Packet-level view of a [`Transport`].
///
/// Owns one working buffer that holds either the packet being read or the packet being
/// written; the two never overlap because a connection is strictly sequential.
pub struct ProtocolTransport<T: Transport> {
    stream: T,
    codec: PacketCodec,
    buffer: Vec<u8>,
}

impl<T: Transport> ProtocolTransport<T> {
    pub fn new(stream: T, codec: PacketCodec) -> Self {
        Self::with_buffer(stream, codec, Vec::with_capacity(codec.packet_size()))
    }

    /// Uses `buffer` (typically pooled) as the working buffer.
    pub fn with_buffer(stream: T, codec: PacketCodec, buffer: Vec<u8>) -> Self {
        Self {
            stream,
            codec,
            buffer,
        }
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_parts(self) -> (T, Vec<u8>) {
        (self.stream, self.buffer)
    }

    /// Reads the next typed message travelling in `expected` direction.
    ///
    /// `None` means the peer closed the stream cleanly between packets.
    pub fn read_message(&mut self, expected: Direction) -> Result<Option<Message>, ConnectorError> {
        let Some(direction) = self.read_packet()? else {
            return Ok(None);
        };
        let payload = &self.buffer[HEADER_SIZE..];
        if direction != expected {
            let code = payload.first().copied().unwrap_or_default();
            return Err(FramingError::UnexpectedType { direction, code }.into());
        }
        let message = self.codec.decode_payload(direction, payload)?;
        trace!("<- {message:?}");
        Ok(Some(message))
    }

    /// Reads a request-body data packet; an empty slice marks the end of the body.
    pub fn read_body(&mut self) -> Result<&[u8], ConnectorError> {
        let direction = self.read_packet()?.ok_or(TransportError::Closed)?;
        if direction != Direction::ToContainer {
            return Err(FramingError::BadMagic(direction.magic()).into());
        }
        let chunk = self.codec.decode_body_payload(&self.buffer[HEADER_SIZE..])?;
        trace!("<- body chunk of {} bytes", chunk.len());
        Ok(chunk)
    }

    pub fn write_message(&mut self, message: &Message) -> Result<(), ConnectorError> {
        trace!("-> {message:?}");
        self.codec.encode_into(message, &mut self.buffer)?;
        self.send()
    }

    /// Writes one send-body-chunk packet without copying `chunk` into a [`Message`].
    pub fn write_body_chunk(&mut self, chunk: &[u8]) -> Result<(), ConnectorError> {
        trace!("-> body chunk of {} bytes", chunk.len());
        self.codec.encode_chunk_into(chunk, &mut self.buffer)?;
        self.send()
    }

    /// Writes one request-body data packet (front-end side).
    pub fn write_body(&mut self, chunk: &[u8]) -> Result<(), ConnectorError> {
        self.codec.encode_body_into(chunk, &mut self.buffer)?;
        self.send()
    }

    pub fn flush(&mut self) -> Result<(), ConnectorError> {
        self.stream.flush().map_err(TransportError::Io)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), ConnectorError> {
        self.stream.close().map_err(TransportError::Io)?;
        Ok(())
    }

    fn send(&mut self) -> Result<(), ConnectorError> {
        self.stream
            .write_all(&self.buffer)
            .map_err(TransportError::Io)?;
        Ok(())
    }

    /// Reads one whole packet into the buffer and returns its direction.
    fn read_packet(&mut self) -> Result<Option<Direction>, ConnectorError> {
        self.buffer.clear();
        self.buffer.resize(HEADER_SIZE, 0);
        if !self.fill(0, true)? {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buffer[..HEADER_SIZE]);
        let (direction, declared) = self.codec.read_header(header)?;

        self.buffer.resize(HEADER_SIZE + declared, 0);
        self.fill(HEADER_SIZE, false)?;
        Ok(Some(direction))
    }

    /// Fills `buffer[from..]`. Returns false only if `eof_ok` and the stream ended before
    /// the first byte.
    fn fill(&mut self, from: usize, eof_ok: bool) -> Result<bool, ConnectorError> {
        let mut filled = from;
        while filled < self.buffer.len() {
            match self.stream.read(&mut self.buffer[filled..]) {
                Ok(0) if eof_ok && filled == from => return Ok(false),
                Ok(0) => return Err(TransportError::Closed.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e).into()),
            }
        }
        Ok(true)
    }
}
