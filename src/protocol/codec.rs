use std::fmt;

use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_into_std_write,
    error::{DecodeError, EncodeError},
};
use thiserror::Error;

use super::{
    Message,
    constants::{
        BODY_CHUNK_OVERHEAD, BODY_READ_OVERHEAD, DEFAULT_PACKET_SIZE, HEADER_SIZE,
        MAGIC_TO_CONTAINER, MAGIC_TO_SERVER, kind,
    },
};

/// Which way a packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Front-end server to connector.
    ToContainer,
    /// Connector to front-end server.
    ToServer,
}

impl Direction {
    pub fn magic(self) -> u16 {
        match self {
            Direction::ToContainer => MAGIC_TO_CONTAINER,
            Direction::ToServer => MAGIC_TO_SERVER,
        }
    }

    pub fn from_magic(magic: u16) -> Option<Self> {
        match magic {
            MAGIC_TO_CONTAINER => Some(Direction::ToContainer),
            MAGIC_TO_SERVER => Some(Direction::ToServer),
            _ => None,
        }
    }

    /// Direction a message type is allowed to travel in.
    pub fn of_kind(code: u8) -> Option<Self> {
        match code {
            kind::FORWARD_REQUEST | kind::SHUTDOWN | kind::CPING => Some(Direction::ToContainer),
            kind::SEND_BODY_CHUNK
            | kind::SEND_HEADERS
            | kind::END_RESPONSE
            | kind::GET_BODY_CHUNK
            | kind::CPONG => Some(Direction::ToServer),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToContainer => write!(f, "server->container"),
            Direction::ToServer => write!(f, "container->server"),
        }
    }
}

/// A packet that cannot be trusted. Always fatal for the connection.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("packet of {0} bytes is shorter than its header")]
    TooShort(usize),

    #[error("bad magic {0:#06x}")]
    BadMagic(u16),

    #[error("declared length {declared} does not match the {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("declared length {declared} exceeds the {max} byte limit")]
    TooLarge { declared: usize, max: usize },

    #[error("message type {code} cannot travel {direction}")]
    UnexpectedType { direction: Direction, code: u8 },

    #[error("packet has no payload")]
    Empty,

    #[error("{0} bytes left over after the message")]
    TrailingBytes(usize),

    #[error("malformed payload: {0}")]
    Malformed(#[from] DecodeError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] EncodeError),
}

/// Stateless packet marshaller.
///
/// Working buffers are always supplied by the caller, so one codec can be shared by every
/// connection without locking.
#[derive(Clone, Copy)]
pub struct PacketCodec {
    config: Configuration<BigEndian, Fixint>,
    packet_size: usize,
}

// bincode's configuration markers carry no `Debug` impl.
impl fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCodec")
            .field("packet_size", &self.packet_size)
            .finish_non_exhaustive()
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_SIZE)
    }
}

impl PacketCodec {
    pub fn new(packet_size: usize) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self {
            config,
            packet_size,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Largest payload a single send-body-chunk packet can carry.
    pub fn max_body_chunk(&self) -> usize {
        self.packet_size - BODY_CHUNK_OVERHEAD
    }

    /// Largest request-body chunk the front-end may send back for a get-body-chunk.
    pub fn max_read_chunk(&self) -> usize {
        self.packet_size - BODY_READ_OVERHEAD
    }

    /// Encodes a whole packet (magic, length, payload) into `buf`, replacing its contents.
    pub fn encode_into(&self, message: &Message, buf: &mut Vec<u8>) -> Result<(), FramingError> {
        self.begin(message.direction(), buf);
        encode_into_std_write(message, buf, self.config)?;
        self.seal(buf)
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, FramingError> {
        let mut buf = Vec::with_capacity(self.packet_size);
        self.encode_into(message, &mut buf)?;
        Ok(buf)
    }

    /// Encodes a send-body-chunk packet straight from a borrowed slice.
    pub fn encode_chunk_into(&self, chunk: &[u8], buf: &mut Vec<u8>) -> Result<(), FramingError> {
        let len = u16::try_from(chunk.len())
            .ok()
            .filter(|len| (*len as usize) <= self.max_body_chunk())
            .ok_or(FramingError::TooLarge {
                declared: chunk.len() + BODY_CHUNK_OVERHEAD - HEADER_SIZE,
                max: self.packet_size - HEADER_SIZE,
            })?;

        self.begin(Direction::ToServer, buf);
        buf.push(kind::SEND_BODY_CHUNK);
        encode_into_std_write(len, buf, self.config)?;
        buf.extend_from_slice(chunk);
        buf.push(0);
        self.seal(buf)
    }

    /// Encodes a request-body data packet. These carry no type byte; an empty chunk
    /// produces the empty packet that marks the end of the body.
    pub fn encode_body_into(&self, chunk: &[u8], buf: &mut Vec<u8>) -> Result<(), FramingError> {
        self.begin(Direction::ToContainer, buf);
        if !chunk.is_empty() {
            let len = u16::try_from(chunk.len()).map_err(|_| FramingError::TooLarge {
                declared: chunk.len(),
                max: self.max_read_chunk(),
            })?;
            encode_into_std_write(len, buf, self.config)?;
            buf.extend_from_slice(chunk);
        }
        self.seal(buf)
    }

    /// Validates the 4 byte packet header; returns the direction and the declared length.
    pub fn read_header(&self, header: [u8; HEADER_SIZE]) -> Result<(Direction, usize), FramingError> {
        let magic = u16::from_be_bytes([header[0], header[1]]);
        let direction = Direction::from_magic(magic).ok_or(FramingError::BadMagic(magic))?;

        let declared = u16::from_be_bytes([header[2], header[3]]) as usize;
        let max = self.packet_size - HEADER_SIZE;
        if declared > max {
            return Err(FramingError::TooLarge { declared, max });
        }

        Ok((direction, declared))
    }

    /// Decodes a complete packet. The declared length must match the bytes present exactly.
    pub fn decode(&self, packet: &[u8]) -> Result<Message, FramingError> {
        let (direction, payload) = self.split(packet)?;
        self.decode_payload(direction, payload)
    }

    pub fn decode_payload(
        &self,
        direction: Direction,
        payload: &[u8],
    ) -> Result<Message, FramingError> {
        let code = *payload.first().ok_or(FramingError::Empty)?;
        if Direction::of_kind(code) != Some(direction) {
            return Err(FramingError::UnexpectedType { direction, code });
        }

        let (message, consumed): (Message, usize) = decode_from_slice(payload, self.config)?;
        if consumed != payload.len() {
            return Err(FramingError::TrailingBytes(payload.len() - consumed));
        }

        Ok(message)
    }

    /// Decodes a complete request-body data packet into its chunk.
    pub fn decode_body<'a>(&self, packet: &'a [u8]) -> Result<&'a [u8], FramingError> {
        let (direction, payload) = self.split(packet)?;
        if direction != Direction::ToContainer {
            return Err(FramingError::BadMagic(direction.magic()));
        }
        self.decode_body_payload(payload)
    }

    pub fn decode_body_payload<'a>(&self, payload: &'a [u8]) -> Result<&'a [u8], FramingError> {
        if payload.is_empty() {
            return Ok(payload);
        }

        let (declared, consumed): (u16, usize) = decode_from_slice(payload, self.config)?;
        let chunk = &payload[consumed..];
        if declared as usize != chunk.len() {
            return Err(FramingError::LengthMismatch {
                declared: declared as usize,
                actual: chunk.len(),
            });
        }

        Ok(chunk)
    }

    fn split<'a>(&self, packet: &'a [u8]) -> Result<(Direction, &'a [u8]), FramingError> {
        let header: [u8; HEADER_SIZE] = packet
            .get(..HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or(FramingError::TooShort(packet.len()))?;
        let (direction, declared) = self.read_header(header)?;

        let payload = &packet[HEADER_SIZE..];
        if declared != payload.len() {
            return Err(FramingError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok((direction, payload))
    }

    fn begin(&self, direction: Direction, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&direction.magic().to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
    }

    fn seal(&self, buf: &mut [u8]) -> Result<(), FramingError> {
        let declared = buf.len() - HEADER_SIZE;
        let max = self.packet_size - HEADER_SIZE;
        if declared > max {
            return Err(FramingError::TooLarge { declared, max });
        }

        buf[2..HEADER_SIZE].copy_from_slice(&(declared as u16).to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{Attribute, ForwardRequest, SendHeaders};

    use super::*;

    fn forward_request() -> ForwardRequest {
        ForwardRequest {
            method: "GET".into(),
            protocol: Some("HTTP/1.1".into()),
            request_uri: Some("/hello".into()),
            remote_addr: Some("10.0.0.1".into()),
            remote_host: None,
            server_name: Some("localhost".into()),
            server_port: 80,
            is_secure: false,
            remote_user: None,
            auth_type: Some(String::new()),
            query_string: Some("x=1".into()),
            scheme: None,
            headers: vec![
                ("host".into(), "localhost".into()),
                ("X-Trace".into(), "abc".into()),
            ],
            attributes: vec![
                Attribute::Route("node1".into()),
                Attribute::Request {
                    name: "k".into(),
                    value: "v".into(),
                },
                Attribute::SslKeySize(256),
            ],
        }
    }

    fn round_trip(message: Message) {
        let codec = PacketCodec::default();
        let bytes = codec.encode(&message).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), message);
    }

    #[test]
    fn known_byte_layouts() {
        let codec = PacketCodec::default();

        assert_eq!(codec.encode(&Message::CPong).unwrap(), vec![0x41, 0x42, 0, 1, 9]);
        assert_eq!(
            codec.encode(&Message::EndResponse { reuse: true }).unwrap(),
            vec![0x41, 0x42, 0, 2, 5, 1]
        );
        assert_eq!(
            codec.encode(&Message::GetBodyChunk { length: 8186 }).unwrap(),
            vec![0x41, 0x42, 0, 3, 6, 0x1F, 0xFA]
        );
        assert_eq!(
            codec.encode(&Message::SendBodyChunk(b"hi".to_vec())).unwrap(),
            vec![0x41, 0x42, 0, 6, 3, 0, 2, b'h', b'i', 0]
        );
        assert_eq!(codec.encode(&Message::Shutdown).unwrap(), vec![0x12, 0x34, 0, 1, 7]);
    }

    #[test]
    fn forward_request_round_trip() {
        round_trip(Message::ForwardRequest(Box::new(forward_request())));
    }

    #[test]
    fn header_names_keep_their_spelling() {
        let mut req = ForwardRequest::new("GET", "/", "localhost");
        req.headers = vec![
            ("Host".into(), "localhost".into()),
            ("host".into(), "localhost".into()),
            ("CONTENT-LENGTH".into(), "0".into()),
        ];
        round_trip(Message::ForwardRequest(Box::new(req)));

        round_trip(Message::SendHeaders(SendHeaders {
            status: 200,
            message: None,
            headers: vec![
                ("content-type".into(), "text/plain".into()),
                ("Content-Type".into(), "text/html".into()),
            ],
        }));
    }

    #[test]
    fn exact_table_names_are_coded() {
        let codec = PacketCodec::default();
        let coded = |name: &str| {
            codec
                .encode(&Message::SendHeaders(SendHeaders {
                    status: 200,
                    message: None,
                    headers: vec![(name.into(), String::new())],
                }))
                .unwrap()
        };

        let packet = coded("Set-Cookie");
        assert_eq!(&packet[11..13], &[0xA0, 0x07]);
        assert!(coded("set-cookie").len() > packet.len());
    }

    #[test]
    fn forward_request_without_headers_or_attributes() {
        let req = ForwardRequest {
            method: "POST".into(),
            protocol: Some(String::new()),
            ..Default::default()
        };
        round_trip(Message::ForwardRequest(Box::new(req)));
    }

    #[test]
    fn stored_method_round_trip() {
        let mut req = forward_request();
        req.method = "BREW".into();
        round_trip(Message::ForwardRequest(Box::new(req)));
    }

    #[test]
    fn response_messages_round_trip() {
        round_trip(Message::SendHeaders(SendHeaders {
            status: 200,
            message: Some("OK".into()),
            headers: vec![
                ("Content-Type".into(), "text/plain".into()),
                ("x-custom".into(), String::new()),
            ],
        }));
        round_trip(Message::SendHeaders(SendHeaders::default()));
        round_trip(Message::SendBodyChunk(Vec::new()));
        round_trip(Message::SendBodyChunk(vec![0; 100]));
        round_trip(Message::EndResponse { reuse: false });
        round_trip(Message::GetBodyChunk { length: 0 });
        round_trip(Message::CPing);
        round_trip(Message::Shutdown);
    }

    #[test]
    fn declared_length_must_match() {
        let codec = PacketCodec::default();
        let bytes = codec
            .encode(&Message::ForwardRequest(Box::new(forward_request())))
            .unwrap();

        for cut in 0..bytes.len() {
            assert!(codec.decode(&bytes[..cut]).is_err(), "accepted {cut} bytes");
        }

        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            codec.decode(&longer),
            Err(FramingError::LengthMismatch { .. })
        ));

        let mut understated = bytes.clone();
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) - 1;
        understated[2..4].copy_from_slice(&declared.to_be_bytes());
        assert!(matches!(
            codec.decode(&understated),
            Err(FramingError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn payload_shorter_than_its_fields() {
        let codec = PacketCodec::default();
        // get-body-chunk needs two more bytes than are present
        let packet = [0x41, 0x42, 0, 2, 6, 0];
        assert!(matches!(
            codec.decode(&packet),
            Err(FramingError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let codec = PacketCodec::default();
        let packet = [0x12, 0x34, 0, 2, 10, 0];
        assert!(matches!(
            codec.decode(&packet),
            Err(FramingError::TrailingBytes(1))
        ));
    }

    #[test]
    fn bad_magic_and_direction() {
        let codec = PacketCodec::default();
        assert!(matches!(
            codec.decode(&[0x12, 0x35, 0, 1, 7]),
            Err(FramingError::BadMagic(0x1235))
        ));
        assert!(matches!(
            codec.decode(&[0x41, 0x42, 0, 1, 7]),
            Err(FramingError::UnexpectedType { code: 7, .. })
        ));
        assert!(matches!(
            codec.decode(&[0x12, 0x34, 0, 1, 1]),
            Err(FramingError::UnexpectedType { code: 1, .. })
        ));
        assert!(matches!(
            codec.decode(&[0x12, 0x34, 0, 0]),
            Err(FramingError::Empty)
        ));
    }

    #[test]
    fn oversized_packets() {
        let codec = PacketCodec::default();
        assert!(matches!(
            codec.read_header([0x12, 0x34, 0xFF, 0xFF]),
            Err(FramingError::TooLarge { .. })
        ));
        let chunk = vec![0; codec.max_body_chunk() + 1];
        assert!(matches!(
            codec.encode(&Message::SendBodyChunk(chunk)),
            Err(FramingError::TooLarge { .. })
        ));
        let chunk = vec![0; codec.max_body_chunk()];
        assert!(codec.encode(&Message::SendBodyChunk(chunk)).is_ok());
    }

    #[test]
    fn borrowed_chunk_matches_message_encoding() {
        let codec = PacketCodec::default();
        let mut buf = Vec::new();

        codec.encode_chunk_into(b"hello", &mut buf).unwrap();
        assert_eq!(
            buf,
            codec
                .encode(&Message::SendBodyChunk(b"hello".to_vec()))
                .unwrap()
        );

        let chunk = vec![0; codec.max_body_chunk() + 1];
        assert!(codec.encode_chunk_into(&chunk, &mut buf).is_err());
    }

    #[test]
    fn missing_terminator_is_malformed() {
        let codec = PacketCodec::default();
        let mut packet = codec
            .encode(&Message::SendBodyChunk(b"hi".to_vec()))
            .unwrap();
        let last = packet.len() - 1;
        packet[last] = b'!';
        assert!(matches!(
            codec.decode(&packet),
            Err(FramingError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_attribute_is_malformed() {
        let codec = PacketCodec::default();
        let mut packet = codec
            .encode(&Message::ForwardRequest(Box::new(ForwardRequest {
                method: "GET".into(),
                ..Default::default()
            })))
            .unwrap();
        let last = packet.len() - 1;
        packet[last] = 0x42;
        packet.push(0xFF);
        let len = (packet.len() - HEADER_SIZE) as u16;
        packet[2..4].copy_from_slice(&len.to_be_bytes());
        assert!(matches!(
            codec.decode(&packet),
            Err(FramingError::Malformed(_))
        ));
    }

    #[test]
    fn body_packets() {
        let codec = PacketCodec::default();
        let mut buf = Vec::new();

        codec.encode_body_into(b"abc", &mut buf).unwrap();
        assert_eq!(buf, vec![0x12, 0x34, 0, 5, 0, 3, b'a', b'b', b'c']);
        assert_eq!(codec.decode_body(&buf).unwrap(), b"abc");

        codec.encode_body_into(b"", &mut buf).unwrap();
        assert_eq!(buf, vec![0x12, 0x34, 0, 0]);
        assert!(codec.decode_body(&buf).unwrap().is_empty());

        assert!(matches!(
            codec.decode_body(&[0x12, 0x34, 0, 4, 0, 3, b'a', b'b']),
            Err(FramingError::LengthMismatch { declared: 3, actual: 2 })
        ));
    }

    #[test]
    fn debug_shows_packet_size() {
        let codec = PacketCodec::new(16384);
        assert_eq!(format!("{codec:?}"), "PacketCodec { packet_size: 16384, .. }");
    }
}
