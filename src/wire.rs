//! Frame layout shared by the client and the server.
//!
//! Every message on the byte stream is a fixed 18 byte header followed by
//! an opcode specific payload. All integers are little endian.
//!
//! ```text
//! | magic "BR" | kind u8 | opcode u8 | channel u32 | seq u32 | status u16 | len u32 | payload ... |
//! ```
//!
//! The transport may hand back any number of bytes per read, so
//! [`FrameReader`] keeps partial frames across calls and only yields
//! complete ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 2] = *b"BR";
pub const HEADER_SIZE: usize = 18;

/// Upper bound used until the server advertises its own limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;
pub const DEFAULT_READ_SIZE: usize = 64 * 1024;
pub const DEFAULT_WRITE_SIZE: usize = 64 * 1024;

/// Identifies one logical channel multiplexed over a session.
///
/// `ChannelId::SERVER` addresses the server itself (version and clock
/// queries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub const SERVER: Self = Self(0);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    /// Fire-and-forget, the receiver never answers.
    Notify,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Notify => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Notify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Open,
    Close,
    SetState,
    Read,
    CancelRead,
    QueryVersion,
    Clock,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Open => 1,
            Self::Close => 2,
            Self::SetState => 3,
            Self::Read => 4,
            Self::CancelRead => 5,
            Self::QueryVersion => 6,
            Self::Clock => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Open),
            2 => Some(Self::Close),
            3 => Some(Self::SetState),
            4 => Some(Self::Read),
            5 => Some(Self::CancelRead),
            6 => Some(Self::QueryVersion),
            7 => Some(Self::Clock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Nothing arrived within the requested wait.
    Timeout,
    /// The channel was closed while the request was pending.
    Closed,
    DeviceUnavailable,
    /// Device exists but is exclusively owned by another channel.
    DeviceBusy,
    NotOpen,
    InvalidRequest,
}

impl Status {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::Timeout => 1,
            Self::Closed => 2,
            Self::DeviceUnavailable => 3,
            Self::DeviceBusy => 4,
            Self::NotOpen => 5,
            Self::InvalidRequest => 6,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Timeout),
            2 => Some(Self::Closed),
            3 => Some(Self::DeviceUnavailable),
            4 => Some(Self::DeviceBusy),
            5 => Some(Self::NotOpen),
            6 => Some(Self::InvalidRequest),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad frame magic {found:02x?}, stream is out of sync")]
    BadMagic { found: [u8; 2] },

    #[error("Unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("Unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("Unknown status code {0}")]
    UnknownStatus(u16),

    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Payload truncated: needed {needed} bytes but only {available} left")]
    Truncated { needed: usize, available: usize },

    #[error("Sample block with {sub_channels} sub-channels of {bytes_per_code} byte codes")]
    BadBlockLayout { sub_channels: u8, bytes_per_code: u8 },

    #[error("Sample block carries {found} codes per record but {expected} sub-channels are enabled")]
    SubChannelMismatch { expected: usize, found: u8 },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub opcode: Opcode,
    pub channel: ChannelId,
    pub seq: u32,
    pub status: Status,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(opcode: Opcode, channel: ChannelId, seq: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Request,
            opcode,
            channel,
            seq,
            status: Status::Ok,
            payload,
        }
    }

    pub fn notify(opcode: Opcode, channel: ChannelId, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Notify,
            opcode,
            channel,
            seq: 0,
            status: Status::Ok,
            payload,
        }
    }

    /// Builds the answer to `request`, echoing its channel and sequence number.
    pub fn response_to(request: &Self, status: Status, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Response,
            opcode: request.opcode,
            channel: request.channel,
            seq: request.seq,
            status,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_slice(&MAGIC);
        dst.put_u8(self.kind.as_u8());
        dst.put_u8(self.opcode.as_u8());
        dst.put_u32_le(self.channel.0);
        dst.put_u32_le(self.seq);
        dst.put_u16_le(self.status.as_u16());
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    /// Splits one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the frame is
    /// still incomplete.
    pub fn decode(src: &mut BytesMut, max_message_size: usize) -> Result<Option<Self>, WireError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        if src[..2] != MAGIC {
            return Err(WireError::BadMagic {
                found: [src[0], src[1]],
            });
        }
        let payload_len =
            u32::from_le_bytes([src[14], src[15], src[16], src[17]]) as usize;
        if HEADER_SIZE + payload_len > max_message_size {
            return Err(WireError::TooLarge {
                size: HEADER_SIZE + payload_len,
                max: max_message_size,
            });
        }
        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_SIZE);
        header.advance(2);
        let kind_raw = header.get_u8();
        let opcode_raw = header.get_u8();
        let channel = ChannelId(header.get_u32_le());
        let seq = header.get_u32_le();
        let status_raw = header.get_u16_le();
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Self {
            kind: FrameKind::from_u8(kind_raw).ok_or(WireError::UnknownKind(kind_raw))?,
            opcode: Opcode::from_u8(opcode_raw).ok_or(WireError::UnknownOpcode(opcode_raw))?,
            channel,
            seq,
            status: Status::from_u16(status_raw).ok_or(WireError::UnknownStatus(status_raw))?,
            payload,
        }))
    }
}

/// Reassembles frames from a stream that may deliver them in pieces.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    read_size: usize,
    max_message_size: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, read_size: usize, max_message_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(read_size),
            read_size: read_size.max(1),
            max_message_size,
        }
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }

    /// Reads until one frame is complete.
    ///
    /// A read timeout on the underlying stream yields `Ok(None)`; whatever
    /// part of the frame was already received stays buffered for the next
    /// call.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let mut chunk = vec![0u8; self.read_size];
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf, self.max_message_size)? {
                return Ok(Some(frame));
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(WireError::ConnectionClosed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Number of bytes received but not yet consumed as a frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

/// Writes frames in chunks of at most `write_size` bytes.
pub struct FrameWriter<W> {
    inner: W,
    scratch: BytesMut,
    write_size: usize,
    max_message_size: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, write_size: usize, max_message_size: usize) -> Self {
        Self {
            inner,
            scratch: BytesMut::new(),
            write_size: write_size.max(1),
            max_message_size,
        }
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), WireError> {
        if frame.encoded_len() > self.max_message_size {
            return Err(WireError::TooLarge {
                size: frame.encoded_len(),
                max: self.max_message_size,
            });
        }
        self.scratch.clear();
        frame.encode(&mut self.scratch);
        for chunk in self.scratch.chunks(self.write_size) {
            self.inner.write_all(chunk)?;
        }
        self.inner.flush()?;
        Ok(())
    }
}

/// Fails with [`WireError::Truncated`] unless `buf` holds `needed` more bytes.
pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn put_str(dst: &mut BytesMut, value: &str) {
    dst.put_u16_le(value.len() as u16);
    dst.put_slice(value.as_bytes());
}

pub fn get_str(src: &mut Bytes) -> Result<String, WireError> {
    ensure_remaining(&*src, 2)?;
    let len = src.get_u16_le() as usize;
    ensure_remaining(&*src, len)?;
    let raw = src.split_to(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most `step` bytes per read, like a slow pipe.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn sample_frame(seq: u32, payload: &'static [u8]) -> Frame {
        Frame::request(Opcode::Read, ChannelId(3), seq, Bytes::from_static(payload))
    }

    #[test]
    fn test_reader_reassembles_short_reads() {
        let mut wire = BytesMut::new();
        sample_frame(1, b"hello").encode(&mut wire);
        sample_frame(2, b"world!").encode(&mut wire);

        let mut reader = FrameReader::new(
            Trickle {
                data: wire.to_vec(),
                pos: 0,
                step: 3,
            },
            3,
            DEFAULT_MAX_MESSAGE_SIZE,
        );

        let first = reader.read_frame().unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(&first.payload[..], b"hello");
        let second = reader.read_frame().unwrap().unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.channel, ChannelId(3));
        assert_eq!(&second.payload[..], b"world!");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_survives_timeout() {
        let mut wire = BytesMut::new();
        sample_frame(9, b"abcdef").encode(&mut wire);
        let bytes = wire.to_vec();

        let mut reader = FrameReader::new(
            Trickle {
                data: bytes[..10].to_vec(),
                pos: 0,
                step: 64,
            },
            64,
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        assert!(reader.read_frame().unwrap().is_none());
        assert_eq!(reader.pending_bytes(), 10);

        reader.inner.data.extend_from_slice(&bytes[10..]);
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.seq, 9);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE][..]);
        assert!(matches!(
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_oversized_frames_are_rejected_on_both_ends() {
        let frame = sample_frame(1, &[0u8; 64]);
        let mut writer = FrameWriter::new(Vec::new(), 16, 32);
        assert!(matches!(
            writer.write_frame(&frame),
            Err(WireError::TooLarge { .. })
        ));

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert!(matches!(
            Frame::decode(&mut buf, 32),
            Err(WireError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_writer_chunks_output() {
        let frame = sample_frame(4, b"0123456789");
        let mut writer = FrameWriter::new(Vec::new(), 4, DEFAULT_MAX_MESSAGE_SIZE);
        writer.write_frame(&frame).unwrap();
        let mut buf = BytesMut::from(&writer.inner[..]);
        assert_eq!(Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap(), Some(frame));
    }

    #[test]
    fn test_get_str_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(10);
        buf.put_slice(b"abc");
        assert!(matches!(
            get_str(&mut buf.freeze()),
            Err(WireError::Truncated { .. })
        ));
    }
}
