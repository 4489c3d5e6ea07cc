//! WebSocket frame reader/writer (RFC 6455 §5).
//!
//! The reader accumulates raw bytes across non-blocking reads the same way
//! [`crate::http::request::Reader`] accumulates line bytes — a frame's
//! header and payload are rarely delivered in a single socket read, so
//! parsing has to be resumable rather than all-or-nothing.

use crate::{errors::ErrorKind, limits::WsLimits};
use mio::net::TcpStream;
use std::io::{self, Read, Write};

/// The four-bit opcode carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation of a fragmented message. Not produced by this crate's
    /// writer, but accepted from peers.
    Continuation,
    /// A UTF-8 text message.
    Text,
    /// An opaque binary message.
    Binary,
    /// Connection close.
    Close,
    /// Keepalive ping.
    Ping,
    /// Keepalive pong.
    Pong,
}

impl OpCode {
    #[inline]
    fn from_nibble(b: u8) -> Result<Self, ErrorKind> {
        match b {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ErrorKind::InvalidFrame),
        }
    }

    #[inline]
    fn to_nibble(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// A single decoded WebSocket message, reused across reads on one connection.
#[derive(Debug)]
pub struct Frame {
    fin: bool,
    opcode: OpCode,
    payload: Vec<u8>,
}

impl Frame {
    #[inline]
    pub(crate) fn new(limits: &WsLimits) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Text,
            payload: Vec::with_capacity(limits.frame_payload_capacity),
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.fin = true;
        self.opcode = OpCode::Text;
        self.payload.clear();
    }

    /// Whether this frame is the final fragment of a message.
    #[inline(always)]
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// The frame's opcode.
    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// The unmasked payload bytes.
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Identifies an upgraded connection for the lifetime of the WebSocket
/// event loop. Opaque outside the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) usize);

/// Notifications from the WebSocket event loop.
///
/// All three are optional — implement only the ones you need.
pub trait WsHandler: Send + Sync + 'static {
    /// Called once when `id` is handed off from the HTTP worker.
    #[allow(unused_variables)]
    fn on_conn(&self, id: ConnId) {}

    /// Called once when `id` disconnects, whether cleanly or on a frame error.
    #[allow(unused_variables)]
    fn on_disconn(&self, id: ConnId) {}

    /// Called for every successfully decoded frame.
    fn on_frame(&self, id: ConnId, frame: &Frame);
}

/// Buffered, resumable frame reader over one non-blocking connection.
#[derive(Debug)]
pub(crate) struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    #[inline]
    pub(crate) fn new() -> Self {
        Self { buf: Vec::with_capacity(16) }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
    }

    /// Reads as much as the socket currently offers and tries to complete
    /// one frame. `Ok(true)` means `frame` now holds a full message;
    /// `Ok(false)` means the socket would block with a frame still partial
    /// — the caller should wait for the connection's next readiness event.
    pub(crate) fn read_frame(
        &mut self,
        stream: &mut TcpStream,
        frame: &mut Frame,
        limits: &WsLimits,
    ) -> Result<bool, ErrorKind> {
        loop {
            if let Some(consumed) = Self::try_parse(&self.buf, frame, limits)? {
                self.buf.drain(..consumed);
                return Ok(true);
            }

            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(ErrorKind::from(e)),
            }
        }
    }

    // Pure parse over already-accumulated bytes. Returns the byte count to
    // drop from the front of `buf` once a frame is fully decoded.
    fn try_parse(buf: &[u8], frame: &mut Frame, limits: &WsLimits) -> Result<Option<usize>, ErrorKind> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0b1000_0000 != 0;
        let opcode = OpCode::from_nibble(buf[0] & 0b0000_1111)?;
        let masked = buf[1] & 0b1000_0000 != 0;
        let len_code = buf[1] & 0b0111_1111;

        let mut pos = 2;
        let payload_len = match len_code {
            126 => {
                if buf.len() < pos + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
                pos += 2;
                len
            }
            127 => {
                if buf.len() < pos + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[pos..pos + 8]);
                pos += 8;
                u64::from_be_bytes(raw) as usize
            }
            n => n as usize,
        };

        if payload_len > limits.frame_payload_capacity {
            return Err(ErrorKind::PayloadLargerThanBuffer);
        }

        let mask = if masked {
            if buf.len() < pos + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
            Some(key)
        } else {
            None
        };

        if buf.len() < pos + payload_len {
            return Ok(None);
        }

        frame.reset();
        frame.fin = fin;
        frame.opcode = opcode;
        frame.payload.extend_from_slice(&buf[pos..pos + payload_len]);

        if let Some(key) = mask {
            for (i, byte) in frame.payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        if opcode == OpCode::Text && simdutf8::basic::from_utf8(&frame.payload).is_err() {
            return Err(ErrorKind::InvalidFrame);
        }

        Ok(Some(pos + payload_len))
    }
}

/// Frames and writes a single unfragmented, unmasked server-to-client message.
pub(crate) fn write_message(
    stream: &mut TcpStream,
    opcode: OpCode,
    payload: &[u8],
) -> Result<(), ErrorKind> {
    let mut header = Vec::with_capacity(10);
    header.push(0b1000_0000 | opcode.to_nibble());

    match payload.len() {
        n if n < 126 => header.push(n as u8),
        n if n <= u16::MAX as usize => {
            header.push(126);
            header.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            header.push(127);
            header.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }

    write_all(stream, &header)?;
    write_all(stream, payload)
}

fn write_all(stream: &mut TcpStream, mut buf: &[u8]) -> Result<(), ErrorKind> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(ErrorKind::PartialWrite),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(ErrorKind::from(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_bytes(opcode: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0b1000_0000 | opcode, 0b1000_0000 | payload.len() as u8];
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    #[test]
    fn unmasks_short_text_frame() {
        let limits = WsLimits::default();
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let raw = masked_bytes(0x1, b"hello", key);

        let mut frame = Frame::new(&limits);
        let consumed = FrameReader::try_parse(&raw, &mut frame, &limits).unwrap().unwrap();

        assert_eq!(consumed, raw.len());
        assert!(frame.fin());
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload(), b"hello");
    }

    #[test]
    fn incomplete_frame_is_not_ready() {
        let limits = WsLimits::default();
        let raw = masked_bytes(0x2, b"0123456789", [1, 2, 3, 4]);
        let mut frame = Frame::new(&limits);

        // Missing the last payload byte.
        let short = &raw[..raw.len() - 1];
        assert_eq!(FrameReader::try_parse(short, &mut frame, &limits), Ok(None));
    }

    #[test]
    fn rejects_oversized_payload() {
        let limits = WsLimits {
            frame_payload_capacity: 4,
            ..WsLimits::default()
        };
        let raw = masked_bytes(0x2, b"too long", [0, 0, 0, 0]);
        let mut frame = Frame::new(&limits);

        assert_eq!(
            FrameReader::try_parse(&raw, &mut frame, &limits),
            Err(ErrorKind::PayloadLargerThanBuffer)
        );
    }

    #[test]
    fn rejects_invalid_utf8_in_text_frame() {
        let limits = WsLimits::default();
        let raw = masked_bytes(0x1, &[0xFF, 0xFE], [0, 0, 0, 0]);
        let mut frame = Frame::new(&limits);

        assert_eq!(
            FrameReader::try_parse(&raw, &mut frame, &limits),
            Err(ErrorKind::InvalidFrame)
        );
    }

    #[test]
    fn rejects_unknown_opcode() {
        let limits = WsLimits::default();
        let raw = masked_bytes(0x3, b"x", [0, 0, 0, 0]);
        let mut frame = Frame::new(&limits);

        assert_eq!(
            FrameReader::try_parse(&raw, &mut frame, &limits),
            Err(ErrorKind::InvalidFrame)
        );
    }

    #[test]
    fn sixteen_bit_length_round_trips() {
        let limits = WsLimits::default();
        let payload = vec![b'a'; 200];
        let mut raw = vec![0b1000_0010u8, 0b1000_0000 | 126];
        raw.extend_from_slice(&(200u16).to_be_bytes());
        let key = [9, 8, 7, 6];
        raw.extend_from_slice(&key);
        raw.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));

        let mut frame = Frame::new(&limits);
        let consumed = FrameReader::try_parse(&raw, &mut frame, &limits).unwrap().unwrap();

        assert_eq!(consumed, raw.len());
        assert_eq!(frame.payload(), payload.as_slice());
    }
}
