use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Reserved single-byte payload that opens a connection
pub const HELLO_MARKER: u8 = 0x01;

/// Single-byte answer to a hello
pub const WELCOME_MARKER: u8 = 0x04;

/// Largest framing overhead added to an application payload
pub const MAX_FRAME_OVERHEAD: usize = 1 + 2;

/// Frame kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hello = HELLO_MARKER,
    Data = 0x02,
    Sequenced = 0x03,
    Welcome = WELCOME_MARKER,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            HELLO_MARKER => Ok(FrameKind::Hello),
            0x02 => Ok(FrameKind::Data),
            0x03 => Ok(FrameKind::Sequenced),
            WELCOME_MARKER => Ok(FrameKind::Welcome),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Session framing around application payloads.
///
/// Hello: `[0x01]`
/// Data: `[0x02][payload]`
/// Sequenced: `[0x03][seq:u16 BE][payload]`
/// Welcome: `[0x04]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello,
    Welcome,
    Data(Bytes),
    Sequenced { seq: u16, payload: Bytes },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Hello => FrameKind::Hello,
            Frame::Welcome => FrameKind::Welcome,
            Frame::Data(_) => FrameKind::Data,
            Frame::Sequenced { .. } => FrameKind::Sequenced,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Hello | Frame::Welcome => 1,
            Frame::Data(payload) => 1 + payload.len(),
            Frame::Sequenced { payload, .. } => 3 + payload.len(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.kind() as u8);
        match self {
            Frame::Hello | Frame::Welcome => {}
            Frame::Data(payload) => buf.put_slice(payload),
            Frame::Sequenced { seq, payload } => {
                buf.put_u16(*seq);
                buf.put_slice(payload);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if !buf.has_remaining() {
            return Err(FrameError::Empty);
        }

        match FrameKind::try_from(buf.get_u8())? {
            kind @ (FrameKind::Hello | FrameKind::Welcome) => {
                if buf.has_remaining() {
                    return Err(FrameError::TrailingControl(buf.remaining()));
                }
                Ok(if kind == FrameKind::Hello {
                    Frame::Hello
                } else {
                    Frame::Welcome
                })
            }
            FrameKind::Data => Ok(Frame::Data(buf)),
            FrameKind::Sequenced => {
                if buf.remaining() < 2 {
                    return Err(FrameError::Truncated);
                }
                let seq = buf.get_u16();
                Ok(Frame::Sequenced { seq, payload: buf })
            }
        }
    }
}

/// Frame an application payload without copying it into a `Frame` first.
/// `seq` selects a sequenced frame.
pub fn encode_data(seq: Option<u16>, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_FRAME_OVERHEAD + payload.len());
    match seq {
        Some(seq) => {
            buf.put_u8(FrameKind::Sequenced as u8);
            buf.put_u16(seq);
        }
        None => buf.put_u8(FrameKind::Data as u8),
    }
    buf.put_slice(payload);
    buf.freeze()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty datagram")]
    Empty,
    #[error("Frame data incomplete")]
    Truncated,
    #[error("Unknown frame kind: {0:#x}")]
    UnknownKind(u8),
    #[error("Control frame followed by {0} extra bytes")]
    TrailingControl(usize),
}
