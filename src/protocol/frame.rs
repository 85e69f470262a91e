use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use super::codes::{self, EorCode, InterruptReason};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Longest length prefix accepted before the colon
const MAX_LEN_DIGITS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("expected digit reading length")]
    InvalidLength,

    #[error("expected digit reading command")]
    InvalidCommand,

    #[error("missing terminating comma")]
    MissingTerminator,

    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("truncated frame")]
    Truncated,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One netstring frame: `<len>:<cmd>[ <payload>],`
///
/// A composite frame has command 0 and its payload is the concatenation of
/// serialized sub-frames.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: i32,
    pub payload: Bytes,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 64;
        let shown = &self.payload[..self.payload.len().min(PREVIEW)];
        f.debug_struct("Frame")
            .field("cmd", &self.cmd)
            .field("len", &self.payload.len())
            .field("payload", &String::from_utf8_lossy(shown))
            .finish()
    }
}

impl Frame {
    pub fn new(cmd: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            payload: payload.into(),
        }
    }

    pub fn empty(cmd: i32) -> Self {
        Self::new(cmd, Bytes::new())
    }

    /// Wrap `frames` into one composite frame
    pub fn composite(frames: &[Frame]) -> Self {
        let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
        for f in frames {
            f.encode(&mut buf);
        }
        Self::new(codes::COMPOSITE, buf.freeze())
    }

    pub fn is_composite(&self) -> bool {
        self.cmd == codes::COMPOSITE
    }

    /// Sub-frames of a composite frame; a flat frame yields itself
    pub fn sub_frames(&self) -> Result<Vec<Frame>, FrameError> {
        if !self.is_composite() {
            return Ok(vec![self.clone()]);
        }
        let mut buf = BytesMut::from(&self.payload[..]);
        let mut out = Vec::new();
        while !buf.is_empty() {
            match decode(&mut buf)? {
                Some(f) => out.push(f),
                None => return Err(FrameError::Truncated),
            }
        }
        Ok(out)
    }

    /// Number of requests the worker accounts for this frame
    pub fn request_count(&self) -> u16 {
        if !self.is_composite() {
            return 1;
        }
        self.sub_frames().map(|v| v.len().max(1) as u16).unwrap_or(1)
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    fn body_len(&self) -> usize {
        let cmd_len = itoa_len(self.cmd);
        if self.payload.is_empty() {
            cmd_len
        } else {
            cmd_len + 1 + self.payload.len()
        }
    }

    pub fn encoded_len(&self) -> usize {
        let body = self.body_len();
        itoa_len(body as i32) + 1 + body + 1
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let body = self.body_len();
        buf.reserve(self.encoded_len());
        buf.put_slice(body.to_string().as_bytes());
        buf.put_u8(b':');
        buf.put_slice(self.cmd.to_string().as_bytes());
        if !self.payload.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(&self.payload);
        }
        buf.put_u8(b',');
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// End-of-request frame: status digit, request id, then data
    pub fn eor(code: EorCode, rq_id: u16, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(3 + data.len());
        buf.put_u8(code.digit());
        buf.put_u16(rq_id);
        buf.put_slice(data);
        Self::new(codes::EOR, buf.freeze())
    }

    /// Split an EOR payload into (status, request id, data)
    ///
    /// A lone status digit carries no request id. A request id cut short
    /// after one byte is malformed.
    pub fn parse_eor(&self) -> Option<(EorCode, Option<u16>, Bytes)> {
        if self.cmd != codes::EOR || self.payload.is_empty() {
            return None;
        }
        let code = EorCode::from_digit(self.payload[0])?;
        match self.payload.len() {
            1 => return Some((code, None, Bytes::new())),
            2 => return None,
            _ => {}
        }
        let mut rest = self.payload.slice(1..);
        let rq_id = rest.get_u16();
        Some((code, Some(rq_id), rest))
    }

    /// Interrupt sent on a worker's control stream
    pub fn interrupt(reason: InterruptReason, rq_id: u16) -> Self {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(reason as u8);
        buf.put_u16(rq_id);
        Self::new(codes::INTERRUPT, buf.freeze())
    }

    pub fn parse_interrupt(&self) -> Option<(InterruptReason, u16)> {
        if self.cmd != codes::INTERRUPT || self.payload.len() < 3 {
            return None;
        }
        let mut p = self.payload.clone();
        let reason = InterruptReason::from_byte(p.get_u8());
        Some((reason, p.get_u16()))
    }
}

fn itoa_len(n: i32) -> usize {
    let mut len = if n < 0 { 2 } else { 1 };
    let mut v = n.unsigned_abs();
    while v >= 10 {
        v /= 10;
        len += 1;
    }
    len
}

/// Decode one frame from the front of `buf`
///
/// Returns `Ok(None)` when more bytes are needed; consumed bytes are removed
/// only once a whole frame is available.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let Some(colon) = buf.iter().take(MAX_LEN_DIGITS + 1).position(|&b| b == b':') else {
        if buf.len() > MAX_LEN_DIGITS {
            return Err(FrameError::InvalidLength);
        }
        if buf.iter().any(|b| !b.is_ascii_digit()) {
            return Err(FrameError::InvalidLength);
        }
        return Ok(None);
    };

    if colon == 0 {
        return Err(FrameError::InvalidLength);
    }
    let mut len = 0usize;
    for &b in &buf[..colon] {
        if !b.is_ascii_digit() {
            return Err(FrameError::InvalidLength);
        }
        len = len * 10 + (b - b'0') as usize;
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let total = colon + 1 + len + 1;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    if buf[total - 1] != b',' {
        return Err(FrameError::MissingTerminator);
    }

    let mut frame = buf.split_to(total).freeze();
    frame.advance(colon + 1);
    frame.truncate(len);

    let mut cmd: i32 = 0;
    let mut next = 0;
    while next < frame.len() {
        let b = frame[next];
        if b == b' ' {
            next += 1;
            break;
        }
        if !b.is_ascii_digit() {
            return Err(FrameError::InvalidCommand);
        }
        cmd = cmd
            .checked_mul(10)
            .and_then(|c| c.checked_add((b - b'0') as i32))
            .ok_or(FrameError::InvalidCommand)?;
        next += 1;
    }
    if next == 0 {
        return Err(FrameError::InvalidCommand);
    }

    Ok(Some(Frame {
        cmd,
        payload: frame.slice(next..),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        assert_eq!(&Frame::empty(codes::SERVER_ALIVE).to_bytes()[..], b"4:1009,");
        assert_eq!(&Frame::empty(codes::RC_OK).to_bytes()[..], b"1:5,");
        assert_eq!(
            &Frame::new(codes::PREPARE, "select 1").to_bytes()[..],
            b"10:1 select 1,"
        );
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut buf = BytesMut::from(&b"10:1 sel"[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ect 1,4:1009,");

        let f = decode(&mut buf).unwrap().unwrap();
        assert_eq!(f.cmd, codes::PREPARE);
        assert_eq!(&f.payload[..], b"select 1");

        let f = decode(&mut buf).unwrap().unwrap();
        assert_eq!(f.cmd, codes::SERVER_ALIVE);
        assert!(f.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut buf = BytesMut::from(&b"x1:5,"[..]);
        assert!(matches!(decode(&mut buf), Err(FrameError::InvalidLength)));

        let mut buf = BytesMut::from(&b"3:5ab;"[..]);
        assert!(matches!(decode(&mut buf), Err(FrameError::MissingTerminator)));

        let mut buf = BytesMut::from(&b"2:a5,"[..]);
        assert!(matches!(decode(&mut buf), Err(FrameError::InvalidCommand)));
    }

    #[test]
    fn test_composite_sub_frames() {
        let parts = vec![
            Frame::new(codes::PREPARE, "select * from t where id = :id"),
            Frame::new(codes::BIND_NAME, "id"),
            Frame::new(codes::BIND_VALUE, "42"),
            Frame::empty(codes::EXECUTE),
        ];
        let composite = Frame::composite(&parts);

        assert!(composite.is_composite());
        assert_eq!(composite.sub_frames().unwrap(), parts);
        assert_eq!(composite.request_count(), 4);

        let mut buf = BytesMut::from(&composite.to_bytes()[..]);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), composite);
    }

    #[test]
    fn test_eor_payload() {
        let f = Frame::eor(EorCode::InTransaction, 0xBEEF, b"3:3 1,");
        let (code, rq, data) = f.parse_eor().unwrap();
        assert_eq!(code, EorCode::InTransaction);
        assert_eq!(rq, Some(0xBEEF));
        assert_eq!(&data[..], b"3:3 1,");

        let bare = Frame::new(codes::EOR, "0");
        assert_eq!(bare.parse_eor().unwrap().1, None);

        let truncated = Frame::new(codes::EOR, &b"0\x01"[..]);
        assert_eq!(truncated.parse_eor(), None);

        let id_only = Frame::eor(EorCode::Free, 9, &[]);
        assert_eq!(id_only.parse_eor(), Some((EorCode::Free, Some(9), Bytes::new())));
    }

    #[test]
    fn test_interrupt_payload() {
        let f = Frame::interrupt(InterruptReason::Saturation, 7);
        assert_eq!(f.parse_interrupt(), Some((InterruptReason::Saturation, 7)));
    }
}
