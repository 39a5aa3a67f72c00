//! Fixed-size frame codec
//!
//! Frames are exactly [`FRAME_SIZE`] bytes. There is no reassembly: a read
//! that produces fewer bytes than a full frame is reported as noise and the
//! caller discards it.


use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    DecodeError, Frame, Request, FRAME_SIZE, MESSAGE_SIZE, REQUEST_SIZE, TOPIC_SIZE,
};

/// Buffer large enough for one frame
pub type FrameBuf = [u8; FRAME_SIZE];

/// Text sent to peers that cannot be admitted
pub const REJECTION_NOTICE: &str = "Cannot join server, please try again later\n";

/// Result of a single read from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete frame
    Frame(Frame),
    /// A short read of the given length, to be ignored
    Noise(usize),
    /// Peer closed the stream
    Closed,
}

/// Encode a frame into exactly [`FRAME_SIZE`] bytes
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    buf.reserve(FRAME_SIZE);
    put_field(buf, frame.request.as_str(), REQUEST_SIZE);
    put_field(buf, &frame.topic, TOPIC_SIZE);
    put_field(buf, &frame.message, MESSAGE_SIZE);
}

/// Encode a frame into a fresh buffer
pub fn frame_bytes(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    encode_frame(frame, &mut buf);
    buf
}

/// Decode a frame from a buffer that must be exactly [`FRAME_SIZE`] bytes
pub fn decode_frame(buf: &[u8]) -> Result<Frame, DecodeError> {
    if buf.len() != FRAME_SIZE {
        return Err(DecodeError::FrameSize {
            expected: FRAME_SIZE,
            actual: buf.len(),
        });
    }

    let (request, rest) = buf.split_at(REQUEST_SIZE);
    let (topic, message) = rest.split_at(TOPIC_SIZE);

    Ok(Frame {
        request: Request::parse(&read_field(request)),
        topic: read_field(topic),
        message: read_field(message),
    })
}

/// Encode a free-form notice padded to a full frame
///
/// Used for peers that are turned away before a session exists. A
/// frame-decoding peer sees the notice in the request field.
pub fn encode_notice(text: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    put_field(&mut buf, text, FRAME_SIZE);
    buf
}

/// Perform one read of up to a frame's worth of bytes
///
/// Cancel safe: the only await point is a single `read`.
pub async fn read_frame<R>(reader: &mut R, buf: &mut FrameBuf) -> std::io::Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let n = reader.read(&mut buf[..]).await?;
    if n == 0 {
        return Ok(ReadOutcome::Closed);
    }
    match decode_frame(&buf[..n]) {
        Ok(frame) => Ok(ReadOutcome::Frame(frame)),
        Err(DecodeError::FrameSize { actual, .. }) => Ok(ReadOutcome::Noise(actual)),
    }
}

/// Encode and write a single frame
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame_bytes(frame);
    writer.write_all(&buf).await
}

/// Write `value` null-padded to `width`, keeping at least one terminating NUL
fn put_field(buf: &mut BytesMut, value: &str, width: usize) {
    let mut len = value.len().min(width - 1);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_slice(&value.as_bytes()[..len]);
    buf.put_bytes(0, width - len);
}

/// Read a null-padded field up to its first NUL
fn read_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
