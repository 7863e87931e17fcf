//! Wire envelope: a one-byte status code (responses only) followed by the
//! uvarint length of the uncompressed body and the snappy-framed ssz payload.
//!
//! The length prefix describes the *uncompressed* size, so decoding bounds
//! the compressed input by the worst-case compression length for that size;
//! a frame that needs more input than that is malicious.

use snap::read::FrameDecoder;
use snap::write::FrameEncoder;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::{RpcError, RpcStatus};

/// Longest accepted uvarint length prefix (a u64 needs at most 10 bytes).
const MAX_VARINT_LEN: usize = 10;

/// Encode `bytes` as a length-prefixed snappy frame.
pub fn encode_frame(bytes: &[u8], max_uncompressed: usize) -> Result<Vec<u8>, RpcError> {
    if bytes.len() > max_uncompressed {
        return Err(RpcError::Internal(
            "attempting to encode data above the message size limit",
        ));
    }

    let mut out = Vec::with_capacity(bytes.len() / 2 + MAX_VARINT_LEN);
    let mut prefix = unsigned_varint::encode::usize_buffer();
    out.extend_from_slice(unsigned_varint::encode::usize(bytes.len(), &mut prefix));

    let mut writer = FrameEncoder::new(Vec::new());
    writer
        .write_all(bytes)
        .map_err(|e| RpcError::StreamWrite(e.to_string()))?;
    writer
        .flush()
        .map_err(|e| RpcError::StreamWrite(e.to_string()))?;
    out.extend_from_slice(writer.get_ref());
    Ok(out)
}

/// Decode one frame from a fully buffered stream half.
pub fn decode_frame(buf: &[u8], max_uncompressed: usize) -> Result<Vec<u8>, RpcError> {
    let (length, compressed) = unsigned_varint::decode::usize(buf)
        .map_err(|_| RpcError::InvalidData("invalid length prefix".to_string()))?;
    if length > max_uncompressed {
        return Err(RpcError::InvalidData(format!(
            "frame length {length} exceeds limit {max_uncompressed}"
        )));
    }

    let max_compressed = snap::raw::max_compress_len(length);
    if compressed.len() > max_compressed {
        return Err(RpcError::InvalidData(format!(
            "malicious snappy frame: {} compressed bytes for {} uncompressed",
            compressed.len(),
            length
        )));
    }

    let mut decoded = vec![0u8; length];
    FrameDecoder::new(compressed)
        .read_exact(&mut decoded)
        .map_err(|e| RpcError::InvalidData(format!("snappy decoding failed: {e}")))?;
    Ok(decoded)
}

/// Worst-case on-the-wire size of a frame holding `max_uncompressed` bytes.
pub fn frame_cap(max_uncompressed: usize) -> usize {
    MAX_VARINT_LEN + snap::raw::max_compress_len(max_uncompressed)
}

pub async fn write_status<S>(io: &mut S, status: RpcStatus) -> Result<(), RpcError>
where
    S: AsyncWrite + Unpin,
{
    io.write_all(&[status as u8])
        .await
        .map_err(|e| RpcError::StreamWrite(e.to_string()))
}

pub async fn read_status<S>(io: &mut S) -> Result<RpcStatus, RpcError>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    io.read_exact(&mut byte)
        .await
        .map_err(|e| RpcError::StreamRead(e.to_string()))?;
    RpcStatus::from_u8(byte[0])
        .ok_or_else(|| RpcError::InvalidData(format!("unknown status code {}", byte[0])))
}

pub async fn write_frame<S>(
    io: &mut S,
    bytes: &[u8],
    max_uncompressed: usize,
) -> Result<(), RpcError>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode_frame(bytes, max_uncompressed)?;
    io.write_all(&frame)
        .await
        .map_err(|e| RpcError::StreamWrite(e.to_string()))
}

/// Read the remainder of the stream half (the sender closes its write side
/// after the frame) and decode it, never buffering more than the worst-case
/// compressed size.
pub async fn read_frame<S>(io: &mut S, max_uncompressed: usize) -> Result<Vec<u8>, RpcError>
where
    S: AsyncRead + Unpin,
{
    let cap = frame_cap(max_uncompressed) as u64;
    let mut buf = Vec::new();
    io.take(cap + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| RpcError::StreamRead(e.to_string()))?;
    if buf.len() as u64 > cap {
        return Err(RpcError::InvalidData(
            "frame exceeds worst-case compressed size".to_string(),
        ));
    }
    decode_frame(&buf, max_uncompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let payload = b"the quick brown fox jumps over the lazy dag".repeat(100);
        let frame = encode_frame(&payload, 1 << 20).unwrap();
        assert_eq!(decode_frame(&frame, 1 << 20).unwrap(), payload);
    }

    #[test]
    fn empty_frame_round_trips() {
        let frame = encode_frame(&[], 1024).unwrap();
        assert_eq!(decode_frame(&frame, 1024).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_oversized_encode() {
        assert!(encode_frame(&[0u8; 100], 10).is_err());
    }

    #[test]
    fn rejects_length_above_limit() {
        let frame = encode_frame(&[7u8; 512], 1024).unwrap();
        assert!(matches!(
            decode_frame(&frame, 128),
            Err(RpcError::InvalidData(_))
        ));
    }

    #[test]
    fn rejects_compressed_overrun() {
        // Claim a tiny uncompressed length but attach far more compressed
        // data than that length could ever produce.
        let mut frame = encode_frame(&[1u8; 8], 1024).unwrap();
        frame.extend_from_slice(&[0u8; 4096]);
        assert!(matches!(
            decode_frame(&frame, 1024),
            Err(RpcError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn status_and_frame_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload = vec![42u8; 300];

        write_status(&mut a, RpcStatus::Success).await.unwrap();
        write_frame(&mut a, &payload, 1024).await.unwrap();
        a.shutdown().await.unwrap();

        assert_eq!(read_status(&mut b).await.unwrap(), RpcStatus::Success);
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), payload);
    }
}
