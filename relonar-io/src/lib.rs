// SPDX-License-Identifier: MIT

//! Async wire framing for the NAR byte stream.
//!
//! Every token on the wire is a little-endian u64 length, followed by the
//! payload, followed by zero bytes up to the next 8-byte boundary. The
//! reader discards padding without inspecting it; the writer always emits
//! zeros.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire layout helpers.
pub mod wire {
    /// Zero bytes for padding.
    pub const ZEROS: [u8; 8] = [0u8; 8];

    /// Round a payload length up to the next 8-byte boundary.
    pub const fn calc_aligned(len: u64) -> u64 {
        len.wrapping_add(7) & !7
    }

    /// Number of padding bytes following a payload of the given length.
    pub const fn calc_padding(len: u64) -> usize {
        let aligned = calc_aligned(len);
        aligned.wrapping_sub(len) as usize
    }
}

#[derive(Error, Debug)]
pub enum FramingError {
    /// The input ended in the middle of a token.
    #[error("unexpected end of input")]
    TruncatedInput,

    #[error("I/O error reading framed stream")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for FramingError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FramingError::TruncatedInput
        } else {
            FramingError::Io(err)
        }
    }
}

/// Read a little-endian u64.
pub async fn read_u64<R>(reader: &mut R) -> Result<u64, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Read `len` payload bytes plus their padding, returning only the payload.
pub async fn read_payload<R>(reader: &mut R, len: u64) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    let aligned = wire::calc_aligned(len);
    let aligned = usize::try_from(aligned).map_err(|_| FramingError::TruncatedInput)?;

    let mut buf = BytesMut::zeroed(aligned);
    reader.read_exact(&mut buf).await?;
    buf.truncate(len as usize);
    Ok(buf.freeze())
}

/// Read a full framed token: length, payload, padding.
pub async fn read_bytes<R>(reader: &mut R) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    let len = read_u64(reader).await?;
    read_payload(reader, len).await
}

/// Write a little-endian u64.
pub async fn write_u64<W>(writer: &mut W, value: u64) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&value.to_le_bytes()).await
}

/// Write a framed token: length, payload, zero padding.
pub async fn write_bytes<W>(writer: &mut W, payload: &[u8]) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u64;
    write_u64(writer, len).await?;
    writer.write_all(payload).await?;

    let padding = wire::calc_padding(len);
    if padding > 0 {
        writer.write_all(&wire::ZEROS[..padding]).await?;
    }
    Ok(())
}

/// Encode a single token to a fresh buffer. Convenience for tests and for
/// building golden wire vectors.
pub fn encode_bytes(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u64;
    let mut out = Vec::with_capacity(8 + wire::calc_aligned(len) as usize);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&wire::ZEROS[..wire::calc_padding(len)]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn u64_round_trip() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 0xdead_beef_cafe_f00d).await.unwrap();
        assert_eq!(buf.len(), 8);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u64(&mut cursor).await.unwrap(), 0xdead_beef_cafe_f00d);
    }

    #[tokio::test]
    async fn string_round_trip_and_length() {
        for payload in [
            &b""[..],
            b"a",
            b"1234567",
            b"12345678",
            b"123456789",
            b"nix-archive-1",
        ] {
            let mut buf = Vec::new();
            write_bytes(&mut buf, payload).await.unwrap();

            let len = payload.len() as u64;
            assert_eq!(
                buf.len() as u64,
                8 + len + wire::calc_padding(len) as u64,
                "encoded length for {payload:?}"
            );

            let mut cursor = Cursor::new(buf);
            let decoded = read_bytes(&mut cursor).await.unwrap();
            assert_eq!(&decoded[..], payload);
        }
    }

    #[tokio::test]
    async fn padding_is_zero() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"abc").await.unwrap();
        assert_eq!(&buf[8 + 3..], &[0u8; 5]);
    }

    #[tokio::test]
    async fn encode_bytes_matches_writer() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"contents").await.unwrap();
        assert_eq!(buf, encode_bytes(b"contents"));
    }

    #[tokio::test]
    async fn short_read_is_truncated_input() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        assert!(matches!(
            read_u64(&mut cursor).await,
            Err(FramingError::TruncatedInput)
        ));

        // Length claims 16 bytes but only 4 follow.
        let mut data = 16u64.to_le_bytes().to_vec();
        data.extend_from_slice(b"abcd");
        let mut cursor = Cursor::new(data);
        assert!(matches!(
            read_bytes(&mut cursor).await,
            Err(FramingError::TruncatedInput)
        ));
    }

    #[test]
    fn proptest_round_trip() {
        use proptest::prelude::*;

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        proptest!(|(payload in proptest::collection::vec(any::<u8>(), 0..512))| {
            rt.block_on(async {
                let mut buf = Vec::new();
                write_bytes(&mut buf, &payload).await.unwrap();
                prop_assert_eq!(buf.len() % 8, 0);

                let mut cursor = Cursor::new(buf);
                let decoded = read_bytes(&mut cursor).await.unwrap();
                prop_assert_eq!(&decoded[..], &payload[..]);
                Ok(())
            })?;
        });
    }
}
