//! Byte-level framing of LDAPMessages from a raw stream.
//!
//! # Wire Format
//!
//! Each frame is:
//! - `0x30`: universal constructed SEQUENCE tag
//! - length: one byte below `0x80`, or `0x80 | n` followed by `n` (1..=4)
//!   big-endian length bytes
//! - `[u8; length]`: payload, starting with the INTEGER message id
//!
//! Bytes that do not start a frame are skipped one at a time. End of stream
//! anywhere before a frame is complete is reported as `Ok(None)`.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ber::{MAX_LENGTH_OCTETS, TAG_SEQUENCE};

/// Upper bound on a single read into the frame buffer.
const READ_CHUNK: usize = 8 * 1024;

async fn read_byte<R>(reader: &mut R) -> io::Result<Option<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_u8().await {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Append exactly `len` bytes to `buf`, growing it as data arrives.
/// Returns `false` on end of stream.
async fn read_into<R>(reader: &mut R, buf: &mut BytesMut, len: usize) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let target = buf.len() + len;
    while buf.len() < target {
        let want = (target - buf.len()).min(READ_CHUNK);
        buf.reserve(want);
        let n = (&mut *reader).take(want as u64).read_buf(buf).await?;
        if n == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Read the next complete frame, tag and length octets included.
///
/// Returns `Ok(None)` on end of stream. A long-form length using more than
/// four octets, or a length above `max_frame_len`, is an `InvalidData` error.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let Some(tag) = read_byte(reader).await? else {
            return Ok(None);
        };
        if tag != TAG_SEQUENCE {
            tracing::trace!(tag, "skipping byte outside of a frame");
            continue;
        }

        let Some(first) = read_byte(reader).await? else {
            return Ok(None);
        };
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(tag);
        buf.put_u8(first);

        let len = if first & 0x80 != 0 {
            let count = usize::from(first & 0x7f);
            if count > MAX_LENGTH_OCTETS {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("length coded with too many bytes: {count}"),
                ));
            }
            let start = buf.len();
            if !read_into(reader, &mut buf, count).await? {
                return Ok(None);
            }
            buf[start..]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
        } else {
            usize::from(first)
        };

        if len > max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {len} > {max_frame_len}"),
            ));
        }

        if !read_into(reader, &mut buf, len).await? {
            return Ok(None);
        }
        return Ok(Some(buf.freeze()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::put_tlv;
    use tokio::io::AsyncWriteExt;

    const MAX: usize = 16 * 1024 * 1024;

    fn frame(payload_len: usize) -> Bytes {
        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
        let mut out = BytesMut::new();
        put_tlv(&mut out, TAG_SEQUENCE, &payload);
        out.freeze()
    }

    #[tokio::test]
    async fn round_trips_short_and_long_forms() {
        for len in [0usize, 1, 0x7f, 0x80, 0xff, 0x100, 70_000] {
            let raw = frame(len);
            let mut reader = &raw[..];
            let got = read_frame(&mut reader, MAX).await.unwrap().unwrap();
            assert_eq!(got, raw, "payload length {len}");
            assert!(read_frame(&mut reader, MAX).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn accepts_non_minimal_long_form() {
        let raw: &[u8] = &[0x30, 0x84, 0x00, 0x00, 0x00, 0x02, 0xaa, 0xbb];
        let mut reader = raw;
        let got = read_frame(&mut reader, MAX).await.unwrap().unwrap();
        assert_eq!(&got[..], raw);
    }

    #[tokio::test]
    async fn skips_bytes_before_a_frame() {
        let raw: &[u8] = &[0x00, 0x17, 0x30, 0x01, 0x42];
        let mut reader = raw;
        let got = read_frame(&mut reader, MAX).await.unwrap().unwrap();
        assert_eq!(&got[..], &[0x30, 0x01, 0x42]);
    }

    #[tokio::test]
    async fn eof_mid_frame_is_clean() {
        for raw in [
            &[0x30][..],
            &[0x30, 0x82, 0x01][..],
            &[0x30, 0x05, 0x02, 0x01][..],
        ] {
            let mut reader = raw;
            assert!(read_frame(&mut reader, MAX).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn rejects_oversized_length_encoding() {
        let raw: &[u8] = &[0x30, 0x85, 0x01, 0x00, 0x00, 0x00, 0x00];
        let mut reader = raw;
        let err = read_frame(&mut reader, MAX).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_frames_above_limit() {
        let raw = frame(300);
        let mut reader = &raw[..];
        let err = read_frame(&mut reader, 256).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn tolerates_short_reads() {
        let raw = frame(5_000);
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let writer = tokio::spawn({
            let raw = raw.clone();
            async move {
                for chunk in raw.chunks(7) {
                    tx.write_all(chunk).await.unwrap();
                }
            }
        });
        let got = read_frame(&mut rx, MAX).await.unwrap().unwrap();
        assert_eq!(got, raw);
        writer.await.unwrap();
    }
}

#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;

    use super::*;

    const MAX: usize = 16 * 1024 * 1024;

    /// SEQUENCE around `payload`. `long_octets` forces the long length form
    /// with at least that many octets.
    fn encode(payload: &[u8], long_octets: Option<usize>) -> Vec<u8> {
        let mut out = vec![TAG_SEQUENCE];
        match long_octets {
            None if payload.len() < 0x80 => out.push(payload.len() as u8),
            _ => {
                let be = (payload.len() as u32).to_be_bytes();
                let minimal = be.iter().position(|b| *b != 0).map_or(1, |i| 4 - i);
                let count = long_octets.unwrap_or(minimal).max(minimal);
                out.push(0x80 | count as u8);
                out.extend_from_slice(&be[4 - count..]);
            }
        }
        out.extend_from_slice(payload);
        out
    }

    /// Feed `raw` through a pipe `chunk` bytes at a time and read it back:
    /// the first frame, then whatever follows it.
    fn read_chunked(raw: Vec<u8>, chunk: usize) -> (Option<Bytes>, Option<Bytes>) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async move {
            let (mut tx, mut rx) = tokio::io::duplex(chunk);
            let writer = tokio::spawn(async move {
                for piece in raw.chunks(chunk) {
                    tx.write_all(piece).await.unwrap();
                }
            });
            let first = read_frame(&mut rx, MAX).await.unwrap();
            let rest = read_frame(&mut rx, MAX).await.unwrap();
            writer.await.unwrap();
            (first, rest)
        })
    }

    proptest! {
        #[test]
        fn frames_survive_chunked_delivery(
            payload in proptest::collection::vec(any::<u8>(), 0..600),
            long_octets in proptest::option::of(1usize..=4),
            chunk in 1usize..97,
        ) {
            let raw = encode(&payload, long_octets);
            let (first, rest) = read_chunked(raw.clone(), chunk);
            prop_assert_eq!(first.as_deref(), Some(&raw[..]));
            prop_assert!(rest.is_none());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn large_frames_survive_chunked_delivery(
            len in 0x100usize..70_000,
            seed in any::<u8>(),
            chunk in 512usize..8192,
        ) {
            let payload: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_add(seed)).collect();
            let raw = encode(&payload, None);
            let (first, rest) = read_chunked(raw.clone(), chunk);
            prop_assert_eq!(first.as_deref(), Some(&raw[..]));
            prop_assert!(rest.is_none());
        }
    }
}
