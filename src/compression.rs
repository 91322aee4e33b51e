//! Stream codecs installed after nsqd agrees to DEFLATE or Snappy.
//!
//! nsqd compresses the whole connection stream, not individual frames, so the
//! encoder and decoder keep state for the lifetime of the connection.

use crate::error::{NsqError, Result};
use bytes::BytesMut;
use flate2::{Compress, Compression as Level, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::{Read, Write};

const SNAPPY_STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";
const SNAPPY_CHUNK_HEADER: usize = 4;

/// Compression actually negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCompression {
    None,
    Deflate { level: u32 },
    Snappy,
}

pub(crate) fn codec(mode: StreamCompression) -> (Encoder, Decoder) {
    match mode {
        StreamCompression::None => (Encoder::Identity, Decoder::Identity),
        StreamCompression::Deflate { level } => (
            // nsqd speaks raw DEFLATE without a zlib header
            Encoder::Deflate(Box::new(Compress::new(Level::new(level), false))),
            Decoder::Deflate(Box::new(Decompress::new(false))),
        ),
        StreamCompression::Snappy => (Encoder::Snappy, Decoder::Snappy(BytesMut::new())),
    }
}

pub(crate) enum Encoder {
    Identity,
    Deflate(Box<Compress>),
    Snappy,
}

impl Encoder {
    pub(crate) fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self {
            Encoder::Identity => {
                out.extend_from_slice(input);
                Ok(())
            }
            Encoder::Deflate(compress) => deflate(compress, input, out),
            Encoder::Snappy => {
                // Every write is a self-contained framed stream; readers skip the
                // repeated stream identifier chunk.
                let mut encoder = snap::write::FrameEncoder::new(Vec::new());
                encoder.write_all(input)?;
                encoder.flush()?;
                let framed = encoder.into_inner().map_err(|_| {
                    NsqError::Compression("snappy encoder failed to flush".to_string())
                })?;
                out.extend_from_slice(&framed);
                Ok(())
            }
        }
    }
}

fn deflate(compress: &mut Compress, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut consumed = 0;
    loop {
        out.reserve(input.len() - consumed + 64);
        let before = compress.total_in();
        compress
            .compress_vec(&input[consumed..], out, FlushCompress::Sync)
            .map_err(|e| NsqError::Compression(e.to_string()))?;
        consumed += (compress.total_in() - before) as usize;
        // a sync flush is complete once the input is drained and output space remains
        if consumed == input.len() && out.len() < out.capacity() {
            return Ok(());
        }
    }
}

pub(crate) enum Decoder {
    Identity,
    Deflate(Box<Decompress>),
    /// Holds a partially received Snappy chunk.
    Snappy(BytesMut),
}

impl Decoder {
    /// Decodes `input` and appends whatever plain bytes are available to `out`.
    pub(crate) fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Decoder::Identity => {
                out.extend_from_slice(input);
                Ok(())
            }
            Decoder::Deflate(decompress) => inflate(decompress, input, out),
            Decoder::Snappy(pending) => {
                pending.extend_from_slice(input);
                unsnappy(pending, out)
            }
        }
    }
}

fn inflate(decompress: &mut Decompress, input: &[u8], out: &mut BytesMut) -> Result<()> {
    let mut plain = Vec::with_capacity(input.len() * 4 + 1024);
    let mut consumed = 0;
    loop {
        plain.reserve(input.len().max(1024));
        let before_in = decompress.total_in();
        let before_out = plain.len();
        let status = decompress
            .decompress_vec(&input[consumed..], &mut plain, FlushDecompress::Sync)
            .map_err(|e| NsqError::Compression(e.to_string()))?;
        consumed += (decompress.total_in() - before_in) as usize;

        if status == Status::StreamEnd {
            break;
        }
        let stalled = decompress.total_in() == before_in && plain.len() == before_out;
        if stalled || (consumed == input.len() && plain.len() < plain.capacity()) {
            break;
        }
    }
    out.extend_from_slice(&plain);
    Ok(())
}

fn unsnappy(pending: &mut BytesMut, out: &mut BytesMut) -> Result<()> {
    while pending.len() >= SNAPPY_CHUNK_HEADER {
        let chunk_type = pending[0];
        let len = u32::from_le_bytes([pending[1], pending[2], pending[3], 0]) as usize;
        if pending.len() < SNAPPY_CHUNK_HEADER + len {
            break;
        }
        let chunk = pending.split_to(SNAPPY_CHUNK_HEADER + len);

        match chunk_type {
            0xff => {
                if chunk.as_ref() != SNAPPY_STREAM_IDENTIFIER {
                    return Err(NsqError::Compression(
                        "invalid snappy stream identifier".to_string(),
                    ));
                }
            }
            0x00 | 0x01 => {
                let mut framed = Vec::with_capacity(SNAPPY_STREAM_IDENTIFIER.len() + chunk.len());
                framed.extend_from_slice(SNAPPY_STREAM_IDENTIFIER);
                framed.extend_from_slice(&chunk);
                let mut plain = Vec::new();
                snap::read::FrameDecoder::new(&framed[..])
                    .read_to_end(&mut plain)
                    .map_err(|e| NsqError::Compression(e.to_string()))?;
                out.extend_from_slice(&plain);
            }
            0x02..=0x7f => {
                return Err(NsqError::Compression(format!(
                    "unsupported snappy chunk type {chunk_type:#04x}"
                )));
            }
            // skippable padding and reserved chunks
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_in_pieces(mode: StreamCompression, writes: &[&[u8]], piece: usize) -> Vec<u8> {
        let (mut encoder, _) = codec(mode);
        let (_, mut decoder) = codec(mode);

        let mut wire = Vec::new();
        for write in writes {
            encoder.encode(write, &mut wire).unwrap();
        }

        let mut plain = BytesMut::new();
        for chunk in wire.chunks(piece) {
            decoder.decode(chunk, &mut plain).unwrap();
        }
        plain.to_vec()
    }

    #[test]
    fn test_identity_passthrough() {
        let plain = roundtrip_in_pieces(StreamCompression::None, &[&b"RDY 1\n"[..]], 2);
        assert_eq!(plain, b"RDY 1\n");
    }

    #[test]
    fn test_deflate_stream_across_partial_reads() {
        let payload = b"FIN 0123456789abcdef\n".repeat(50);
        let writes: [&[u8]; 3] = [b"NOP\n", &payload, b"RDY 10\n"];
        let plain = roundtrip_in_pieces(StreamCompression::Deflate { level: 6 }, &writes, 7);

        let mut expected = b"NOP\n".to_vec();
        expected.extend_from_slice(&payload);
        expected.extend_from_slice(b"RDY 10\n");
        assert_eq!(plain, expected);
    }

    #[test]
    fn test_deflate_output_is_flushed_per_write() {
        let (mut encoder, _) = codec(StreamCompression::Deflate { level: 1 });
        let (_, mut decoder) = codec(StreamCompression::Deflate { level: 1 });
        let mut wire = Vec::new();
        encoder.encode(b"NOP\n", &mut wire).unwrap();

        // The peer must be able to decode a write without waiting for the next one.
        let mut plain = BytesMut::new();
        decoder.decode(&wire, &mut plain).unwrap();
        assert_eq!(plain.as_ref(), b"NOP\n");
    }

    #[test]
    fn test_snappy_stream_across_partial_reads() {
        let big = vec![b'z'; 70_000];
        let writes: [&[u8]; 3] = [b"first", &big, b"last"];
        let plain = roundtrip_in_pieces(StreamCompression::Snappy, &writes, 13);

        assert_eq!(plain.len(), 5 + 70_000 + 4);
        assert!(plain.starts_with(b"first"));
        assert!(plain.ends_with(b"last"));
    }

    #[test]
    fn test_snappy_rejects_corrupt_chunk() {
        let (mut encoder, mut decoder) = codec(StreamCompression::Snappy);
        let mut wire = Vec::new();
        encoder.encode(b"hello snappy", &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let mut plain = BytesMut::new();
        assert!(matches!(
            decoder.decode(&wire, &mut plain),
            Err(NsqError::Compression(_))
        ));
    }

    #[test]
    fn test_snappy_rejects_unskippable_chunk() {
        let (_, mut decoder) = codec(StreamCompression::Snappy);
        let mut plain = BytesMut::new();
        let result = decoder.decode(&[0x05, 0x01, 0x00, 0x00, 0xaa], &mut plain);
        assert!(matches!(result, Err(NsqError::Compression(_))));
    }
}
