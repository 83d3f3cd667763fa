// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content-Encoding aware body codecs.
//!
//! Decoding is streaming: [`new_decompressor`] wraps a body reader and
//! yields decoded bytes as compressed input arrives, so chunk boundaries
//! downstream are always in decoded space.  Encodings that are not
//! understood are rejected rather than passed through.
//!
//! | token              | codec                      |
//! |--------------------|----------------------------|
//! | `gzip`, `x-gzip`   | flate2 gzip                |
//! | `deflate`          | flate2 zlib                |
//! | `br`               | brotli                     |
//! | `zstd`             | zstd                       |
//! | `identity` / none  | pass-through               |


use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use http::HeaderMap;
use http::header::CONTENT_ENCODING;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;
const ZSTD_LEVEL: i32 = 3;

/// A boxed, buffered byte source.
pub type BodyReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Errors raised while selecting or running a codec.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported content encoding: {0}")]
    Unsupported(String),

    #[error("invalid Content-Encoding header")]
    InvalidHeader,

    #[error("stacked content encodings cannot be produced: {0}")]
    Stacked(String),

    #[error("codec IO error: {0}")]
    Io(#[from] io::Error),
}

/// A single content coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl Encoding {
    /// Parse one coding token, case-insensitively.
    pub fn parse(token: &str) -> Result<Self, CodecError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Encoding::Identity),
            "gzip" | "x-gzip" => Ok(Encoding::Gzip),
            "deflate" => Ok(Encoding::Deflate),
            "br" => Ok(Encoding::Brotli),
            "zstd" => Ok(Encoding::Zstd),
            other => Err(CodecError::Unsupported(other.to_string())),
        }
    }

    /// Codings listed in `Content-Encoding`, in the order they were applied.
    /// Identity entries are dropped.
    pub fn from_headers(headers: &HeaderMap) -> Result<Vec<Encoding>, CodecError> {
        let mut encodings = Vec::new();
        for value in headers.get_all(CONTENT_ENCODING) {
            let value = value.to_str().map_err(|_| CodecError::InvalidHeader)?;
            for token in value.split(',') {
                match Encoding::parse(token)? {
                    Encoding::Identity => {}
                    encoding => encodings.push(encoding),
                }
            }
        }
        Ok(encodings)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
            Encoding::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the headers announce any non-identity coding.
pub fn is_encoded(headers: &HeaderMap) -> Result<bool, CodecError> {
    Ok(!Encoding::from_headers(headers)?.is_empty())
}

/// Wrap `body` in decoders for every coding listed in `headers`.
pub fn new_decompressor(headers: &HeaderMap, body: BodyReader) -> Result<BodyReader, CodecError> {
    decode_chain(&Encoding::from_headers(headers)?, body)
}

/// Undo `encodings`, given in the order they were applied.
pub fn decode_chain(encodings: &[Encoding], body: BodyReader) -> Result<BodyReader, CodecError> {
    let mut reader = body;
    for encoding in encodings.iter().rev() {
        reader = decode(*encoding, reader)?;
    }
    Ok(reader)
}

/// Wrap `writer` in the encoder named by `headers`.
pub fn new_compressor<W: Write>(headers: &HeaderMap, writer: W) -> Result<Compressor<W>, CodecError> {
    let encodings = Encoding::from_headers(headers)?;
    match encodings.as_slice() {
        [] => Ok(Compressor::Identity(writer)),
        [encoding] => Compressor::new(*encoding, writer),
        many => Err(CodecError::Stacked(
            many.iter().map(Encoding::as_str).collect::<Vec<_>>().join(", "),
        )),
    }
}

/// Streaming encoder for one coding.  Call [`Compressor::finish`] to write
/// the trailing frame and get the inner writer back.
pub enum Compressor<W: Write> {
    Identity(W),
    Gzip(GzEncoder<W>),
    Deflate(ZlibEncoder<W>),
    Brotli(Box<brotli::CompressorWriter<W>>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Compressor<W> {
    pub fn new(encoding: Encoding, writer: W) -> Result<Self, CodecError> {
        Ok(match encoding {
            Encoding::Identity => Compressor::Identity(writer),
            Encoding::Gzip => Compressor::Gzip(GzEncoder::new(writer, Compression::default())),
            Encoding::Deflate => Compressor::Deflate(ZlibEncoder::new(writer, Compression::default())),
            Encoding::Brotli => Compressor::Brotli(Box::new(brotli::CompressorWriter::new(
                writer,
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LGWIN,
            ))),
            Encoding::Zstd => Compressor::Zstd(zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)?),
        })
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Compressor::Identity(_) => Encoding::Identity,
            Compressor::Gzip(_) => Encoding::Gzip,
            Compressor::Deflate(_) => Encoding::Deflate,
            Compressor::Brotli(_) => Encoding::Brotli,
            Compressor::Zstd(_) => Encoding::Zstd,
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Identity(w) => Ok(w),
            Compressor::Gzip(e) => e.finish(),
            Compressor::Deflate(e) => e.finish(),
            Compressor::Brotli(e) => Ok((*e).into_inner()),
            Compressor::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Identity(w) => w.write(buf),
            Compressor::Gzip(e) => e.write(buf),
            Compressor::Deflate(e) => e.write(buf),
            Compressor::Brotli(e) => e.write(buf),
            Compressor::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Identity(w) => w.flush(),
            Compressor::Gzip(e) => e.flush(),
            Compressor::Deflate(e) => e.flush(),
            Compressor::Brotli(e) => e.flush(),
            Compressor::Zstd(e) => e.flush(),
        }
    }
}

impl<W: Write> fmt::Debug for Compressor<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Compressor").field(&self.encoding()).finish()
    }
}

/// Encode a complete buffer in one go.
pub fn compress(encoding: Encoding, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut compressor = Compressor::new(encoding, Vec::new())?;
    compressor.write_all(data)?;
    Ok(compressor.finish()?)
}

/// Decoded output collected by the push-based decoders.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn take(&self) -> Vec<u8> {
        self.0
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .0
            .lock()
            .map_err(|_| io::Error::other("decoder sink poisoned"))?;
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Decoder {
    Gzip(GzDecoder<SharedSink>),
    Deflate(ZlibDecoder<SharedSink>),
    Brotli(Box<brotli::DecompressorWriter<SharedSink>>),
    Zstd(zstd::stream::write::Decoder<'static, SharedSink>),
}

impl Decoder {
    fn new(encoding: Encoding, sink: SharedSink) -> Result<Self, CodecError> {
        Ok(match encoding {
            Encoding::Gzip => Decoder::Gzip(GzDecoder::new(sink)),
            Encoding::Deflate => Decoder::Deflate(ZlibDecoder::new(sink)),
            Encoding::Brotli => {
                Decoder::Brotli(Box::new(brotli::DecompressorWriter::new(sink, BROTLI_BUFFER_SIZE)))
            }
            Encoding::Zstd => Decoder::Zstd(zstd::stream::write::Decoder::new(sink)?),
            Encoding::Identity => {
                return Err(CodecError::Unsupported("identity has no decoder".to_string()));
            }
        })
    }

    fn feed(&mut self, input: &[u8]) -> io::Result<()> {
        match self {
            Decoder::Gzip(d) => {
                d.write_all(input)?;
                d.flush()
            }
            Decoder::Deflate(d) => {
                d.write_all(input)?;
                d.flush()
            }
            Decoder::Brotli(d) => {
                d.write_all(input)?;
                d.flush()
            }
            Decoder::Zstd(d) => {
                d.write_all(input)?;
                d.flush()
            }
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            Decoder::Gzip(mut d) => d.try_finish(),
            Decoder::Deflate(mut d) => d.try_finish(),
            Decoder::Brotli(mut d) => {
                d.flush()?;
                (*d).into_inner()
                    .map(|_| ())
                    .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated brotli stream"))
            }
            Decoder::Zstd(mut d) => d.flush(),
        }
    }
}

struct DecodeState {
    source: BodyReader,
    decoder: Option<Decoder>,
    sink: SharedSink,
    fed: bool,
}

fn decode(encoding: Encoding, source: BodyReader) -> Result<BodyReader, CodecError> {
    if encoding == Encoding::Identity {
        return Ok(source);
    }

    let sink = SharedSink::default();
    let state = DecodeState {
        source,
        decoder: Some(Decoder::new(encoding, sink.clone())?),
        sink,
        fed: false,
    };

    let stream = futures_util::stream::try_unfold(state, |mut st| async move {
        loop {
            let Some(decoder) = st.decoder.as_mut() else {
                return Ok(None);
            };

            let input = st.source.fill_buf().await?;
            if input.is_empty() {
                // An empty body carries no coding frame at all.
                if let Some(decoder) = st.decoder.take() {
                    if st.fed {
                        decoder.finish()?;
                    }
                }
            } else {
                let n = input.len();
                decoder.feed(input)?;
                st.source.consume(n);
                st.fed = true;
            }

            let out = st.sink.take();
            if !out.is_empty() {
                return Ok::<_, io::Error>(Some((Bytes::from(out), st)));
            }
        }
    });

    Ok(Box::new(StreamReader::new(Box::pin(stream))))
}
