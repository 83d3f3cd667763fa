// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunk splitters – how a live upstream body is carved into the chunks
//! response filters see.
//!
//! A splitter is lazy and single-use.  Each call to
//! [`Splitter::next_chunk`] returns the next non-empty chunk, or `None` once
//! the source is exhausted.  Returning an empty chunk is a contract
//! violation that the engine turns into an error.


use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::codec::{self, BodyReader, CodecError, Encoding};
use crate::pool::BufferPool;

/// Source every splitter reads from.
pub type ChunkSource = BodyReader;

/// Carves a byte stream into chunks.
#[async_trait]
pub trait Splitter: Send {
    async fn next_chunk(&mut self, source: &mut ChunkSource) -> io::Result<Option<Bytes>>;
}

/// Splitting strategy named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitterKind {
    /// Event splitting for `text/event-stream`, fixed windows otherwise
    #[default]
    Auto,
    Fixed,
    Line,
    Event,
    Whole,
}

impl SplitterKind {
    /// Resolve [`SplitterKind::Auto`] against the response headers.
    pub fn resolve(self, headers: &HeaderMap) -> SplitterKind {
        match self {
            SplitterKind::Auto if is_event_stream(headers) => SplitterKind::Event,
            SplitterKind::Auto => SplitterKind::Fixed,
            kind => kind,
        }
    }
}

/// Splitter configuration for a route or a single response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitterSettings {
    #[serde(default)]
    pub kind: SplitterKind,

    /// Window size of the fixed splitter
    #[serde(default = "default_chunk_size")]
    pub size: usize,

    /// Longest line or event emitted before it is cut
    #[serde(default = "default_max_record")]
    pub max_record: usize,

    /// Decode `Content-Encoding` before splitting
    #[serde(default)]
    pub decompress: bool,
}

fn default_chunk_size() -> usize {
    32 * 1024
}

fn default_max_record() -> usize {
    1024 * 1024
}

impl Default for SplitterSettings {
    fn default() -> Self {
        Self {
            kind: SplitterKind::default(),
            size: default_chunk_size(),
            max_record: default_max_record(),
            decompress: false,
        }
    }
}

/// Build the splitter for a response.  Fails when decoding is requested for
/// an encoding this crate does not understand.
pub fn build_splitter(
    settings: &SplitterSettings,
    headers: &HeaderMap,
    pool: &Arc<BufferPool>,
) -> Result<Box<dyn Splitter>, CodecError> {
    let inner: Box<dyn Splitter> = match settings.kind.resolve(headers) {
        SplitterKind::Line => Box::new(LineSplitter::new(settings.max_record)),
        SplitterKind::Event => Box::new(EventStreamSplitter::new(settings.max_record)),
        SplitterKind::Whole => Box::new(WholeBodySplitter::default()),
        SplitterKind::Fixed | SplitterKind::Auto => {
            Box::new(FixedSizeSplitter::new(settings.size, pool.clone()))
        }
    };

    if settings.decompress {
        let encodings = Encoding::from_headers(headers)?;
        if !encodings.is_empty() {
            return Ok(Box::new(DecompressingSplitter::new(inner, encodings)));
        }
    }
    Ok(inner)
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// Emits whatever the source has buffered, at most `size` bytes at a time.
///
/// Reads land in a pooled scratch buffer and each chunk is copied out of it,
/// so the scratch buffer stays unshared and goes back to the pool on drop.
#[derive(Debug)]
pub struct FixedSizeSplitter {
    size: usize,
    scratch: BytesMut,
    pool: Arc<BufferPool>,
}

impl FixedSizeSplitter {
    pub fn new(size: usize, pool: Arc<BufferPool>) -> Self {
        let size = size.max(1);
        let mut scratch = pool.get();
        scratch.reserve(size);
        Self {
            size,
            scratch,
            pool,
        }
    }
}

#[async_trait]
impl Splitter for FixedSizeSplitter {
    async fn next_chunk(&mut self, source: &mut ChunkSource) -> io::Result<Option<Bytes>> {
        self.scratch.clear();
        let n = source
            .read_buf(&mut (&mut self.scratch).limit(self.size))
            .await?;
        if n == 0 {
            return Ok(None);
        }
        let chunk = Bytes::copy_from_slice(&self.scratch[..n]);
        self.scratch.clear();
        Ok(Some(chunk))
    }
}

impl Drop for FixedSizeSplitter {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.scratch));
    }
}

/// Emits one `\n`-terminated line per chunk, terminator included.
#[derive(Debug)]
pub struct LineSplitter {
    max_record: usize,
}

impl LineSplitter {
    pub fn new(max_record: usize) -> Self {
        Self {
            max_record: max_record.max(1),
        }
    }
}

#[async_trait]
impl Splitter for LineSplitter {
    async fn next_chunk(&mut self, source: &mut ChunkSource) -> io::Result<Option<Bytes>> {
        let mut line = BytesMut::new();
        read_line(source, &mut line, self.max_record).await?;
        Ok((!line.is_empty()).then(|| line.freeze()))
    }
}

/// Emits one server-sent event per chunk: every line up to and including
/// the blank line that terminates the event.
#[derive(Debug)]
pub struct EventStreamSplitter {
    max_record: usize,
}

impl EventStreamSplitter {
    pub fn new(max_record: usize) -> Self {
        Self {
            max_record: max_record.max(1),
        }
    }
}

#[async_trait]
impl Splitter for EventStreamSplitter {
    async fn next_chunk(&mut self, source: &mut ChunkSource) -> io::Result<Option<Bytes>> {
        let mut event = BytesMut::new();
        loop {
            let start = event.len();
            let limit = self.max_record.saturating_sub(start).max(1);
            if !read_line(source, &mut event, limit).await? {
                break;
            }
            let line = &event[start..];
            if line == b"\n" || line == b"\r\n" || event.len() >= self.max_record {
                break;
            }
        }
        Ok((!event.is_empty()).then(|| event.freeze()))
    }
}

/// Emits the entire body as a single chunk.
#[derive(Debug, Default)]
pub struct WholeBodySplitter {
    done: bool,
}

#[async_trait]
impl Splitter for WholeBodySplitter {
    async fn next_chunk(&mut self, source: &mut ChunkSource) -> io::Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let mut body = Vec::new();
        source.read_to_end(&mut body).await?;
        Ok((!body.is_empty()).then(|| Bytes::from(body)))
    }
}

/// Decodes the body first and lets the inner splitter pick boundaries in
/// decoded space.
pub struct DecompressingSplitter {
    inner: Box<dyn Splitter>,
    encodings: Vec<Encoding>,
    decoding: bool,
}

impl DecompressingSplitter {
    pub fn new(inner: Box<dyn Splitter>, encodings: Vec<Encoding>) -> Self {
        Self {
            inner,
            encodings,
            decoding: false,
        }
    }

    /// Build from response headers; unsupported encodings are an error.
    pub fn from_headers(inner: Box<dyn Splitter>, headers: &HeaderMap) -> Result<Self, CodecError> {
        Ok(Self::new(inner, Encoding::from_headers(headers)?))
    }
}

#[async_trait]
impl Splitter for DecompressingSplitter {
    async fn next_chunk(&mut self, source: &mut ChunkSource) -> io::Result<Option<Bytes>> {
        if !self.decoding {
            let raw = std::mem::replace(source, Box::new(tokio::io::empty()));
            *source = codec::decode_chain(&self.encodings, raw).map_err(|e| match e {
                CodecError::Io(e) => e,
                other => io::Error::new(io::ErrorKind::InvalidData, other),
            })?;
            self.decoding = true;
        }
        self.inner.next_chunk(source).await
    }
}

/// Append one line to `out`, stopping after `\n`, at EOF or once `limit`
/// bytes were appended.  Returns false when nothing could be read.
async fn read_line(source: &mut ChunkSource, out: &mut BytesMut, limit: usize) -> io::Result<bool> {
    let mut appended = 0;
    loop {
        let available = source.fill_buf().await?;
        if available.is_empty() {
            return Ok(appended > 0);
        }

        let room = limit - appended;
        let window = &available[..available.len().min(room)];
        match window.iter().position(|b| *b == b'\n') {
            Some(i) => {
                out.extend_from_slice(&window[..=i]);
                source.consume(i + 1);
                return Ok(true);
            }
            None => {
                let n = window.len();
                out.extend_from_slice(window);
                source.consume(n);
                appended += n;
                if appended >= limit {
                    return Ok(true);
                }
            }
        }
    }
}
