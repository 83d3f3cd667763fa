// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The response pipeline.
//!
//! A producer task reads the upstream body through the splitter, runs every
//! chunk through the response filters and sends the result down a bounded
//! pipe.  The client body is the reading end of that pipe.  When a flush
//! interval applies, a coalescer sits between the two and merges chunks
//! until the interval elapses.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{FutureExt, StreamExt, TryStreamExt, future, stream};
use http::HeaderMap;
use hyper::body::Frame;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use slog::{Logger, debug, error};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::DropGuard;

use crate::core::{Filter, FilterContext, NamedFilter, ProxyBody, ProxyError, ResponseExchange};
use crate::splitter::{ChunkSource, Splitter};

/// One event on the pipe between producer and client body.
pub(crate) type PipeItem = Result<Frame<Bytes>, ProxyError>;

type TrailerSlot = Arc<Mutex<Option<HeaderMap>>>;

/// A response filter bound to the context its hooks receive.
pub(crate) struct BoundFilter {
    name: String,
    filter: Box<dyn Filter>,
    ctx: FilterContext,
}

impl BoundFilter {
    pub(crate) fn new(named: NamedFilter, ctx: &FilterContext) -> Self {
        let scoped = ctx.scoped(&named.name, "response");
        Self {
            name: named.name,
            filter: named.filter,
            ctx: scoped,
        }
    }
}

/// Errors raised by a response filter keep their status if they carry one.
pub(crate) fn filter_failure(name: &str, err: ProxyError) -> ProxyError {
    match err {
        err @ ProxyError::Status { .. } => err,
        other => ProxyError::PipelineError(format!("filter '{name}': {other}")),
    }
}

/// Run every header hook in order.  Panics become errors.
pub(crate) async fn apply_headers(
    filters: &mut [BoundFilter],
    exchange: &mut ResponseExchange,
) -> Result<(), ProxyError> {
    for bound in filters.iter_mut() {
        let Some(filter) = bound.filter.as_response_filter() else {
            continue;
        };
        let outcome = AssertUnwindSafe(filter.on_response_headers(&bound.ctx, exchange))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(filter_failure(&bound.name, err)),
            Err(panic) => return Err(ProxyError::from_panic(panic)),
        }
    }
    exchange.sync_content_length();
    Ok(())
}

/// Turn the upstream body into a buffered reader.  Trailers are captured
/// into the returned slot when the body ends.
pub(crate) fn body_source(body: reqwest::Body) -> (ChunkSource, TrailerSlot) {
    let slot: TrailerSlot = Arc::new(Mutex::new(None));
    let capture = slot.clone();

    let data = BodyStream::new(body)
        .try_filter_map(move |frame| {
            let data = match frame.into_data() {
                Ok(data) => Some(data),
                Err(frame) => {
                    if let (Ok(trailers), Ok(mut slot)) = (frame.into_trailers(), capture.lock()) {
                        slot.get_or_insert_with(HeaderMap::new).extend(trailers);
                    }
                    None
                }
            };
            future::ready(Ok(data))
        })
        .map_err(std::io::Error::other);

    (Box::new(StreamReader::new(Box::pin(data))), slot)
}

/// Everything the producer task owns.
pub(crate) struct ResponsePipeline {
    pub(crate) splitter: Box<dyn Splitter>,
    pub(crate) source: ChunkSource,
    pub(crate) filters: Vec<BoundFilter>,
    pub(crate) exchange: ResponseExchange,
    pub(crate) trailers: TrailerSlot,
    pub(crate) logger: Logger,
}

impl ResponsePipeline {
    /// Start producing.  `flush` is the coalescing interval; `None` sends
    /// every chunk as soon as it is ready.  The guard is released when
    /// production ends.
    pub(crate) fn spawn(self, flush: Option<Duration>, guard: DropGuard) -> mpsc::Receiver<PipeItem> {
        let (pipe, reader) = mpsc::channel(1);

        tokio::spawn(async move {
            let _guard = guard;
            match flush {
                None => self.run_guarded(pipe).await,
                Some(interval) => {
                    let (tx, rx) = mpsc::channel(1);
                    tokio::join!(self.run_guarded(tx), coalesce(rx, pipe, interval));
                }
            }
        });

        reader
    }

    async fn run_guarded(self, out: mpsc::Sender<PipeItem>) {
        let logger = self.logger.clone();
        let report = out.clone();
        if let Err(panic) = AssertUnwindSafe(self.run(out)).catch_unwind().await {
            let err = ProxyError::from_panic(panic);
            error!(logger, "response pipeline panicked"; "error" => %err);
            let _ = report.send(Err(err)).await;
        }
    }

    async fn run(self, out: mpsc::Sender<PipeItem>) {
        let ResponsePipeline {
            mut splitter,
            mut source,
            mut filters,
            mut exchange,
            trailers,
            logger,
        } = self;

        let mut read_error = None;
        loop {
            match splitter.next_chunk(&mut source).await {
                Ok(Some(chunk)) if chunk.is_empty() => {
                    let _ = out.send(Err(ProxyError::EmptyChunk)).await;
                    return;
                }
                Ok(Some(chunk)) => match apply_chunk(&mut filters, &mut exchange, chunk).await {
                    Ok(data) if data.is_empty() => {}
                    Ok(data) => {
                        if out.send(Ok(Frame::data(data))).await.is_err() {
                            debug!(logger, "client went away, response abandoned");
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = out.send(Err(err)).await;
                        return;
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    read_error = Some(err);
                    break;
                }
            }
        }

        match apply_eof(&mut filters, &mut exchange).await {
            Ok(tail) if tail.is_empty() => {}
            Ok(tail) => {
                if out.send(Ok(Frame::data(tail))).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = out.send(Err(err)).await;
                return;
            }
        }

        if let Some(err) = read_error {
            error!(logger, "reading upstream body failed"; "error" => %err);
            let _ = out.send(Err(ProxyError::IoError(err))).await;
            return;
        }

        let mut merged = trailers
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or_default();
        merged.extend(exchange.take_trailers());
        if !merged.is_empty() {
            let _ = out.send(Ok(Frame::trailers(merged))).await;
        }
    }
}

/// Pass one chunk through the filters.  An empty result swallows the chunk
/// and skips the remaining filters.
async fn apply_chunk(
    filters: &mut [BoundFilter],
    exchange: &mut ResponseExchange,
    chunk: Bytes,
) -> Result<Bytes, ProxyError> {
    let mut data = chunk;
    for bound in filters.iter_mut() {
        let Some(filter) = bound.filter.as_response_filter() else {
            continue;
        };
        data = filter
            .on_response_chunk(&bound.ctx, exchange, data)
            .await
            .map_err(|err| filter_failure(&bound.name, err))?;
        if data.is_empty() {
            break;
        }
    }
    Ok(data)
}

/// Give every filter its end-of-stream hook, each receiving the tail the
/// filters before it produced.
async fn apply_eof(filters: &mut [BoundFilter], exchange: &mut ResponseExchange) -> Result<Bytes, ProxyError> {
    let mut tail = Bytes::new();
    for bound in filters.iter_mut() {
        let Some(filter) = bound.filter.as_response_filter() else {
            continue;
        };
        tail = filter
            .on_response_eof(&bound.ctx, exchange, tail)
            .await
            .map_err(|err| filter_failure(&bound.name, err))?;
    }
    Ok(tail)
}

/// Merge data frames until `interval` has passed since the first pending
/// byte.  Trailers, errors and the end of the stream flush immediately.
async fn coalesce(mut rx: mpsc::Receiver<PipeItem>, pipe: mpsc::Sender<PipeItem>, interval: Duration) {
    let mut pending = BytesMut::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let item = match deadline {
            Some(at) => tokio::select! {
                item = rx.recv() => item,
                _ = tokio::time::sleep_until(at) => {
                    deadline = None;
                    if !flush(&pipe, &mut pending).await {
                        return;
                    }
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match item {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => {
                    pending.extend_from_slice(&data);
                    deadline.get_or_insert_with(|| Instant::now() + interval);
                }
                Err(frame) => {
                    deadline = None;
                    if !flush(&pipe, &mut pending).await || pipe.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            },
            Some(Err(err)) => {
                if flush(&pipe, &mut pending).await {
                    let _ = pipe.send(Err(err)).await;
                }
                return;
            }
            None => {
                flush(&pipe, &mut pending).await;
                return;
            }
        }
    }
}

async fn flush(pipe: &mpsc::Sender<PipeItem>, pending: &mut BytesMut) -> bool {
    if pending.is_empty() {
        return true;
    }
    pipe.send(Ok(Frame::data(pending.split().freeze())))
        .await
        .is_ok()
}

/// The client-facing body: the first event already received, then the rest
/// of the pipe.
pub(crate) fn pipe_body(first: Option<PipeItem>, rx: mpsc::Receiver<PipeItem>) -> ProxyBody {
    let rest = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    StreamBody::new(stream::iter(first).chain(rest)).boxed_unsync()
}
