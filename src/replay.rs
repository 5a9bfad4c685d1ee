//! Replay requests: validated filter/time range plus the two ways to read them.
//!
//! - [`ReplayRequest::download`] fetches every raw line first (in parallel, via
//!   the transport) and then reprocesses them into one `Vec`.
//! - [`ReplayRequest::stream`] returns a [`ReplayStream`] that reprocesses raw
//!   lines lazily while the transport keeps buffering in the background.
//!
//! Both paths use a fresh [`LineProcessor`] per call, so requests can be
//! executed repeatedly and concurrently without sharing schema state.
use crate::cancel::CancelToken;
use crate::capture::{CaptureConfig, CaptureTransport, is_valid_exchange};
use crate::error::{Error, Result};
use crate::line::TypedLine;
use crate::processor::LineProcessor;
use crate::transport::{Filter, Format, RawLineStream, RawRequest, RawTransport};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

/// Shards fetched in parallel by [`ReplayRequest::download`].
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Shards buffered ahead of the consumer by [`ReplayRequest::stream`].
/// One shard holds one minute of data.
pub const DEFAULT_BUFFER_SIZE: usize = 30;

/// Entry point holding the raw transport requests are executed against.
#[derive(Debug)]
pub struct Client<T> {
    transport: Arc<T>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self { transport: Arc::clone(&self.transport) }
    }
}

impl<T: RawTransport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self { transport: Arc::new(transport) }
    }

    pub fn replay(&self, params: &ReplayRequestParams) -> Result<ReplayRequest<T>> {
        ReplayRequest::new(Arc::clone(&self.transport), params)
    }
}

/// Build a request against the capture directory in `config`.
pub fn replay(config: &CaptureConfig, params: &ReplayRequestParams) -> Result<ReplayRequest<CaptureTransport>> {
    let transport = CaptureTransport::open(config)?;
    Client::new(transport).replay(params)
}

/// Parameters for [`Client::replay`].
#[derive(Debug, Clone)]
pub struct ReplayRequestParams {
    /// Exchange -> channels to replay.
    pub filter: HashMap<String, Vec<String>>,
    /// Inclusive start.
    pub start: OffsetDateTime,
    /// Exclusive end.
    pub end: OffsetDateTime,
}

/// Immutable, validated replay of a filter over `[start, end)`.
#[derive(Debug)]
pub struct ReplayRequest<T> {
    transport: Arc<T>,
    filter: Filter,
    start: i64,
    end: i64,
}

fn unix_nanos(t: OffsetDateTime, name: &str) -> Result<i64> {
    i64::try_from(t.unix_timestamp_nanos())
        .map_err(|_| Error::Validation(format!("'{name}' is outside the representable range")))
}

/// Copy the caller's filter into sorted exchanges with de-duplicated channels.
fn copy_filter(filter: &HashMap<String, Vec<String>>) -> Result<Filter> {
    let mut out = Filter::new();
    for (exchange, channels) in filter {
        if !is_valid_exchange(exchange) {
            return Err(Error::Validation(format!("invalid exchange name {exchange:?} in filter")));
        }
        let mut copied: Vec<String> = Vec::with_capacity(channels.len());
        for channel in channels {
            if channel.is_empty() {
                return Err(Error::Validation(format!("empty channel name for exchange '{exchange}'")));
            }
            if !copied.contains(channel) {
                copied.push(channel.clone());
            }
        }
        out.insert(exchange.clone(), copied);
    }
    Ok(out)
}

impl<T: RawTransport> ReplayRequest<T> {
    fn new(transport: Arc<T>, params: &ReplayRequestParams) -> Result<Self> {
        let filter = copy_filter(&params.filter)?;
        let start = unix_nanos(params.start, "start")?;
        let end = unix_nanos(params.end, "end")?;
        if start >= end {
            return Err(Error::Validation("'start' >= 'end'".into()));
        }
        Ok(Self { transport, filter, start, end })
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Start in nanoseconds since epoch.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// End in nanoseconds since epoch.
    pub fn end(&self) -> i64 {
        self.end
    }

    fn raw_request(&self) -> RawRequest {
        RawRequest {
            filter: self.filter.clone(),
            start: self.start,
            end: self.end,
            format: Format::Json,
        }
    }

    /// Download the whole range and return it once every line is decoded.
    pub fn download(&self) -> Result<Vec<TypedLine>> {
        self.download_with_context(&CancelToken::new(), DEFAULT_CONCURRENCY)
    }

    /// Same as [`Self::download`] with `concurrency` shards fetched at a time.
    pub fn download_with_concurrency(&self, concurrency: usize) -> Result<Vec<TypedLine>> {
        self.download_with_context(&CancelToken::new(), concurrency)
    }

    /// Same as [`Self::download_with_concurrency`], stopping early when `ctx` is cancelled.
    ///
    /// Any decode error aborts the whole download; no partial result is returned.
    pub fn download_with_context(&self, ctx: &CancelToken, concurrency: usize) -> Result<Vec<TypedLine>> {
        if concurrency == 0 {
            return Err(Error::Validation("concurrency must be at least 1".into()));
        }
        let raw = self.transport.bulk_fetch(&self.raw_request(), concurrency, ctx)?;
        debug!(raw_lines = raw.len(), "download fetched");
        let mut processor = LineProcessor::new();
        let mut out = Vec::with_capacity(raw.len());
        for line in raw {
            if let Some(typed) = processor.process(line)? {
                out.push(typed);
            }
        }
        Ok(out)
    }

    /// Start streaming the range. Buffering begins immediately.
    pub fn stream(&self) -> Result<ReplayStream<T::Stream>> {
        self.stream_with_context(&CancelToken::new(), DEFAULT_BUFFER_SIZE)
    }

    /// Same as [`Self::stream`] with `buffer_size` shards buffered ahead.
    pub fn stream_with_buffer_size(&self, buffer_size: usize) -> Result<ReplayStream<T::Stream>> {
        self.stream_with_context(&CancelToken::new(), buffer_size)
    }

    /// Same as [`Self::stream_with_buffer_size`], bound to `ctx` for its whole
    /// lifetime. Cancelling `ctx` stops background fetching and makes the next
    /// read fail with [`crate::TransportError::Cancelled`].
    pub fn stream_with_context(&self, ctx: &CancelToken, buffer_size: usize) -> Result<ReplayStream<T::Stream>> {
        if buffer_size == 0 {
            return Err(Error::Validation("buffer size must be at least 1".into()));
        }
        let raw = self.transport.stream_fetch(&self.raw_request(), buffer_size, ctx)?;
        Ok(ReplayStream { raw, processor: LineProcessor::new(), terminated: false })
    }
}

/// Pull interface over typed lines.
pub trait TypedLineIterator {
    /// Next typed line; `Ok(None)` once the stream has ended.
    fn next_line(&mut self) -> Result<Option<TypedLine>>;

    /// Release the underlying raw stream. Must be called once after use.
    fn close(self) -> Result<()>;
}

/// Typed lines decoded lazily from a raw line stream.
pub struct ReplayStream<S> {
    raw: S,
    processor: LineProcessor,
    terminated: bool,
}

impl<S: RawLineStream> TypedLineIterator for ReplayStream<S> {
    fn next_line(&mut self) -> Result<Option<TypedLine>> {
        if self.terminated {
            return Ok(None);
        }
        loop {
            let line = match self.raw.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.terminated = true;
                    return Ok(None);
                }
                Err(e) => {
                    self.terminated = true;
                    return Err(e.into());
                }
            };
            match self.processor.process(line) {
                Ok(Some(typed)) => return Ok(Some(typed)),
                Ok(None) => continue, // definition line
                Err(e) => {
                    self.terminated = true;
                    return Err(e.into());
                }
            }
        }
    }

    fn close(self) -> Result<()> {
        self.raw.close()?;
        Ok(())
    }
}

impl<S: RawLineStream> Iterator for ReplayStream<S> {
    type Item = Result<TypedLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}
