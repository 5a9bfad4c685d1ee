//! Contract between replay requests and the raw line transport.
//!
//! A transport fetches still-untyped [`RawLine`]s for a filter and time range,
//! either all at once with bounded parallelism or as a buffered pull stream.
//! Retries, sharding and authentication are the transport's business.
use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::line::RawLine;
use std::collections::BTreeMap;

/// Exchange -> channels to replay. Channels keep caller order without duplicates.
pub type Filter = BTreeMap<String, Vec<String>>;

/// Payload encoding requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Structured payloads; required by the reprocessor.
    Json,
    /// Delimiter-only payloads.
    Csv,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub filter: Filter,
    pub start: i64, // inclusive, ns since epoch
    pub end: i64,   // exclusive
    pub format: Format,
}

pub trait RawTransport: Send + Sync {
    type Stream: RawLineStream;

    /// Fetch every line of the request, at most `concurrency` shards at a time.
    /// Lines come back in shard order.
    fn bulk_fetch(
        &self,
        req: &RawRequest,
        concurrency: usize,
        ctx: &CancelToken,
    ) -> Result<Vec<RawLine>, TransportError>;

    /// Start fetching in the background, keeping up to `buffer_size` shards
    /// ahead of the consumer.
    fn stream_fetch(
        &self,
        req: &RawRequest,
        buffer_size: usize,
        ctx: &CancelToken,
    ) -> Result<Self::Stream, TransportError>;
}

/// Pull side of [`RawTransport::stream_fetch`].
pub trait RawLineStream {
    /// Next buffered line, blocking until one is available.
    /// `Ok(None)` means the stream ended normally.
    fn next_line(&mut self) -> Result<Option<RawLine>, TransportError>;

    /// Stop background work and release the stream.
    fn close(self) -> Result<(), TransportError>;
}
