//! Market data replay library.
//!
//! Replays a time-bounded slice of market data recorded across exchanges and
//! channels, turning raw line-oriented events into schema-typed records:
//!
//! - `line`: raw and typed line model, channel definitions and type tags
//! - `processor`: stateful reprocessor applying inline channel definitions,
//!   reset per exchange by `Start` lines
//! - `transport`: contract for fetching raw lines (bulk or buffered stream)
//! - `capture`: transport backed by CRC-framed capture shards on disk
//! - `replay`: validated replay requests with eager `download` and lazy
//!   `stream` consumption
//! - `cancel`: cooperative cancellation context
//!
//! The binaries in this repository (`src/main.rs` and `src/bin/capture.rs`)
//! replay capture directories to JSON lines and import raw lines into them.
pub mod cancel;
pub mod capture;
pub mod error;
pub mod line;
pub mod processor;
pub mod replay;
pub mod transport;

pub use cancel::CancelToken;
pub use error::{DecodeError, Error, Result, TransportError};
pub use line::{Definition, FieldType, LineType, Message, RawLine, TypedLine};
pub use replay::{
    Client, DEFAULT_BUFFER_SIZE, DEFAULT_CONCURRENCY, ReplayRequest, ReplayRequestParams, ReplayStream,
    TypedLineIterator, replay,
};
