//! Raw line transport backed by capture shards on disk.
//!
//! A capture directory holds one shard per exchange per minute at
//! `<dir>/<exchange>/<minute>.bin`. Each shard is a sequence of frames
//! `[len:u32 LE][crc32:u32 LE][bincode payload]`: one [`CaptureFrame::Header`]
//! followed by [`CaptureFrame::Line`]s in arrival order. A shard begins with a
//! `Start` line and then one definition line per channel, like a fresh
//! connection to the exchange would.
//!
//! [`CaptureTransport`] implements [`RawTransport`]: bulk fetches read shards
//! on a bounded pool of worker threads, streams read them on one producer
//! thread that stays at most `buffer_size` shards ahead of the consumer.
use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::line::{LineType, RawLine};
use crate::transport::{Format, RawLineStream, RawRequest, RawTransport};
use crc32fast::Hasher as Crc32;
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub const CAPTURE_VERSION: u16 = 1;

/// Length of one shard in nanoseconds.
pub const SHARD_NANOS: i64 = 60_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHeader {
    pub version: u16,
    pub exchange: String,
    pub minute: i64, // timestamp / SHARD_NANOS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureFrame {
    Header(ShardHeader),
    Line(RawLine),
}

/// Shard index of a timestamp.
pub fn minute_of(timestamp: i64) -> i64 {
    timestamp.div_euclid(SHARD_NANOS)
}

pub fn shard_path(dir: &Path, exchange: &str, minute: i64) -> PathBuf {
    dir.join(exchange).join(format!("{minute}.bin"))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TransportError + '_ {
    move |source| TransportError::Io { path: path.display().to_string(), source }
}

/// Writes one shard file.
pub struct ShardWriter {
    w: BufWriter<File>,
    path: PathBuf,
}

impl ShardWriter {
    /// Create (or truncate) the shard for `exchange`/`minute` under `dir`.
    pub fn create(dir: &Path, exchange: &str, minute: i64) -> Result<Self, TransportError> {
        let path = shard_path(dir, exchange, minute);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err(&path))?;
        let mut writer = Self { w: BufWriter::with_capacity(1 << 20, file), path };
        writer.write_frame(&CaptureFrame::Header(ShardHeader {
            version: CAPTURE_VERSION,
            exchange: exchange.to_string(),
            minute,
        }))?;
        Ok(writer)
    }

    pub fn write_line(&mut self, line: &RawLine) -> Result<(), TransportError> {
        // bincode needs an owned frame; lines are small
        self.write_frame(&CaptureFrame::Line(line.clone()))
    }

    pub fn finish(mut self) -> Result<(), TransportError> {
        self.w.flush().map_err(io_err(&self.path))
    }

    fn write_frame(&mut self, frame: &CaptureFrame) -> Result<(), TransportError> {
        let payload = bincode::serialize(frame).map_err(|source| TransportError::Codec {
            path: self.path.display().to_string(),
            source,
        })?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let len = payload.len() as u32;
        let path = &self.path;
        self.w.write_all(&len.to_le_bytes()).map_err(io_err(path))?;
        self.w.write_all(&crc.to_le_bytes()).map_err(io_err(path))?;
        self.w.write_all(&payload).map_err(io_err(path))?;
        Ok(())
    }
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read every frame of a shard, verifying checksums.
pub fn read_shard(path: &Path) -> Result<Vec<CaptureFrame>, TransportError> {
    let mut rdr = BufReader::new(File::open(path).map_err(io_err(path))?);
    let mut frames = Vec::new();
    loop {
        let len = match read_u32(&mut rdr) {
            Ok(v) => v as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(io_err(path)(e)),
        };
        let crc_on_file = read_u32(&mut rdr).map_err(io_err(path))?;
        let mut payload = vec![0u8; len];
        rdr.read_exact(&mut payload).map_err(io_err(path))?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc_calc = hasher.finalize();
        if crc_calc != crc_on_file {
            return Err(TransportError::CorruptFrame {
                path: path.display().to_string(),
                frame: frames.len(),
                expected: crc_on_file,
                actual: crc_calc,
            });
        }
        let frame: CaptureFrame =
            bincode::deserialize(&payload).map_err(|source| TransportError::Codec {
                path: path.display().to_string(),
                source,
            })?;
        frames.push(frame);
    }
    Ok(frames)
}

/// One shard to read for a request.
#[derive(Debug, Clone)]
struct ShardJob {
    exchange: String,
    minute: i64,
    path: PathBuf,
    channels: HashSet<String>,
}

/// Whether `exchange` can name a directory directly under the capture root.
pub fn is_valid_exchange(exchange: &str) -> bool {
    !exchange.is_empty()
        && exchange != "."
        && !exchange.contains("..")
        && !exchange.contains(['/', '\\', '\0'])
}

/// Minutes of the shards present for `exchange`, restricted to `[first, last]`.
fn shard_minutes(dir: &Path, exchange: &str, first: i64, last: i64) -> Result<Vec<i64>, TransportError> {
    let exchange_dir = dir.join(exchange);
    let entries = match fs::read_dir(&exchange_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(&exchange_dir)(e)),
    };
    let mut minutes = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(&exchange_dir))?;
        let name = entry.file_name();
        let Some(minute) = name
            .to_str()
            .and_then(|n| n.strip_suffix(".bin"))
            .and_then(|n| n.parse::<i64>().ok())
        else {
            continue;
        };
        if (first..=last).contains(&minute) && entry.path().is_file() {
            minutes.push(minute);
        }
    }
    Ok(minutes)
}

/// Existing shards covering `req`, minute-major then exchange order.
///
/// Each exchange directory is listed once, whatever the width of the range.
fn plan_shards(dir: &Path, req: &RawRequest) -> Result<Vec<ShardJob>, TransportError> {
    let (first, last) = (minute_of(req.start), minute_of(req.end - 1));
    let mut jobs = Vec::new();
    for (exchange, channels) in &req.filter {
        let channels: HashSet<String> = channels.iter().cloned().collect();
        for minute in shard_minutes(dir, exchange, first, last)? {
            jobs.push(ShardJob {
                exchange: exchange.clone(),
                minute,
                path: shard_path(dir, exchange, minute),
                channels: channels.clone(),
            });
        }
    }
    // filter iterates exchanges in sorted order, so this is stable per minute
    jobs.sort_by(|a, b| (a.minute, &a.exchange).cmp(&(b.minute, &b.exchange)));
    Ok(jobs)
}

/// Read one shard and keep the lines `req` asks for.
///
/// Control lines are always kept. The first message of each filtered channel
/// after a `Start` in this shard is its definition and is kept regardless of
/// time; every other message must fall inside `[start, end)`.
fn fetch_shard(job: &ShardJob, req: &RawRequest) -> Result<Vec<RawLine>, TransportError> {
    let frames = read_shard(&job.path)?;
    // None until the shard's first Start line
    let mut defined: Option<HashSet<String>> = None;
    let mut lines = Vec::with_capacity(frames.len());
    for frame in frames {
        let line = match frame {
            CaptureFrame::Header(h) => {
                if h.version != CAPTURE_VERSION || h.exchange != job.exchange {
                    warn!(path = %job.path.display(), version = h.version, exchange = %h.exchange, "unexpected shard header");
                }
                continue;
            }
            CaptureFrame::Line(line) => line,
        };
        match line.line_type {
            LineType::Message => {
                let Some(channel) = &line.channel else {
                    // malformed; the reprocessor reports it
                    lines.push(line);
                    continue;
                };
                if !job.channels.contains(channel) {
                    continue;
                }
                let is_definition = defined.as_mut().is_some_and(|d| d.insert(channel.clone()));
                if is_definition || (req.start <= line.timestamp && line.timestamp < req.end) {
                    lines.push(line);
                }
            }
            LineType::Start => {
                defined = Some(HashSet::new());
                lines.push(line);
            }
            LineType::Send | LineType::End | LineType::Error => lines.push(line),
        }
    }
    if defined.is_none() {
        warn!(path = %job.path.display(), "shard has no start line");
    }
    debug!(exchange = %job.exchange, minute = job.minute, lines = lines.len(), "shard fetched");
    Ok(lines)
}

/// Location of a capture directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CaptureTransport {
    dir: PathBuf,
}

impl CaptureTransport {
    pub fn open(config: &CaptureConfig) -> Result<Self, TransportError> {
        let meta = fs::metadata(&config.dir).map_err(io_err(&config.dir))?;
        if !meta.is_dir() {
            return Err(TransportError::Io {
                path: config.dir.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
            });
        }
        Ok(Self { dir: config.dir.clone() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn check_format(req: &RawRequest) -> Result<(), TransportError> {
    match req.format {
        Format::Json => Ok(()),
        other => Err(TransportError::UnsupportedFormat(other)),
    }
}

impl RawTransport for CaptureTransport {
    type Stream = CaptureStream;

    fn bulk_fetch(
        &self,
        req: &RawRequest,
        concurrency: usize,
        ctx: &CancelToken,
    ) -> Result<Vec<RawLine>, TransportError> {
        check_format(req)?;
        let jobs = plan_shards(&self.dir, req)?;
        let workers = concurrency.max(1).min(jobs.len().max(1));
        debug!(shards = jobs.len(), workers, "bulk fetch");

        let (job_tx, job_rx) = unbounded::<usize>();
        for idx in 0..jobs.len() {
            let _ = job_tx.send(idx);
        }
        drop(job_tx);
        let (res_tx, res_rx) = unbounded::<(usize, Result<Vec<RawLine>, TransportError>)>();

        let abort = AtomicBool::new(false);
        let mut results: Vec<Option<Vec<RawLine>>> = (0..jobs.len()).map(|_| None).collect();
        let mut first_err: Option<TransportError> = None;

        let jobs = &jobs;
        let abort = &abort;
        thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    let res_tx = res_tx.clone();
                    s.spawn(move || {
                        for idx in job_rx.iter() {
                            if ctx.is_cancelled() || abort.load(Ordering::Relaxed) {
                                break;
                            }
                            let res = fetch_shard(&jobs[idx], req);
                            if res_tx.send((idx, res)).is_err() {
                                break;
                            }
                        }
                    })
                })
                .collect();
            drop(res_tx);

            for (idx, res) in res_rx.iter() {
                match res {
                    Ok(lines) => results[idx] = Some(lines),
                    Err(e) => {
                        abort.store(true, Ordering::Relaxed);
                        first_err.get_or_insert(e);
                    }
                }
            }
            for h in handles {
                if h.join().is_err() {
                    first_err.get_or_insert(TransportError::WorkerPanicked);
                }
            }
        });

        if ctx.is_cancelled() {
            warn!("bulk fetch cancelled");
            return Err(TransportError::Cancelled);
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(results.into_iter().flatten().flatten().collect())
    }

    fn stream_fetch(
        &self,
        req: &RawRequest,
        buffer_size: usize,
        ctx: &CancelToken,
    ) -> Result<CaptureStream, TransportError> {
        check_format(req)?;
        let jobs = plan_shards(&self.dir, req)?;
        debug!(shards = jobs.len(), buffer_size, "stream fetch");

        let (tx, rx) = bounded::<Result<Vec<RawLine>, TransportError>>(buffer_size.max(1));
        let req = req.clone();
        let producer_ctx = ctx.clone();
        let producer = thread::Builder::new()
            .name("capture-stream".into())
            .spawn(move || {
                for job in &jobs {
                    if producer_ctx.is_cancelled() {
                        return;
                    }
                    let item = fetch_shard(job, &req);
                    let failed = item.is_err();
                    select! {
                        send(tx, item) -> res => {
                            if res.is_err() {
                                return;
                            }
                        }
                        recv(producer_ctx.done()) -> _ => return,
                    }
                    if failed {
                        return;
                    }
                }
            })
            .map_err(io_err(&self.dir))?;

        Ok(CaptureStream {
            shards: Some(rx),
            current: Vec::new().into_iter(),
            ctx: ctx.clone(),
            producer: Some(producer),
            finished: false,
        })
    }
}

/// Buffered pull stream over capture shards.
pub struct CaptureStream {
    shards: Option<Receiver<Result<Vec<RawLine>, TransportError>>>,
    current: std::vec::IntoIter<RawLine>,
    ctx: CancelToken,
    producer: Option<JoinHandle<()>>,
    finished: bool,
}

impl CaptureStream {
    fn shutdown(&mut self) -> Result<(), TransportError> {
        // Dropping the receiver unblocks a producer waiting on a full queue.
        self.shards.take();
        self.finished = true;
        match self.producer.take() {
            Some(h) => h.join().map_err(|_| TransportError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

impl RawLineStream for CaptureStream {
    fn next_line(&mut self) -> Result<Option<RawLine>, TransportError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.ctx.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if let Some(line) = self.current.next() {
                return Ok(Some(line));
            }
            let Some(shards) = &self.shards else {
                return Ok(None);
            };
            let shard = select! {
                recv(shards) -> msg => msg,
                recv(self.ctx.done()) -> _ => return Err(TransportError::Cancelled),
            };
            match shard {
                Ok(Ok(lines)) => self.current = lines.into_iter(),
                Ok(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                Err(_) => {
                    // Producer is gone: either done or cancelled.
                    if self.ctx.is_cancelled() {
                        return Err(TransportError::Cancelled);
                    }
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }

    fn close(mut self) -> Result<(), TransportError> {
        self.shutdown()
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
