use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::{Receiver, bounded};
use dotenvy::dotenv;
use market_replay::capture::{ShardWriter, is_valid_exchange, minute_of};
use market_replay::{LineType, RawLine};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(about = "Import raw JSON lines into a capture directory")]
struct Args {
    /// Input file with one raw line per row; stdin when omitted
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,

    /// Capture directory to write shards into
    #[arg(long, env = "REPLAY_CAPTURE_DIR", default_value = "captures")]
    capture_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "REPLAY_LOG", default_value = "info")]
    log_level: String,
}

/// One input row: `{"exchange":..,"type":"msg","timestamp":..,"channel":..,"message":..}`.
#[derive(Debug, Deserialize)]
struct InputLine {
    exchange: String,
    #[serde(rename = "type")]
    line_type: LineType,
    timestamp: i64,
    channel: Option<String>,
    message: Box<RawValue>,
}

impl InputLine {
    fn into_raw(self) -> RawLine {
        // JSON strings are stored unquoted, everything else as JSON text
        let message = match serde_json::from_str::<String>(self.message.get()) {
            Ok(s) => s.into_bytes(),
            Err(_) => self.message.get().as_bytes().to_vec(),
        };
        RawLine {
            exchange: self.exchange,
            line_type: self.line_type,
            timestamp: self.timestamp,
            channel: self.channel,
            message,
        }
    }
}

/// Open shard of one exchange plus what a new shard must repeat at its head.
struct ExchangeShard {
    minute: i64,
    writer: ShardWriter,
    start: Option<RawLine>,   // latest Start line
    definitions: Vec<RawLine>, // first message per channel since `start`
}

impl ExchangeShard {
    fn track(&mut self, line: &RawLine) {
        match line.line_type {
            LineType::Start => {
                self.start = Some(line.clone());
                self.definitions.clear();
            }
            LineType::Message => {
                let known = self.definitions.iter().any(|d| d.channel == line.channel);
                if !known && line.channel.is_some() {
                    self.definitions.push(line.clone());
                }
            }
            LineType::Send | LineType::End | LineType::Error => {}
        }
    }

    /// Write the Start line and channel definitions again, stamped at `timestamp`,
    /// so the shard can be replayed on its own.
    fn write_head(&mut self, timestamp: i64) -> Result<()> {
        let Some(start) = &self.start else {
            warn!(minute = self.minute, "no start line seen yet; shard has no definitions");
            return Ok(());
        };
        for line in std::iter::once(start).chain(&self.definitions) {
            let mut carried = line.clone();
            carried.timestamp = timestamp;
            self.writer.write_line(&carried)?;
        }
        Ok(())
    }
}

/// Write lines into per-exchange shards. Lines of one exchange must arrive
/// in time order; a shard is finished when its exchange moves to a later minute.
/// Every shard after the first starts with the exchange's Start line and
/// channel definitions unless it opens with a Start line of its own.
fn writer_thread(dir: PathBuf, rx: Receiver<RawLine>) -> Result<usize> {
    let mut open: HashMap<String, ExchangeShard> = HashMap::new();
    let mut shards = 0usize;
    for line in rx {
        if !is_valid_exchange(&line.exchange) {
            bail!("invalid exchange name {:?}", line.exchange);
        }
        let minute = minute_of(line.timestamp);
        match open.get_mut(&line.exchange) {
            Some(cur) if cur.minute == minute => {}
            Some(cur) if cur.minute > minute => {
                bail!("{} went back in time: minute {} after {}", line.exchange, minute, cur.minute);
            }
            Some(cur) => {
                let writer = ShardWriter::create(&dir, &line.exchange, minute)?;
                std::mem::replace(&mut cur.writer, writer).finish()?;
                debug!(exchange = %line.exchange, minute = cur.minute, "shard finished");
                cur.minute = minute;
                if line.line_type != LineType::Start {
                    cur.write_head(line.timestamp)?;
                }
                shards += 1;
            }
            None => {
                let writer = ShardWriter::create(&dir, &line.exchange, minute)?;
                open.insert(
                    line.exchange.clone(),
                    ExchangeShard { minute, writer, start: None, definitions: Vec::new() },
                );
                shards += 1;
            }
        }
        if let Some(cur) = open.get_mut(&line.exchange) {
            cur.track(&line);
            cur.writer.write_line(&line)?;
        }
    }
    for (_, cur) in open {
        cur.writer.finish()?;
    }
    Ok(shards)
}

fn main() -> Result<()> {
    let _ = dotenv();
    let args = Args::parse();
    let filter = EnvFilter::try_new(&args.log_level).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let reader: Box<dyn BufRead> = match &args.input {
        Some(p) => Box::new(BufReader::new(File::open(p).with_context(|| format!("open {:?}", p))?)),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let (tx, rx) = bounded::<RawLine>(8192);
    let dir = args.capture_dir.clone();
    let writer = std::thread::spawn(move || writer_thread(dir, rx));

    let mut rows = 0usize;
    for (n, row) in reader.lines().enumerate() {
        let row = row.context("read input")?;
        if row.trim().is_empty() {
            continue;
        }
        let input: InputLine = serde_json::from_str(&row).with_context(|| format!("line {}", n + 1))?;
        if tx.send(input.into_raw()).is_err() {
            // writer stopped early; its error is reported below
            break;
        }
        rows += 1;
    }
    drop(tx);

    let shards = match writer.join() {
        Ok(res) => res?,
        Err(_) => bail!("writer thread panicked"),
    };
    info!(rows, shards, dir = %args.capture_dir.display(), "import finished");
    Ok(())
}
