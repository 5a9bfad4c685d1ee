use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use market_replay::capture::CaptureConfig;
use market_replay::{
    CancelToken, DEFAULT_BUFFER_SIZE, DEFAULT_CONCURRENCY, ReplayRequestParams, TypedLine, TypedLineIterator,
    replay,
};
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Fetch the whole range, then print it
    Download,
    /// Print lines as they are fetched
    Stream,
}

#[derive(Debug, Parser)]
#[command(version, about = "Replay recorded market data as typed JSON lines")]
struct Args {
    /// Capture directory (one subdirectory per exchange)
    #[arg(long, env = "REPLAY_CAPTURE_DIR", default_value = "captures")]
    capture_dir: PathBuf,

    /// Exchange and its channels, e.g. `bitmex:trade,orderBookL2`; repeatable
    #[arg(long = "filter", short = 'f', env = "REPLAY_FILTER", value_delimiter = ';', required = true)]
    filters: Vec<String>,

    /// Inclusive start (RFC 3339)
    #[arg(long, env = "REPLAY_START", value_parser = parse_instant)]
    start: OffsetDateTime,

    /// Exclusive end (RFC 3339)
    #[arg(long, env = "REPLAY_END", value_parser = parse_instant)]
    end: OffsetDateTime,

    #[arg(long, value_enum, default_value_t = Mode::Stream)]
    mode: Mode,

    /// Shards fetched in parallel in download mode
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Shards (minutes) buffered ahead in stream mode
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "REPLAY_LOG", default_value = "info")]
    log_level: String,
}

fn parse_instant(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(s, &Rfc3339)
}

/// Parse `exchange:ch1,ch2` entries, merging repeated exchanges.
fn parse_filter(entries: &[String]) -> Result<HashMap<String, Vec<String>>> {
    let mut filter: HashMap<String, Vec<String>> = HashMap::new();
    for entry in entries {
        let Some((exchange, channels)) = entry.split_once(':') else {
            bail!("filter entry {entry:?} is not in the form exchange:channel,...");
        };
        filter
            .entry(exchange.trim().to_string())
            .or_default()
            .extend(channels.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()));
    }
    Ok(filter)
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow!("invalid log level: {}", e))?;

    // stdout carries the replayed lines
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();

    Ok(())
}

fn write_line<W: Write>(out: &mut W, line: &TypedLine) -> Result<()> {
    serde_json::to_writer(&mut *out, line).context("encode line")?;
    out.write_all(b"\n")?;
    Ok(())
}

fn drain<I: TypedLineIterator, W: Write>(stream: &mut I, out: &mut W) -> Result<usize> {
    let mut count = 0usize;
    while let Some(line) = stream.next_line()? {
        write_line(out, &line)?;
        count += 1;
    }
    Ok(count)
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let params = ReplayRequestParams {
        filter: parse_filter(&args.filters)?,
        start: args.start,
        end: args.end,
    };
    let config = CaptureConfig { dir: args.capture_dir.clone() };
    let req = replay(&config, &params).with_context(|| format!("replay from {:?}", args.capture_dir))?;

    let ctx = CancelToken::new();
    let handler_ctx = ctx.clone();
    ctrlc::set_handler(move || handler_ctx.cancel()).context("install Ctrl-C handler")?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let count = match args.mode {
        Mode::Download => {
            let lines = req.download_with_context(&ctx, args.concurrency)?;
            for line in &lines {
                write_line(&mut out, line)?;
            }
            lines.len()
        }
        Mode::Stream => {
            let mut stream = req.stream_with_context(&ctx, args.buffer_size)?;
            let drained = drain(&mut stream, &mut out);
            stream.close()?;
            drained?
        }
    };
    out.flush()?;
    info!(lines = count, mode = ?args.mode, "replay finished");
    Ok(())
}
