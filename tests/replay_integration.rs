use market_replay::capture::{CaptureConfig, SHARD_NANOS, ShardWriter, shard_path};
use market_replay::{
    CancelToken, Error, LineType, Message, RawLine, ReplayRequestParams, TransportError, TypedLine,
    TypedLineIterator, replay,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use time::OffsetDateTime;
use time::macros::datetime;

const T0: OffsetDateTime = datetime!(2021-05-01 00:00 UTC);

fn t0() -> i64 {
    T0.unix_timestamp_nanos() as i64
}

fn line(exchange: &str, t: LineType, ts: i64, channel: Option<&str>, msg: &str) -> RawLine {
    RawLine {
        exchange: exchange.into(),
        line_type: t,
        timestamp: ts,
        channel: channel.map(str::to_string),
        message: msg.as_bytes().to_vec(),
    }
}

fn write_shard(dir: &Path, exchange: &str, minute: i64, lines: &[RawLine]) {
    let mut w = ShardWriter::create(dir, exchange, minute).unwrap();
    for l in lines {
        w.write_line(l).unwrap();
    }
    w.finish().unwrap();
}

/// A minute of `exchange` with a `trade` channel: start, definition, `n` trades.
fn trade_minute(dir: &Path, exchange: &str, minute_offset: i64, n: i64) {
    let base = t0() + minute_offset * SHARD_NANOS;
    let mut lines = vec![
        line(exchange, LineType::Start, base, None, "wss://feed"),
        line(exchange, LineType::Message, base, Some("trade"), r#"{"ts":"timestamp","size":"int","side":"string"}"#),
    ];
    for i in 0..n {
        let ts = base + 1_000 + i;
        let payload = json!({"ts": ts.to_string(), "size": i as f64 + 0.5, "side": "Buy"}).to_string();
        lines.push(line(exchange, LineType::Message, ts, Some("trade"), &payload));
    }
    write_shard(dir, exchange, minute_offset + t0() / SHARD_NANOS, &lines);
}

fn params(exchanges: &[&str], minutes: i64) -> ReplayRequestParams {
    ReplayRequestParams {
        filter: exchanges.iter().map(|e| (e.to_string(), vec!["trade".to_string()])).collect::<HashMap<_, _>>(),
        start: T0,
        end: T0 + time::Duration::minutes(minutes),
    }
}

fn config(dir: &Path) -> CaptureConfig {
    CaptureConfig { dir: dir.to_path_buf() }
}

fn drain<I: TypedLineIterator>(mut it: I) -> Vec<TypedLine> {
    let mut out = Vec::new();
    while let Some(l) = it.next_line().unwrap() {
        out.push(l);
    }
    it.close().unwrap();
    out
}

#[test]
fn download_reconstructs_typed_lines() {
    let dir = tempfile::tempdir().unwrap();
    trade_minute(dir.path(), "bitmex", 0, 2);
    trade_minute(dir.path(), "bitflyer", 0, 1);
    trade_minute(dir.path(), "bitmex", 1, 1);

    let req = replay(&config(dir.path()), &params(&["bitmex", "bitflyer"], 2)).unwrap();
    let lines = req.download().unwrap();

    // minute-major, exchanges sorted; definitions never visible
    let shape: Vec<_> = lines.iter().map(|l| (l.exchange.as_str(), l.line_type)).collect();
    assert_eq!(
        shape,
        vec![
            ("bitflyer", LineType::Start),
            ("bitflyer", LineType::Message),
            ("bitmex", LineType::Start),
            ("bitmex", LineType::Message),
            ("bitmex", LineType::Message),
            ("bitmex", LineType::Start),
            ("bitmex", LineType::Message),
        ]
    );
    let first = lines[3].message.fields().unwrap();
    assert_eq!(first["ts"].as_i64(), Some(t0() + 1_000));
    assert_eq!(first["size"], json!(0));
    assert_eq!(first["side"], json!("Buy"));
    assert!(lines[3].definition.is_some());
    assert_eq!(lines[2].message, Message::Raw(b"wss://feed".to_vec()));
}

#[test]
fn stream_and_download_agree() {
    let dir = tempfile::tempdir().unwrap();
    for m in 0..5 {
        trade_minute(dir.path(), "bitmex", m, 3);
        trade_minute(dir.path(), "binance", m, 2);
    }
    let req = replay(&config(dir.path()), &params(&["bitmex", "binance"], 5)).unwrap();
    let downloaded = req.download_with_concurrency(3).unwrap();
    let streamed = drain(req.stream_with_buffer_size(2).unwrap());
    assert_eq!(downloaded.len(), 5 * (1 + 3) + 5 * (1 + 2));
    assert_eq!(downloaded, streamed);
}

#[test]
fn start_line_resets_channel_definitions() {
    let dir = tempfile::tempdir().unwrap();
    let base = t0();
    let def = r#"{"n":"int"}"#;
    write_shard(
        dir.path(),
        "bitmex",
        base / SHARD_NANOS,
        &[
            line("bitmex", LineType::Start, base, None, "s1"),
            line("bitmex", LineType::Message, base + 1, Some("trade"), def),
            line("bitmex", LineType::Message, base + 2, Some("trade"), r#"{"n":1.5}"#),
            line("bitmex", LineType::Start, base + 3, None, "s2"),
            line("bitmex", LineType::Message, base + 4, Some("trade"), def),
            line("bitmex", LineType::Message, base + 5, Some("trade"), r#"{"n":2.5}"#),
        ],
    );
    let req = replay(&config(dir.path()), &params(&["bitmex"], 1)).unwrap();
    let lines = req.download().unwrap();
    let stamps: Vec<_> = lines.iter().map(|l| l.timestamp - base).collect();
    assert_eq!(stamps, vec![0, 2, 3, 5]);
    assert_eq!(lines[3].message.fields().unwrap()["n"], json!(2));
}

#[test]
fn messages_outside_range_are_dropped_but_definitions_kept() {
    let dir = tempfile::tempdir().unwrap();
    trade_minute(dir.path(), "bitmex", 0, 3);
    let mut p = params(&["bitmex"], 1);
    // only the second trade (t0 + 1001)
    p.start = T0 + time::Duration::nanoseconds(1_001);
    p.end = T0 + time::Duration::nanoseconds(1_002);
    let lines = replay(&config(dir.path()), &p).unwrap().download().unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1].timestamp, t0() + 1_001);
}

#[test]
fn missing_shards_yield_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let req = replay(&config(dir.path()), &params(&["bitmex"], 3)).unwrap();
    assert!(req.download().unwrap().is_empty());
    let mut stream = req.stream().unwrap();
    for _ in 0..3 {
        assert!(stream.next_line().unwrap().is_none());
    }
    stream.close().unwrap();
}

#[test]
fn corrupt_shard_fails_both_paths() {
    let dir = tempfile::tempdir().unwrap();
    trade_minute(dir.path(), "bitmex", 0, 2);
    let path = shard_path(dir.path(), "bitmex", t0() / SHARD_NANOS);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x55;
    std::fs::write(&path, bytes).unwrap();

    let req = replay(&config(dir.path()), &params(&["bitmex"], 1)).unwrap();
    assert!(matches!(req.download(), Err(Error::Transport(TransportError::CorruptFrame { .. }))));
    let mut stream = req.stream().unwrap();
    assert!(matches!(stream.next_line(), Err(Error::Transport(TransportError::CorruptFrame { .. }))));
    stream.close().unwrap();
}

#[test]
fn undecodable_message_aborts_download() {
    let dir = tempfile::tempdir().unwrap();
    let base = t0();
    write_shard(
        dir.path(),
        "bitmex",
        base / SHARD_NANOS,
        &[
            line("bitmex", LineType::Start, base, None, "s"),
            line("bitmex", LineType::Message, base, Some("trade"), r#"{"ts":"timestamp"}"#),
            line("bitmex", LineType::Message, base + 1, Some("trade"), r#"{"ts":"1"}"#),
            line("bitmex", LineType::Message, base + 2, Some("trade"), r#"{"ts":"abc"}"#),
        ],
    );
    let req = replay(&config(dir.path()), &params(&["bitmex"], 1)).unwrap();
    assert!(matches!(req.download(), Err(Error::Decode(_))));

    let mut stream = req.stream().unwrap();
    assert_eq!(stream.next_line().unwrap().unwrap().line_type, LineType::Start);
    assert!(stream.next_line().unwrap().is_some());
    assert!(matches!(stream.next_line(), Err(Error::Decode(_))));
    stream.close().unwrap();
}

#[test]
fn cancelling_stops_stream_without_hanging() {
    let dir = tempfile::tempdir().unwrap();
    for m in 0..20 {
        trade_minute(dir.path(), "bitmex", m, 5);
    }
    let req = replay(&config(dir.path()), &params(&["bitmex"], 20)).unwrap();
    let ctx = CancelToken::new();
    let mut stream = req.stream_with_context(&ctx, 1).unwrap();
    assert!(stream.next_line().unwrap().is_some());
    ctx.cancel();

    let mut saw_cancel = false;
    for _ in 0..10 {
        match stream.next_line() {
            Err(Error::Transport(TransportError::Cancelled)) => {
                saw_cancel = true;
                break;
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => {}
        }
    }
    assert!(saw_cancel);
    stream.close().unwrap();
}

#[test]
fn cancelled_download_reports_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    trade_minute(dir.path(), "bitmex", 0, 1);
    let req = replay(&config(dir.path()), &params(&["bitmex"], 1)).unwrap();
    let ctx = CancelToken::new();
    ctx.cancel();
    assert!(matches!(
        req.download_with_context(&ctx, 4),
        Err(Error::Transport(TransportError::Cancelled))
    ));
}

#[test]
fn abandoned_stream_closes_promptly() {
    let dir = tempfile::tempdir().unwrap();
    for m in 0..10 {
        trade_minute(dir.path(), "bitmex", m, 2);
    }
    let req = replay(&config(dir.path()), &params(&["bitmex"], 10)).unwrap();
    let mut stream = req.stream_with_buffer_size(1).unwrap();
    assert!(stream.next_line().unwrap().is_some());
    // producer is blocked on the full queue; close must still return
    stream.close().unwrap();
}

#[test]
fn missing_capture_dir_is_a_transport_error() {
    let err = replay(&config(Path::new("/no/such/capture/dir")), &params(&["bitmex"], 1)).unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Io { .. })));
}

#[test]
fn inverted_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = params(&["bitmex"], 1);
    std::mem::swap(&mut p.start, &mut p.end);
    assert!(matches!(replay(&config(dir.path()), &p), Err(Error::Validation(_))));
}
