#![allow(clippy::unwrap_used)]
use matura_channels::EvolutionChannel;
use matura_core::{Channel, ChannelError};
use std::io::BufRead;
use std::time::Duration;
use tracing::Instrument;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    let file = std::fs::File::open(path).unwrap();
    std::io::BufReader::new(file)
        .lines()
        .map(|l| l.unwrap())
        .filter(|l| !l.is_empty())
        .map(|l| {
            serde_json::from_str(&l).unwrap_or_else(|e| panic!("invalid JSON: {e}\nline: {l}"))
        })
        .collect()
}

/// A failed send through the Evolution channel shows up in the JSONL trace
/// nested under the pair turn span that issued it.
#[tokio::test]
async fn send_failure_is_traced_under_pair_turn() {
    let dir = tempfile::tempdir().unwrap();
    let trace_file = dir.path().join("traces.jsonl");

    let file_appender = tracing_appender::rolling::never(dir.path(), "traces.jsonl");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let jsonl_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_span_list(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);
    let subscriber = tracing_subscriber::Registry::default().with(jsonl_layer);
    let default_guard = tracing::subscriber::set_default(subscriber);

    // Nothing listens on port 1, so the request fails at the transport.
    let channel =
        EvolutionChannel::new("http://127.0.0.1:1", "test-key", Duration::from_secs(2)).unwrap();
    let span = tracing::info_span!("pair_turn", pair.id = "p1", counter = 4_u64);
    let result = async {
        let result = channel.send_text("chip-a", "5511900000002", "oi").await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "send failed");
        }
        result
    }
    .instrument(span)
    .await;

    assert!(matches!(result, Err(ChannelError::Transient(_))));

    drop(default_guard);
    drop(guard);

    let lines = read_lines(&trace_file);
    assert!(!lines.is_empty());
    for line in &lines {
        assert!(line.get("timestamp").is_some(), "missing timestamp");
        assert!(line.get("level").is_some(), "missing level");
    }

    let event = lines
        .iter()
        .find(|l| l["fields"]["message"] == "send failed")
        .expect("missing 'send failed' event");
    assert_eq!(event["level"], "WARN");

    let spans = event["spans"].as_array().expect("missing spans array");
    assert_eq!(spans[0]["name"], "pair_turn");
    assert_eq!(spans[0]["pair.id"], "p1");
    assert_eq!(spans[0]["counter"], 4);

    let send_span = lines
        .iter()
        .find(|l| l["span"]["name"] == "evolution_send")
        .expect("missing evolution_send span");
    assert_eq!(send_span["span"]["instance"], "chip-a");
    assert_eq!(send_span["span"]["content_len"], 2);
}
