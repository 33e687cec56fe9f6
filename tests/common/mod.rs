#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use fifocast::config::{Host, Hosts};
use fifocast::event_log::EventLog;
use tokio::time::sleep;

/// A membership table of `n` processes on localhost, process `i` on
/// `base_port + i`. Tests pick disjoint base ports (and keep them below the
/// send-port offset of any other test's base) so parallel test runs do not
/// collide.
pub fn localhost_hosts(base_port: u16, n: u32) -> Hosts {
    let hosts = (1..=n)
        .map(|id| Host {
            id,
            addr: SocketAddr::from(([127, 0, 0, 1], base_port + id as u16)),
        })
        .collect();
    Hosts::new(hosts).expect("valid test membership")
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|content| content.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Polls the event log until `pred` holds for its flushed lines. Panics with
/// the log's current content after 20 seconds.
pub async fn await_log_lines(
    log: &EventLog,
    path: &Path,
    pred: impl Fn(&[String]) -> bool,
) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        log.flush();
        let lines = read_lines(path);
        if pred(&lines) {
            return lines;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting on {:?}, lines so far: {:?}", path, lines);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Asserts that for every origin, the `d <origin> <seq>` lines appear in
/// strictly increasing seq order.
pub fn assert_fifo_order(lines: &[String]) {
    let mut last_seq_per_origin = std::collections::HashMap::new();
    for line in lines {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("d") {
            continue;
        }
        let origin: u32 = parts.next().unwrap().parse().unwrap();
        let seq: u32 = parts.next().unwrap().parse().unwrap();

        let last = last_seq_per_origin.entry(origin).or_insert(0u32);
        assert!(
            seq > *last,
            "delivery of {} {} after {} {} breaks per-origin ordering",
            origin, seq, origin, *last,
        );
        *last = seq;
    }
}
