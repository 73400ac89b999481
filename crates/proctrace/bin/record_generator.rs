//! Synthetic Record Generator
//!
//! Opens several ingest connections and streams randomized logon/logoff
//! records at a fixed rate per connection:
//! - `JoinSet` for the connection tasks
//! - `watch` channel for shutdown signaling
//! - interval pacing with skipped missed ticks
//!
//! Run with: `cargo run --bin record_generator -- --connections 4 --rate 200`

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};

const PROCESSES: &[&str] = &[
    "explorer.exe",
    "svchost.exe",
    "winlogon.exe",
    "userinit.exe",
    "chrome.exe",
    "outlook.exe",
    "teams.exe",
    "powershell.exe",
];

const PROC_TYPES: &[&str] = &["Interactive", "Service", "Batch", "Shell"];

/// Streams synthetic telemetry records to a proctrace ingest port.
#[derive(Parser, Debug)]
#[command(name = "record_generator", version, about, long_about = None)]
struct Args {
    /// Ingest address
    #[arg(long, default_value = "127.0.0.1:5000")]
    target: String,

    /// Concurrent connections
    #[arg(long, default_value_t = 4)]
    connections: usize,

    /// Records per second per connection (0 = as fast as possible)
    #[arg(long, default_value_t = 100.0)]
    rate: f64,

    /// Seconds to run
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Distinct sessions per connection
    #[arg(long, default_value_t = 5)]
    sessions: usize,

    /// Share of records emitted as logoff events
    #[arg(long, default_value_t = 0.2)]
    logoff_ratio: f64,
}

/// Statistics collected from each connection task.
#[derive(Debug)]
struct ConnectionStats {
    connection_id: usize,
    records_sent: u64,
    duration: Duration,
}

impl ConnectionStats {
    fn effective_rate(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.records_sent as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    println!("=== Record Generator ===\n");
    println!("Target: {}", args.target);
    println!("Connections: {}", args.connections);
    println!("Rate: {} records/sec per connection\n", args.rate);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut join_set: JoinSet<Result<ConnectionStats>> = JoinSet::new();

    for connection_id in 0..args.connections {
        let stream = TcpStream::connect(&args.target)
            .await
            .with_context(|| format!("failed to connect to {}", args.target))?;
        join_set.spawn(connection_task(
            connection_id,
            stream,
            pace(args.rate),
            session_guids(args.sessions),
            args.logoff_ratio,
            shutdown_rx.clone(),
        ));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("\nReceived Ctrl+C, stopping..."),
        () = tokio::time::sleep(Duration::from_secs(args.duration)) => {
            println!("\nDuration reached, stopping...");
        }
    }
    // Receivers only disappear once every task has already exited
    let _ = shutdown_tx.send(true);

    let mut total = 0;
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(stats)) => {
                println!(
                    "Connection {} finished: {} records in {:.2}s ({:.1} records/sec)",
                    stats.connection_id,
                    stats.records_sent,
                    stats.duration.as_secs_f64(),
                    stats.effective_rate(),
                );
                total += stats.records_sent;
            }
            Ok(Err(e)) => eprintln!("Connection task failed: {e:#}"),
            Err(e) => eprintln!("Task join error: {e}"),
        }
    }

    println!("\nTotal records sent: {total}");
    Ok(())
}

/// Interval between records, `None` for unpaced.
fn pace(rate: f64) -> Option<Duration> {
    (rate > 0.0 && rate.is_finite()).then(|| Duration::from_secs_f64(1.0 / rate))
}

fn session_guids(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count.max(1))
        .map(|_| {
            let a: u32 = rng.r#gen();
            let b: u16 = rng.r#gen();
            let c: u16 = rng.r#gen();
            let d: u16 = rng.r#gen();
            let e: u64 = rng.gen_range(0..1 << 48);
            format!("{a:08x}-{b:04x}-{c:04x}-{d:04x}-{e:012x}")
        })
        .collect()
}

async fn connection_task(
    connection_id: usize,
    stream: TcpStream,
    period: Option<Duration>,
    sessions: Vec<String>,
    logoff_ratio: f64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<ConnectionStats> {
    let mut writer = BufWriter::new(stream);
    let mut ticker = period.map(|p| {
        let mut ticker = interval(p);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    let start = Instant::now();
    let mut records_sent = 0_u64;

    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }
        match ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => tokio::task::yield_now().await,
        }

        let record = random_record(&sessions, logoff_ratio);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("ingest connection closed")?;
        records_sent += 1;

        if records_sent.is_multiple_of(100) {
            writer.flush().await?;
        }
    }

    writer.flush().await?;
    writer.shutdown().await?;
    Ok(ConnectionStats {
        connection_id,
        records_sent,
        duration: start.elapsed(),
    })
}

fn random_record(sessions: &[String], logoff_ratio: f64) -> Value {
    let mut rng = rand::thread_rng();
    let guid = sessions.choose(&mut rng).cloned().unwrap_or_default();
    let proc_type = PROC_TYPES.choose(&mut rng).copied().unwrap_or("Interactive");

    let mut record = json!({
        "SessionGUID": guid,
        "ProcID": rng.gen_range(100..65_536_u32),
        "ProcParentID": if rng.gen_bool(0.2) { 0 } else { rng.gen_range(4..65_536_u32) },
        "ProcName": PROCESSES.choose(&mut rng).copied().unwrap_or("unknown.exe"),
        "ProcUser": format!("user{:03}", rng.gen_range(0..50)),
        "ProcStartTimeRelativeMs": rng.gen_range(0..60_000),
        "ProcLifetimeMs": rng.gen_range(1..120_000),
        "ProcCPUTimeMs": rng.gen_range(0..10_000),
        "ProcWorkingSetMB": (rng.gen_range(1.0..2048.0_f64) * 10.0).round() / 10.0,
        "ProcNetKBPS": (rng.gen_range(0.0..500.0_f64) * 10.0).round() / 10.0,
        "ProcIOReadCount": rng.gen_range(0..100_000),
        "ProcIOWriteCount": rng.gen_range(0..100_000),
        "ProcIOReadMB": rng.gen_range(0.0..1024.0_f64),
        "ProcIOWriteMB": rng.gen_range(0.0..1024.0_f64),
        "ProcIOLatencyReadMs2": rng.gen_range(0..50),
        "ProcIOLatencyWriteMs2": rng.gen_range(0..50),
        "LogonProcType": proc_type,
    });
    if rng.gen_bool(logoff_ratio.clamp(0.0, 1.0))
        && let Some(fields) = record.as_object_mut()
    {
        fields.insert("LogoffProcType".into(), Value::from(proc_type));
    }
    record
}
