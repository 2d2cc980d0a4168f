//! Workload driver for the Umbra transactional memory.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use umbra::stm::{Stm, StmConfig, TxnExecutor, TxnLong};

#[derive(Parser, Debug)]
#[command(
    name = "umbra-bench",
    version,
    about = "Concurrent workloads against the Umbra STM",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, value_name = "FILE", env = "UMBRA_CONFIG", help = "TOML file with runtime settings")]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = 4, help = "Worker threads")]
    threads: usize,

    #[arg(long, global = true, help = "Run every transaction in the full-featured flavor")]
    no_speculative: bool,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Report format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Every thread increments one shared counter.
    Increment(IncrementCmd),
    /// Mostly reads over a set of accounts with occasional transfers.
    ReadMostly(ReadMostlyCmd),
}

#[derive(Args, Debug)]
struct IncrementCmd {
    #[arg(long, default_value_t = 10_000, help = "Increments per thread")]
    ops: u64,

    #[arg(long, help = "Use commuting increments instead of read-modify-write")]
    commute: bool,
}

#[derive(Args, Debug)]
struct ReadMostlyCmd {
    #[arg(long, default_value_t = 10_000, help = "Transactions per thread")]
    ops: u64,

    #[arg(long, default_value_t = 64, help = "Number of accounts")]
    cells: usize,

    #[arg(long, default_value_t = 0.05, help = "Fraction of transactions that transfer")]
    write_ratio: f64,

    #[arg(long, default_value_t = 7, help = "Seed of the per-thread generators")]
    seed: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Aligned table.
    Text,
    /// One JSON object per report.
    Json,
}

#[derive(Debug, Serialize)]
struct Report {
    workload: &'static str,
    threads: usize,
    transactions: u64,
    elapsed_ms: f64,
    txn_per_sec: f64,
    expected: i64,
    observed: i64,
    consistent: bool,
}

impl Report {
    fn print(&self, format: OutputFormat) -> Result<(), Box<dyn Error>> {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(self)?),
            OutputFormat::Text => {
                println!(
                    "{:<14} {:>8} {:>12} {:>12} {:>14} {:>10}",
                    "WORKLOAD", "THREADS", "TXNS", "TIME", "TXN/S", "CHECK"
                );
                println!(
                    "{:<14} {:>8} {:>12} {:>12} {:>14.0} {:>10}",
                    self.workload,
                    self.threads,
                    self.transactions,
                    format_duration(Duration::from_secs_f64(self.elapsed_ms / 1_000.0)),
                    self.txn_per_sec,
                    if self.consistent { "ok" } else { "MISMATCH" }
                );
            }
        }
        Ok(())
    }
}

fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{micros} µs")
    } else if micros < 1_000_000 {
        format!("{:.2} ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2} s", micros as f64 / 1_000_000.0)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if cli.threads == 0 {
        return Err("--threads must be at least 1".into());
    }
    let config = match &cli.config {
        Some(path) => StmConfig::from_file(path)?,
        None => StmConfig::default(),
    };
    let stm = Stm::new(config)?;
    let report = match &cli.command {
        Command::Increment(cmd) => run_increment(&stm, &cli, cmd)?,
        Command::ReadMostly(cmd) => run_read_mostly(&stm, &cli, cmd)?,
    };
    report.print(cli.format)?;
    if !report.consistent {
        return Err(format!(
            "expected {} but observed {}",
            report.expected, report.observed
        )
        .into());
    }
    Ok(())
}

fn family_executor(stm: &Arc<Stm>, cli: &Cli, family: &str) -> umbra::Result<TxnExecutor> {
    stm.executor(stm.txn_config(family).speculative(!cli.no_speculative))
}

fn run_increment(stm: &Arc<Stm>, cli: &Cli, cmd: &IncrementCmd) -> Result<Report, Box<dyn Error>> {
    let counter = TxnLong::new(stm, 0);
    let executor = family_executor(stm, cli, "increment")?;
    info!(threads = cli.threads, ops = cmd.ops, commute = cmd.commute, "increment workload");

    let start = Instant::now();
    let results: Vec<umbra::Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..cli.threads)
            .map(|_| {
                let counter = counter.clone();
                let executor = executor.clone();
                scope.spawn(move || -> umbra::Result<()> {
                    for _ in 0..cmd.ops {
                        if cmd.commute {
                            executor.execute(|tx| counter.increment(tx, 1))?;
                        } else {
                            executor.execute(|tx| counter.increment_and_get(tx, 1).map(|_| ()))?;
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(Err(umbra::StmError::Invalid("worker panicked"))))
            .collect()
    });
    let elapsed = start.elapsed();
    results.into_iter().collect::<umbra::Result<Vec<()>>>()?;

    let transactions = cli.threads as u64 * cmd.ops;
    let expected = transactions as i64;
    let observed = counter.atomic_get()?;
    Ok(Report {
        workload: "increment",
        threads: cli.threads,
        transactions,
        elapsed_ms: elapsed.as_secs_f64() * 1_000.0,
        txn_per_sec: transactions as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        expected,
        observed,
        consistent: expected == observed,
    })
}

const INITIAL_BALANCE: i64 = 100;

/// Sums every account in one transaction; transfers preserve the total, so
/// any other result is an inconsistent snapshot.
fn audit(executor: &TxnExecutor, accounts: &[TxnLong]) -> umbra::Result<i64> {
    executor.execute(|tx| {
        accounts
            .iter()
            .try_fold(0i64, |sum, account| Ok(sum + account.get(tx)?))
    })
}

fn run_read_mostly(stm: &Arc<Stm>, cli: &Cli, cmd: &ReadMostlyCmd) -> Result<Report, Box<dyn Error>> {
    if cmd.cells < 2 {
        return Err("--cells must be at least 2".into());
    }
    if !(0.0..=1.0).contains(&cmd.write_ratio) {
        return Err("--write-ratio must be within 0..=1".into());
    }
    let accounts: Vec<TxnLong> = (0..cmd.cells)
        .map(|_| TxnLong::new(stm, INITIAL_BALANCE))
        .collect();
    let reader = family_executor(stm, cli, "read-mostly/audit")?;
    let writer = family_executor(stm, cli, "read-mostly/transfer")?;
    let expected = cmd.cells as i64 * INITIAL_BALANCE;
    let torn_reads = AtomicU64::new(0);
    info!(threads = cli.threads, ops = cmd.ops, cells = cmd.cells, "read-mostly workload");

    let start = Instant::now();
    let results: Vec<umbra::Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..cli.threads)
            .map(|worker| {
                let accounts = &accounts;
                let reader = &reader;
                let writer = &writer;
                let torn_reads = &torn_reads;
                scope.spawn(move || -> umbra::Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(cmd.seed.wrapping_add(worker as u64));
                    for _ in 0..cmd.ops {
                        let from = rng.gen_range(0..accounts.len());
                        let to = (from + rng.gen_range(1..accounts.len())) % accounts.len();
                        if rng.gen_bool(cmd.write_ratio) {
                            writer.execute(|tx| {
                                accounts[from].increment_and_get(tx, -1)?;
                                accounts[to].increment_and_get(tx, 1)?;
                                Ok(())
                            })?;
                        } else if audit(reader, accounts)? != expected {
                            torn_reads.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(Err(umbra::StmError::Invalid("worker panicked"))))
            .collect()
    });
    let elapsed = start.elapsed();
    results.into_iter().collect::<umbra::Result<Vec<()>>>()?;

    let observed = audit(&reader, &accounts)?;
    let transactions = cli.threads as u64 * cmd.ops;
    Ok(Report {
        workload: "read-mostly",
        threads: cli.threads,
        transactions,
        elapsed_ms: elapsed.as_secs_f64() * 1_000.0,
        txn_per_sec: transactions as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        expected,
        observed,
        consistent: expected == observed && torn_reads.load(Ordering::Relaxed) == 0,
    })
}
