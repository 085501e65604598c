//! `fusemap` – replay a recorded sensor log into the configured maps.
//!
//! The binary:
//!
//! 1. Loads a session config (`--config`, TOML) and builds one mapper per
//!    `[[mappers]]` entry, all resolving poses through a shared `TfBuffer`.
//! 2. Streams the JSON-lines recording (`--log`): transform records go into
//!    the buffer, scan records are dispatched to the mappers on a pool of
//!    worker threads.
//! 3. Saves every map under the output directory once the log is exhausted,
//!    or as soon as **Ctrl-C** is received.

mod recording;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use clap::Parser;
use colored::Colorize;
use fusemap_mapper::{MapRegistry, SaveOutcome, SessionConfig, telemetry};
use fusemap_perception::TfBuffer;
use fusemap_types::{DataItem, MapError};
use tracing::{debug, info, warn};

use crate::recording::Record;

#[derive(Parser, Debug)]
#[command(name = "fusemap")]
#[command(about = "Fuse a recorded sensor log into occupancy and NDT maps")]
#[command(version)]
struct Args {
    /// Session configuration (TOML)
    #[arg(short, long, env = "FUSEMAP_CONFIG")]
    config: PathBuf,

    /// JSON-lines recording of transforms and scans
    #[arg(short, long)]
    log: PathBuf,

    /// Worker threads dispatching scans
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Output root; overrides `output_path` from the config
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Counters for the ingestion pass.
#[derive(Debug, Default)]
struct Ingest {
    transforms: u64,
    scans: u64,
    bad_lines: u64,
    interrupted: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = telemetry::init_tracing("fusemap");

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when at least one map failed to set up or save.
fn run(args: &Args) -> Result<bool, String> {
    let config = SessionConfig::load_from(&args.config).map_err(|e| e.to_string())?;
    let output = args.output.clone().unwrap_or_else(|| config.output_path.clone());

    let tf = Arc::new(TfBuffer::new());
    let registry = Arc::new(MapRegistry::from_config(&config, tf.clone()).map_err(|e| e.to_string())?);
    if registry.is_empty() {
        return Err(format!("{} defines no mappers", args.config.display()));
    }

    let failed_setup = registry.setup_all();
    for (name, e) in &failed_setup {
        println!("  {} {}: {}", "✗".red().bold(), name.bold(), e);
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping ingestion and saving maps …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; maps are only saved at end of log");
    }

    let file = File::open(&args.log).map_err(|e| format!("{}: {e}", args.log.display()))?;
    let replay = ingest(BufReader::new(file), &tf, &registry, args.workers.max(1), &shutdown);
    info!(
        transforms = replay.transforms,
        scans = replay.scans,
        bad_lines = replay.bad_lines,
        interrupted = replay.interrupted,
        "ingestion finished"
    );

    let saved = registry.save_all(&output);
    print_summary(&registry, &replay, &saved);

    let save_failed = saved.iter().any(|(_, r)| r.is_err());
    Ok(failed_setup.is_empty() && !save_failed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingestion
// ─────────────────────────────────────────────────────────────────────────────

/// Feed every record of `reader` into `tf` or the worker pool.  Returns once
/// all dispatched scans have been processed.
fn ingest<R: std::io::BufRead>(
    reader: R,
    tf: &TfBuffer,
    registry: &Arc<MapRegistry>,
    workers: usize,
    shutdown: &AtomicBool,
) -> Ingest {
    let (tx, rx) = mpsc::channel::<DataItem>();
    let rx = Arc::new(Mutex::new(rx));
    let pool: Vec<_> = (0..workers)
        .map(|_| {
            let rx = Arc::clone(&rx);
            let registry = Arc::clone(registry);
            thread::spawn(move || worker(&rx, &registry))
        })
        .collect();

    let mut stats = Ingest::default();
    for record in recording::records(reader) {
        if shutdown.load(Ordering::SeqCst) {
            stats.interrupted = true;
            break;
        }
        match record {
            Ok(Record::Transform(t)) => match t.transform() {
                Ok(transform) => {
                    match t.stamp {
                        Some(stamp) if !t.is_static => tf.set_transform(&t.parent, &t.child, stamp, transform),
                        _ => tf.set_static_transform(&t.parent, &t.child, transform),
                    }
                    stats.transforms += 1;
                }
                Err(e) => {
                    warn!(error = %e, "skipping transform");
                    stats.bad_lines += 1;
                }
            },
            Ok(Record::Scan(scan)) => {
                if tx.send(scan.into_item()).is_err() {
                    warn!("all workers exited; stopping ingestion");
                    break;
                }
                stats.scans += 1;
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed record");
                stats.bad_lines += 1;
            }
        }
    }

    drop(tx);
    for handle in pool {
        if handle.join().is_err() {
            warn!("worker thread panicked");
        }
    }
    stats
}

fn worker(rx: &Mutex<Receiver<DataItem>>, registry: &MapRegistry) {
    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        match next {
            Ok(item) => {
                if registry.dispatch(&item) == 0 {
                    debug!(kind = %item.kind(), frame = %item.frame_id(), "no mapper accepts item");
                }
            }
            Err(_) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary
// ─────────────────────────────────────────────────────────────────────────────

fn print_summary(
    registry: &MapRegistry,
    replay: &Ingest,
    saved: &[(String, Result<SaveOutcome, MapError>)],
) {
    println!();
    println!(
        "  {} {} transforms, {} scans, {} bad lines{}",
        "Ingested".bold(),
        replay.transforms,
        replay.scans,
        replay.bad_lines,
        if replay.interrupted { " (interrupted)".yellow().to_string() } else { String::new() }
    );
    println!();

    for (name, result) in saved {
        let stats = registry.get(name).map(|m| m.stats()).unwrap_or_default();
        let frames = format!(
            "{} inserted / {} dropped / {} ignored",
            stats.frames_inserted, stats.frames_dropped, stats.frames_ignored
        );
        match result {
            Ok(SaveOutcome::Saved { dir, cells }) => println!(
                "  {} {:<16} {} cells  {}  → {}",
                "✓".green().bold(),
                name.bold(),
                cells,
                frames.dimmed(),
                dir.display()
            ),
            Ok(SaveOutcome::NoMap) => println!(
                "  {} {:<16} {}  {}",
                "-".yellow().bold(),
                name.bold(),
                "no map (never initialized)".yellow(),
                frames.dimmed()
            ),
            Err(e) => println!("  {} {:<16} {}: {}", "✗".red().bold(), name.bold(), "save failed".red(), e),
        }
        if stats.processing.count() > 0 {
            info!(mapper = %name, timing = %stats.processing, "frame processing time");
            println!("    {} {}", "frame time".dimmed(), stats.processing.to_string().dimmed());
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = r#"
map_frame = "map"
tf_timeout_ms = 50

[[mappers]]
name = "occupancy"
kind = "occupancy"
resolution = 0.5

[[mappers]]
name = "scans"
accepts = ["laser_scan"]
"#;

    const LOG: &str = r#"# two frames seen from a fixed sensor
{"type":"transform","parent":"map","child":"laser","static":true,"translation":[0.0,0.0,0.0]}
{"type":"scan","frame_id":"laser","stamp":"2024-01-01T00:00:00Z","data":{"kind":"pointcloud","points":[{"x":1.2,"y":0.2,"z":0.2}]}}
not json
{"type":"scan","frame_id":"laser","stamp":"2024-01-01T00:00:01Z","data":{"kind":"pointcloud","points":[{"x":2.2,"y":0.2,"z":0.2}]}}
"#;

    fn setup() -> (Arc<TfBuffer>, Arc<MapRegistry>) {
        let config = SessionConfig::from_toml_str(SESSION).unwrap();
        let tf = Arc::new(TfBuffer::new());
        let registry = Arc::new(MapRegistry::from_config(&config, tf.clone()).unwrap());
        (tf, registry)
    }

    #[test]
    fn ingest_routes_transforms_and_scans() {
        let (tf, registry) = setup();
        let stats = ingest(LOG.as_bytes(), &tf, &registry, 2, &AtomicBool::new(false));

        assert_eq!(stats.transforms, 1);
        assert_eq!(stats.scans, 2);
        assert_eq!(stats.bad_lines, 1);
        assert!(!stats.interrupted);
        assert!(tf.has_frame("laser"));

        let occupancy = registry.get("occupancy").unwrap().stats();
        assert_eq!(occupancy.frames_inserted, 2);
        assert_eq!(occupancy.points_inserted, 2);
        assert_eq!(occupancy.processing.count(), 2);
        assert!(!registry.get("scans").unwrap().is_initialized());
    }

    #[test]
    fn shutdown_flag_stops_before_first_record() {
        let (tf, registry) = setup();
        let stats = ingest(LOG.as_bytes(), &tf, &registry, 1, &AtomicBool::new(true));
        assert!(stats.interrupted);
        assert_eq!(stats.scans, 0);
        assert!(!registry.get("occupancy").unwrap().is_initialized());
    }

    #[test]
    fn saved_maps_land_under_output_root() {
        let (tf, registry) = setup();
        ingest(LOG.as_bytes(), &tf, &registry, 2, &AtomicBool::new(false));

        let out = tempfile::tempdir().unwrap();
        let saved = registry.save_all(out.path());
        assert!(out.path().join("occupancy").join("map.toml").is_file());
        assert!(saved.iter().any(|(n, r)| n == "scans" && matches!(r, Ok(SaveOutcome::NoMap))));
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["fusemap", "--config", "s.toml", "--log", "r.jsonl"]).unwrap();
        assert_eq!(args.workers, 4);
        assert!(args.output.is_none());
    }
}
