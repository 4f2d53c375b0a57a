use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use podprep::build::{BuildOptions, run_apply, update_plan};
use podprep::cache::FingerprintCache;
use podprep::config::AppConfig;
use podprep::plan::{AlbumRecord, Plan};
use podprep::scanner::classify::classify;
use podprep::scanner::probe::FfprobeProber;
use podprep::scanner::scan_library;

/// Default plan filename when --plan is not given to `scan`.
const DEFAULT_PLAN_NAME: &str = "podprep-plan.yaml";

/// Cache database location, relative to the output root.
const CACHE_DB_NAME: &str = ".podprep-cache.db";

#[derive(Parser)]
#[command(name = "podprep", version, about = "Device-compatible audio library builder")]
struct Cli {
    /// Path to a TOML config file (default: XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a music library and create/update the conversion plan
    Scan {
        /// Music library root directory
        #[arg(short, long)]
        library: PathBuf,

        /// Plan file path (default: <library>/podprep-plan.yaml)
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Recreate the plan from scratch, discarding user edits
        #[arg(long)]
        recreate: bool,

        /// Number of scan workers (I/O-bound; default from config)
        #[arg(short = 't', long)]
        threads: Option<usize>,
    },

    /// Apply the plan: build the device-compatible output library
    Apply {
        /// Plan file written by `scan`
        #[arg(short, long)]
        plan: PathBuf,

        /// Output root directory
        #[arg(short, long)]
        out: PathBuf,

        /// Report what would be done without building anything
        #[arg(long)]
        dry_run: bool,

        /// Rebuild every track, ignoring the cache
        #[arg(long)]
        force: bool,

        /// Stop scheduling new tracks after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Number of build workers (CPU-bound; default: core count)
        #[arg(short = 't', long)]
        threads: Option<usize>,
    },

    /// Show plan summary and per-status counts
    Status {
        /// Plan file to summarize
        #[arg(short, long)]
        plan: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let config = AppConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Scan {
            library,
            plan,
            recreate,
            threads,
        } => {
            let library = library
                .canonicalize()
                .with_context(|| format!("Library not found: {}", library.display()))?;
            let plan_path = plan.unwrap_or_else(|| library.join(DEFAULT_PLAN_NAME));

            check_tool(&config.ffprobe_path)
                .context("ffprobe not found; install FFmpeg or set ffprobe_path in config")?;

            // Load the existing plan first so a schema problem aborts
            // before any scanning work
            let mut plan = if recreate || !plan_path.exists() {
                Plan::new(&library)
            } else {
                Plan::load(&plan_path).context("Failed to load existing plan")?
            };

            let threads = threads.unwrap_or(config.scan_threads);
            println!("Scanning {} with {} workers", library.display(), threads);

            let prober = FfprobeProber::new(config.ffprobe_path.clone());
            let output = scan_library(&library, &prober, threads).context("Scan failed")?;

            let rows: Vec<AlbumRecord> = output
                .albums
                .iter()
                .map(|facts| {
                    let classification = classify(facts, config.art_min_size);
                    AlbumRecord::from_scan(facts, &classification)
                })
                .collect();

            let albums_found = rows.len();
            plan.merge(rows, &chrono::Utc::now().to_rfc3339());
            plan.save(&plan_path).context("Failed to save plan")?;

            println!(
                "Scan complete: {} albums, {} tracks, {} extraction errors",
                albums_found, output.tracks_probed, output.errors
            );
            let stale = plan.albums.iter().filter(|r| r.is_stale()).count();
            if stale > 0 {
                println!("{stale} plan rows are stale (source directory gone)");
            }
            for (album_id, _, message) in plan.validation_issues() {
                println!("warning: [{album_id}] {message}");
            }
            println!("Plan saved to {}", plan_path.display());
        }

        Commands::Apply {
            plan: plan_path,
            out,
            dry_run,
            force,
            fail_fast,
            threads,
        } => {
            check_tool(&config.ffprobe_path)
                .context("ffprobe not found; install FFmpeg or set ffprobe_path in config")?;
            if !dry_run {
                check_tool(&config.ffmpeg_path)
                    .context("ffmpeg not found; install FFmpeg or set ffmpeg_path in config")?;
            }

            // The plan is read once, fully, before the run; it is updated
            // exactly once afterwards from aggregated outcomes
            let mut plan = Plan::load(&plan_path).context("Failed to load plan")?;
            for (album_id, _, message) in plan.validation_issues() {
                println!("warning: [{album_id}] {message}");
            }

            let library_root = plan.summary.library_root.clone();
            if !library_root.is_dir() {
                anyhow::bail!("Library root from plan not found: {}", library_root.display());
            }

            println!("Re-scanning {} for track facts", library_root.display());
            let prober = FfprobeProber::new(config.ffprobe_path.clone());
            let scan = scan_library(&library_root, &prober, config.scan_threads)
                .context("Scan failed")?;

            let jobs = threads.unwrap_or_else(|| config.resolve_build_jobs());
            let options = BuildOptions {
                output_root: out.clone(),
                dry_run,
                force,
                fail_fast,
                jobs,
                duration_tolerance_secs: config.duration_tolerance_secs,
                tool_version: podprep::TOOL_VERSION.to_string(),
            };

            let cache = FingerprintCache::open(&out.join(CACHE_DB_NAME))
                .context("Failed to open fingerprint cache")?;

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = cancel.clone();
                ctrlc::set_handler(move || {
                    eprintln!("\nInterrupt received, finishing in-flight tracks");
                    cancel.store(true, Ordering::Relaxed);
                })
                .context("Failed to install Ctrl-C handler")?;
            }

            if dry_run {
                println!("DRY RUN — no files will be written (-v to list per-track actions)");
            }
            println!("Applying plan with {jobs} workers");

            let transcoder =
                podprep::build::transcode::FfmpegTranscoder::new(config.ffmpeg_path.clone());
            let report = run_apply(
                &plan,
                &scan.albums,
                &prober,
                &transcoder,
                &cache,
                &config.ceiling(),
                &options,
                &cancel,
            )
            .context("Apply run failed")?;

            let totals = &report.totals;
            if dry_run {
                println!(
                    "Would build {} tracks ({} already cached, {} albums skipped)",
                    totals.planned, totals.cached, totals.skipped_albums
                );
                return Ok(());
            }

            update_plan(&mut plan, &report, &chrono::Utc::now().to_rfc3339());
            plan.save(&plan_path).context("Failed to save plan")?;

            println!(
                "Apply complete: {} built, {} cached, {} failed, {} albums skipped",
                totals.built, totals.cached, totals.failed, totals.skipped_albums
            );
            if !totals.failures_by_code.is_empty() {
                println!("Failures by kind:");
                for (code, count) in &totals.failures_by_code {
                    println!("  {code:<20} {count}");
                }
            }
            if totals.interrupted {
                println!("Run was interrupted; re-run apply to finish remaining tracks");
            }
            if totals.aborted {
                println!("Run aborted by --fail-fast");
            }

            if totals.failed > 0 || totals.aborted || totals.interrupted {
                std::process::exit(1);
            }
        }

        Commands::Status { plan: plan_path } => {
            let plan = Plan::load(&plan_path).context("Failed to load plan")?;
            let summary = &plan.summary;

            println!("Plan: {}", plan_path.display());
            println!("Library root:   {}", summary.library_root.display());
            if let Some(at) = &summary.last_scan_at {
                println!("Last scan:      {at}");
            }
            println!("Total albums:   {}", summary.total_albums);
            println!("Total tracks:   {}", summary.total_tracks);
            println!();

            print_counts("Tag status", &summary.tag_status_counts);
            print_counts("Art status", &summary.art_status_counts);
            print_counts("Actions", &summary.action_counts);

            let stale = plan.albums.iter().filter(|r| r.is_stale()).count();
            if stale > 0 {
                println!("Stale rows:     {stale}");
            }
            let issues = plan.validation_issues();
            if !issues.is_empty() {
                println!();
                println!("Validation issues:");
                for (album_id, code, message) in issues {
                    println!("  [{album_id}] {code}: {message}");
                }
            }
        }
    }

    Ok(())
}

fn print_counts(label: &str, counts: &std::collections::BTreeMap<String, usize>) {
    if counts.is_empty() {
        return;
    }
    println!("{label}:");
    for (key, count) in counts {
        println!("  {key:<16} {count}");
    }
    println!();
}

/// Cheap availability check: run `<tool> -version`.
fn check_tool(path: &str) -> Result<()> {
    let status = std::process::Command::new(path)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => anyhow::bail!("{path} exited with {s}"),
        Err(e) => Err(e).with_context(|| format!("could not run {path}")),
    }
}
