//! folio CLI: OCR and translate files under a rate limit.

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use folio::config::{self, Config, Profile, Provider};
use folio::dispatcher::Dispatcher;
use folio::model::{Payload, ServiceOutput, State, WorkId};
use folio::service::{AnthropicService, GeminiService, RecognitionService, RequestOptions};
use folio::store::{self, HistoryEntry, KvStore, SqliteStore};
use folio::telemetry::{TelemetryConfig, init_telemetry};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;
use tracing::warn;

#[derive(Parser)]
#[command(name = "folio", about = "Rate-limited OCR and translation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// OCR images and translate text files
    Process {
        /// Files or directories to process
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Requests per minute (saved for next time)
        #[arg(long)]
        rpm: Option<u32>,
        /// Concurrent requests (saved; decouples from --rpm)
        #[arg(long)]
        max_concurrent: Option<u32>,
        /// Model identifier
        #[arg(long)]
        model: Option<String>,
        /// Instructions sent with every request
        #[arg(long)]
        instructions: Option<String>,
        /// TOML file with model and instructions
        #[arg(long)]
        profile: Option<PathBuf>,
        /// Directory for extracted text and images
        #[arg(long)]
        out: Option<PathBuf>,
        /// Retry failed items once after the first pass
        #[arg(long)]
        retry_failed: bool,
    },
    /// Rate limit settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Show recent results
    History {
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the saved limits
    Show,
    /// Change the saved limits
    Set {
        #[arg(long)]
        rpm: Option<u32>,
        #[arg(long)]
        max_concurrent: Option<u32>,
        /// Tie the concurrency cap to the rate limit again
        #[arg(long)]
        couple: bool,
    },
}

struct ProcessArgs {
    paths: Vec<PathBuf>,
    rpm: Option<u32>,
    max_concurrent: Option<u32>,
    model: Option<String>,
    instructions: Option<String>,
    profile: Option<PathBuf>,
    out: Option<PathBuf>,
    retry_failed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Process {
            paths,
            rpm,
            max_concurrent,
            model,
            instructions,
            profile,
            out,
            retry_failed,
        } => {
            cmd_process(ProcessArgs {
                paths,
                rpm,
                max_concurrent,
                model,
                instructions,
                profile,
                out,
                retry_failed,
            })
            .await
        }
        Command::Settings { action } => {
            let store = SqliteStore::connect(&config::database_url_from_env()).await?;
            match action {
                SettingsAction::Show => cmd_settings_show(&store).await,
                SettingsAction::Set {
                    rpm,
                    max_concurrent,
                    couple,
                } => cmd_settings_set(&store, rpm, max_concurrent, couple).await,
            }
        }
        Command::History { limit } => {
            let store = SqliteStore::connect(&config::database_url_from_env()).await?;
            cmd_history(&store, limit).await
        }
    }
}

async fn cmd_process(args: ProcessArgs) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "folio".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let store = SqliteStore::connect(&config.database_url).await?;

    let mut limits = store::load_limits(&store).await?;
    if let Some(rpm) = args.rpm {
        limits.set_rpm(rpm);
    }
    if let Some(n) = args.max_concurrent {
        limits.set_max_concurrent(n);
    }
    if args.rpm.is_some() || args.max_concurrent.is_some() {
        store::save_limits(&store, &limits).await?;
    }
    if !limits.admits_anything() {
        anyhow::bail!(
            "rpm ({}) and max concurrent ({}) must both be positive",
            limits.rpm,
            limits.max_concurrent
        );
    }

    let profile = match args.profile {
        Some(ref path) => Profile::load(path)?,
        None => Profile::default(),
    };
    let options = RequestOptions {
        model: args
            .model
            .or(profile.model)
            .unwrap_or_else(|| config.model.clone()),
        instructions: args.instructions.or(profile.instructions),
    };

    let payloads = collect_payloads(&args.paths).await?;
    if payloads.is_empty() {
        anyhow::bail!("no supported files found");
    }

    let service: Box<dyn RecognitionService> = match config.provider {
        Provider::Gemini => Box::new(GeminiService::new(&config.api_key)?),
        Provider::Anthropic => Box::new(AnthropicService::new(&config.api_key)?),
    };

    println!(
        "Processing {} item(s) with {} at {} rpm, {} concurrent",
        payloads.len(),
        options.model,
        limits.rpm,
        limits.concurrency_cap()
    );

    let model = options.model.clone();
    let dispatcher = Dispatcher::with_system_clock(service, limits, options);
    let runner = dispatcher.clone();
    let run = tokio::spawn(async move { runner.run().await });

    let ids = dispatcher.enqueue_all(payloads);
    wait_with_progress(&dispatcher).await;

    if args.retry_failed {
        let failed: Vec<WorkId> = ids
            .iter()
            .copied()
            .filter(|id| dispatcher.get(*id).is_some_and(|i| i.state == State::Failed))
            .collect();
        if !failed.is_empty() {
            println!("Retrying {} failed item(s)", failed.len());
            for id in failed {
                dispatcher.retry(id)?;
            }
            wait_with_progress(&dispatcher).await;
        }
    }

    dispatcher.shutdown();
    if let Err(e) = run.await {
        warn!(error = %e, "dispatcher run loop ended abnormally");
    }

    report(&dispatcher, &ids, &store, &model, args.out.as_deref()).await
}

/// Expand directories (one level) and classify files.
async fn collect_payloads(paths: &[PathBuf]) -> anyhow::Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(path).await?;
            while let Some(entry) = dir.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    entries.push(entry.path());
                }
            }
            entries.sort();
            for file in entries {
                match Payload::from_path(&file).await {
                    Ok(payload) => payloads.push(payload),
                    Err(e) => warn!(path = %file.display(), "skipping: {e}"),
                }
            }
        } else {
            payloads.push(Payload::from_path(path).await?);
        }
    }
    Ok(payloads)
}

/// Print a status line once a second until the dispatcher settles.
///
/// Display only; admission does not depend on this timer.
async fn wait_with_progress<S: RecognitionService>(dispatcher: &Dispatcher<S>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let settled = dispatcher.settled();
    tokio::pin!(settled);

    loop {
        tokio::select! {
            _ = &mut settled => break,
            _ = ticker.tick() => {
                let status = dispatcher.status();
                let countdown = dispatcher.countdown();
                let wait = if countdown.queued > 0 && countdown.available_slots == 0 {
                    format!("  next slot in {}s", countdown.seconds_until_next_slot)
                } else {
                    String::new()
                };
                eprintln!(
                    "queued {:>3}  processing {:>3}  completed {:>3}  failed {:>3}{wait}",
                    status.queued, status.processing, status.completed, status.failed
                );
            }
        }
    }
}

async fn report<S: RecognitionService>(
    dispatcher: &Dispatcher<S>,
    ids: &[WorkId],
    store: &dyn KvStore,
    model: &str,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(dir) = out {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut completed = 0;
    let mut failed = 0;

    for id in ids {
        let Some(item) = dispatcher.get(*id) else {
            continue;
        };
        let label = item.payload.label();
        let Some(ref outcome) = item.outcome else {
            println!("?  {label} ({})", item.state);
            continue;
        };

        if item.state == State::Completed {
            completed += 1;
            match (out, outcome.output.as_ref()) {
                (Some(dir), Some(ServiceOutput::Text(text))) => {
                    let dest = dir.join(item.output_file_name("txt"));
                    write_new(&dest, text.as_bytes()).await?;
                    println!("ok {label} -> {}", dest.display());
                }
                (Some(dir), Some(ServiceOutput::Image(bytes))) => {
                    let dest = dir.join(item.output_file_name("png"));
                    write_new(&dest, bytes).await?;
                    println!("ok {label} -> {}", dest.display());
                }
                (None, Some(ServiceOutput::Text(text))) => {
                    println!("ok {label}\n{text}\n");
                }
                (_, Some(ServiceOutput::Empty)) => println!("ok {label} (no text found)"),
                _ => println!("ok {label}"),
            }
        } else {
            failed += 1;
            println!(
                "FAILED {label}: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }

        store::append_history(
            store,
            HistoryEntry {
                id: item.id,
                source: label,
                model: model.to_string(),
                text: outcome.text().map(str::to_string),
                thinking: outcome.thinking.clone(),
                error: outcome.error.clone(),
                created_at: Utc::now(),
            },
        )
        .await?;
    }

    println!("\n{completed} completed, {failed} failed");
    Ok(())
}

/// Write `bytes` to a file that must not exist yet.
async fn write_new(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .with_context(|| format!("refusing to overwrite {}", dest.display()))?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

async fn cmd_settings_show(store: &SqliteStore) -> anyhow::Result<()> {
    let limits = store::load_limits(store).await?;
    print_limits(&limits);
    Ok(())
}

async fn cmd_settings_set(
    store: &SqliteStore,
    rpm: Option<u32>,
    max_concurrent: Option<u32>,
    couple: bool,
) -> anyhow::Result<()> {
    let mut limits = store::load_limits(store).await?;
    if couple {
        limits.coupled = true;
        limits.max_concurrent = limits.rpm;
    }
    if let Some(n) = max_concurrent {
        limits.set_max_concurrent(n);
    }
    if let Some(rpm) = rpm {
        limits.set_rpm(rpm);
    }
    store::save_limits(store, &limits).await?;
    print_limits(&limits);
    Ok(())
}

fn print_limits(limits: &folio::Limits) {
    println!("RPM:            {}", limits.rpm);
    println!("Max Concurrent: {}", limits.max_concurrent);
    println!(
        "Coupling:       {}",
        if limits.coupled {
            "concurrency follows rpm"
        } else {
            "independent"
        }
    );
}

async fn cmd_history(store: &SqliteStore, limit: usize) -> anyhow::Result<()> {
    let entries = store::load_history(store, limit).await?;
    if entries.is_empty() {
        println!("No history yet.");
        return Ok(());
    }

    println!("{:<8}  {:<16}  {:<7}  {:<40}", "ID", "WHEN", "RESULT", "SOURCE");
    println!("{}", "-".repeat(80));
    for entry in &entries {
        let result = if entry.error.is_some() { "failed" } else { "ok" };
        let chars = entry.source.chars().count();
        let source: String = if chars > 40 {
            entry.source.chars().skip(chars - 40).collect()
        } else {
            entry.source.clone()
        };
        println!(
            "{:<8}  {:<16}  {:<7}  {:<40}",
            entry.id,
            entry.created_at.format("%Y-%m-%d %H:%M"),
            result,
            source
        );
    }
    println!("\n{} entr(ies)", entries.len());
    Ok(())
}
