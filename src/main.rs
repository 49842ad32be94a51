use anyhow::{Context, Result};
use async_trait::async_trait;
use bunnysync_lib::config::{ConfigOverrides, SyncConfig, CONFIG_FILE_NAME};
use bunnysync_lib::core::{AutoConfirm, Confirm, Outcome, PlanSummary, SyncEngine, SyncProgress, SyncReport};
use bunnysync_lib::format::{calc_speed, format_elapsed, format_eta, format_size, truncate_path};
use bunnysync_lib::logging::{get_log_dir, init_logging};
use bunnysync_lib::storage::create_storage;
use clap::Parser;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// 中断退出码
const EXIT_CANCELLED: i32 = 130;

/// bunnysync - Sync a local directory tree to a Bunny.net storage zone
#[derive(Parser, Debug)]
#[command(name = "bunnysync")]
#[command(version)]
#[command(about = "Sync a local directory tree to a Bunny.net storage zone")]
struct Args {
    /// Configuration file (searched in cwd, program dir and home when no directory is given)
    #[arg(long, value_name = "FILE", default_value = CONFIG_FILE_NAME)]
    config: String,

    /// Source directory to sync (overrides config file)
    #[arg(long, value_name = "PATH")]
    src_dir: Option<String>,

    /// Storage zone API key (overrides config file)
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Storage zone URL, or file:///path for a local mirror (overrides config file)
    #[arg(long, value_name = "URL")]
    storage_url: Option<String>,

    /// Checksum cache directory (overrides config file)
    #[arg(long, value_name = "PATH")]
    cache_dir: Option<String>,

    /// Show what would be done without making changes
    #[arg(long)]
    dry_run: bool,

    /// Apply changes without asking for confirmation
    #[arg(short = 'y', long)]
    yes: bool,

    /// Also write log output to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

/// 终端 y/N 确认
struct StdinConfirm {
    cancel_flag: Arc<AtomicBool>,
}

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, summary: &PlanSummary) -> bool {
        print_plan(summary);
        print!("Do you want to proceed with these changes? (y/N): ");
        let _ = std::io::stdout().flush();

        let read = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        });

        tokio::select! {
            answer = read => match answer {
                Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
                _ => false,
            },
            _ = tokio::signal::ctrl_c() => {
                self.cancel_flag.store(true, Ordering::SeqCst);
                false
            }
        }
    }
}

fn print_plan(summary: &PlanSummary) {
    println!();
    println!("=== Summary of Changes ===");
    if summary.to_upload > 0 {
        println!(
            "Files to upload: {} ({})",
            summary.to_upload,
            format_size(summary.upload_bytes)
        );
    }
    if summary.to_delete > 0 {
        println!("Files to delete: {}", summary.to_delete);
    }
    if summary.partial_remote {
        println!("Warning: some remote directories could not be listed; the remote view is incomplete");
    }
    println!();
}

/// 渲染引擎发出的进度事件
async fn render_progress(mut rx: mpsc::UnboundedReceiver<SyncProgress>) {
    let mut out = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            SyncProgress::Analyzing { processed, total } => {
                let pct = processed * 100 / total.max(1);
                print!("\r\x1b[K  Analyzing files... {}/{} ({}%)", processed, total, pct);
            }
            SyncProgress::Analyzed {
                to_upload,
                to_delete,
                upload_bytes,
            } => {
                println!(
                    "\r\x1b[K  ✓ Analysis complete: {} to upload ({}), {} to delete",
                    to_upload,
                    format_size(upload_bytes),
                    to_delete
                );
            }
            SyncProgress::UploadStarted {
                path,
                size,
                index,
                total,
            } => {
                println!(
                    "[{}/{}] Uploading {} ({})",
                    index,
                    total,
                    truncate_path(&path, 50),
                    format_size(size)
                );
            }
            SyncProgress::Uploading {
                size,
                transferred,
                speed,
                eta,
                ..
            } => {
                let pct = if size > 0 {
                    transferred.saturating_mul(100) / size
                } else {
                    100
                };
                print!(
                    "\r\x1b[K    {}% {:.2} MB/s - total remaining {}",
                    pct.min(100),
                    speed / 1000.0 / 1000.0,
                    format_eta(eta)
                );
            }
            SyncProgress::UploadFinished {
                path,
                size,
                duration,
                success,
            } => {
                if success {
                    println!(
                        "\r\x1b[K    ✓ {} ({})",
                        format_size(size),
                        calc_speed(size, duration)
                    );
                } else {
                    println!("\r\x1b[K    ✗ Upload failed: {}", path);
                }
            }
            SyncProgress::Deleted { path, success } => {
                if success {
                    println!("  ✓ Deleted {}", truncate_path(&path, 60));
                } else {
                    println!("  ✗ Failed to delete {}", path);
                }
            }
            SyncProgress::DirectoryDeleted { path, success } => {
                if success {
                    println!("  ✓ Removed empty directory {}", path);
                } else {
                    println!("  ✗ Failed to remove directory {}", path);
                }
            }
        }
        let _ = out.flush();
    }
}

fn print_summary(report: &SyncReport) {
    let s = &report.stats;
    let avg_speed = s
        .average_upload_speed()
        .map(|_| calc_speed(s.bytes_uploaded, s.upload_duration))
        .unwrap_or_else(|| "N/A".to_string());

    println!();
    println!("=== Summary ===");
    println!("Files uploaded: {}", s.files_uploaded);
    println!("Files unchanged: {}", s.files_skipped);
    println!("Files deleted: {}", s.files_deleted);
    if s.files_missing > 0 {
        println!("Files missing/skipped: {}", s.files_missing);
    }
    if s.uploads_failed > 0 || s.deletes_failed > 0 {
        println!(
            "Failed uploads: {}, failed deletes: {}",
            s.uploads_failed, s.deletes_failed
        );
    }
    println!("Directories deleted: {}", s.directories_deleted);
    println!("Total size uploaded: {}", format_size(s.bytes_uploaded));
    println!("Average upload speed: {}", avg_speed);
    println!("Total sync time: {}", format_elapsed(report.sync_elapsed));
    if !report.unreachable_dirs.is_empty() {
        println!(
            "Unreachable remote directories: {}",
            report.unreachable_dirs.join(", ")
        );
    }
}

fn exit_code(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Applied | Outcome::NoChanges => 0,
        Outcome::Declined | Outcome::DryRun => 2,
        Outcome::Cancelled => EXIT_CANCELLED,
    }
}

async fn run(args: Args) -> Result<i32> {
    let mut config = SyncConfig::load(&args.config)?;
    config.apply_overrides(ConfigOverrides {
        src_dir: args.src_dir.clone(),
        api_key: args.api_key.clone(),
        storage_url: args.storage_url.clone(),
        cache_dir: args.cache_dir.clone(),
    });
    config.validate()?;

    let log_path = init_logging(&get_log_dir(), &config.log, args.verbose);
    if let Some(path) = &log_path {
        tracing::debug!("日志文件: {}", path.display());
    }

    let storage = create_storage(&config.storage_url, &config.api_key)?;

    println!("=== bunnysync v{} ===", env!("CARGO_PKG_VERSION"));
    println!("Source: {}", config.source_dir().display());
    println!("Destination: {}", storage.name());
    if args.dry_run {
        println!("Dry run: no changes will be made");
    }
    println!();

    let (tx, rx) = mpsc::unbounded_channel();
    let engine = SyncEngine::new(
        storage,
        &config.resolved_cache_dir(),
        config.sync_options(args.dry_run),
    )?
    .with_progress(tx);

    // Ctrl+C 只设置取消标志，正在进行的单个操作会完成
    let cancel_flag = engine.cancel_flag();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_flag.store(true, Ordering::SeqCst);
            eprintln!("\nCancelling after the current operation...");
        }
    });

    let renderer = tokio::spawn(render_progress(rx));

    let confirm: Box<dyn Confirm> = if args.yes {
        Box::new(AutoConfirm)
    } else {
        Box::new(StdinConfirm {
            cancel_flag: engine.cancel_flag(),
        })
    };
    let result = engine.run(confirm.as_ref()).await;

    // 关闭进度通道，等待渲染结束
    drop(engine);
    let _ = renderer.await;
    signal_task.abort();

    let report = result.context("同步失败")?;

    match report.outcome {
        Outcome::NoChanges => println!("No changes needed - everything is already in sync!"),
        Outcome::Declined => println!("No changes made."),
        Outcome::DryRun => {
            if let Some(summary) = &report.summary {
                print_plan(summary);
            }
            println!("Dry run complete. No changes made.");
        }
        Outcome::Cancelled => {
            println!();
            println!("Sync cancelled by user.");
            print_summary(&report);
        }
        Outcome::Applied => {
            print_summary(&report);
            println!("Sync complete!");
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(exit_code(report.outcome))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
