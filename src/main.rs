use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use podjar::{
    ActionOutcome, Config, ConfigFileUpdater, HttpOptions, LoftyTagger, NoopReporter,
    ProgressEvent, ProgressReporter, ReqwestClient, RunSummary, SharedProgressReporter,
    SubscriptionStatus, SyncOptions, SyncServices, sync_all,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static TRASH: Emoji<'_, '_> = Emoji("🗑️  ", "[-] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Keep local copies of podcast subscriptions in sync with their feeds
#[derive(Parser, Debug)]
#[command(name = "podjar")]
#[command(about = "Keep local copies of podcast subscriptions in sync with their feeds")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to podjar/podjar.toml in the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More log output; -v also processes one subscription at a time
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<usize, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<usize, ProgressBar>> {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create_bar(&self, download_id: usize) -> ProgressBar {
        let mut bars = self.bars();

        if let Some(bar) = bars.get(&download_id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(download_id, bar.clone());
        bar
    }

    fn finish_bar(&self, download_id: usize) {
        if let Some(bar) = self.bars().remove(&download_id) {
            bar.finish_and_clear();
        }
    }

    fn line(&self, message: String) {
        let _ = self.multi.println(message);
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::SubscriptionStarted { subscription } => {
                self.main_bar
                    .set_message(format!("{HEADPHONES}{}", subscription.bold()));
            }

            ProgressEvent::FetchingFeed { subscription, url } => {
                self.main_bar.set_message(format!(
                    "{SEARCH}{} • fetching {}",
                    subscription.bold(),
                    url.cyan()
                ));
            }

            ProgressEvent::FeedUnchanged { subscription } => {
                self.line(format!(
                    "{HEADPHONES}{} {}",
                    subscription.bold(),
                    "unchanged".dimmed()
                ));
            }

            ProgressEvent::FeedMoved { subscription, url } => {
                self.line(format!(
                    "{HEADPHONES}{} moved to {}",
                    subscription.bold(),
                    url.cyan()
                ));
            }

            ProgressEvent::UserDeleted {
                subscription,
                episode_title,
                ..
            } => {
                self.line(format!(
                    "  {TRASH}{} • {} {}",
                    subscription.bold(),
                    truncate_title(&episode_title, 40).yellow(),
                    "was deleted, will not download again".dimmed()
                ));
            }

            ProgressEvent::PlanReady {
                subscription,
                to_acquire,
                to_remove,
                unchanged,
            } => {
                self.main_bar.set_message(format!(
                    "{HEADPHONES}{} • {} new, {} to remove, {} kept",
                    subscription.bold().green(),
                    to_acquire.to_string().yellow(),
                    to_remove.to_string().yellow(),
                    unchanged.to_string().cyan()
                ));
            }

            ProgressEvent::EpisodeRemoved {
                episode_title, ..
            } => {
                self.line(format!(
                    "  {TRASH}{}",
                    truncate_title(&episode_title, 40).dimmed()
                ));
            }

            ProgressEvent::RemovalFailed {
                episode_title,
                error,
                ..
            } => {
                self.line(format!(
                    "  {FAILURE}{} - {}",
                    truncate_title(&episode_title, 30).red(),
                    error.red()
                ));
            }

            ProgressEvent::DownloadStarting {
                download_id,
                episode_title,
                episode_index,
                total_to_download,
                content_length,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(0);
                bar.set_message(format!(
                    "[{}/{}] {}",
                    (episode_index + 1).to_string().cyan(),
                    total_to_download.to_string().cyan(),
                    truncate_title(&episode_title, 40)
                ));
            }

            ProgressEvent::DownloadProgress {
                download_id,
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                let bar = self.get_or_create_bar(download_id);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::Finalizing {
                download_id,
                episode_title,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.set_message(format!("{} {}", truncate_title(&episode_title, 40), "finalizing".dimmed()));
            }

            ProgressEvent::HashingCompleted { .. } => {}

            ProgressEvent::DownloadCompleted {
                download_id,
                episode_title,
                bytes_downloaded,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.set_position(bytes_downloaded);
                self.line(format!(
                    "  {SUCCESS}{}",
                    truncate_title(&episode_title, 40).green()
                ));
                self.finish_bar(download_id);
            }

            ProgressEvent::DownloadFailed {
                download_id,
                episode_title,
                error,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.abandon_with_message(format!(
                    "{FAILURE}{} - {}",
                    truncate_title(&episode_title, 30).red(),
                    error.red()
                ));
                self.finish_bar(download_id);
            }

            ProgressEvent::PartialFilesCleanedUp {
                subscription,
                count,
            } => {
                self.line(format!(
                    "{HEADPHONES}{} • removed {} interrupted download(s)",
                    subscription.bold(),
                    count.to_string().yellow()
                ));
            }

            ProgressEvent::SubscriptionCompleted {
                subscription,
                downloaded,
                removed,
                failed,
            } => {
                if downloaded + removed + failed > 0 {
                    self.line(format!(
                        "{HEADPHONES}{} • {} downloaded, {} removed, {} failed",
                        subscription.bold().green(),
                        downloaded.to_string().green(),
                        removed.to_string().yellow(),
                        if failed > 0 {
                            failed.to_string().red().bold()
                        } else {
                            failed.to_string().green()
                        }
                    ));
                }
            }

            ProgressEvent::SubscriptionFailed {
                subscription,
                error,
            } => {
                self.line(format!(
                    "{FAILURE}{} - {}",
                    subscription.bold().red(),
                    error.red()
                ));
            }
        }
    }
}

impl Drop for IndicatifReporter {
    fn drop(&mut self) {
        self.main_bar.finish_and_clear();
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let cut: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("podjar={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.subscriptions {
        let quiet_run = report.episodes.is_empty()
            && report.user_deleted.is_empty()
            && report.warnings.is_empty();
        if quiet_run && !matches!(report.status, SubscriptionStatus::Failed { .. }) {
            continue;
        }

        println!("\n{}", report.title.bold());
        if let SubscriptionStatus::Failed { reason } = &report.status {
            println!("  {}{}", FAILURE, reason.red());
        }
        for episode in report.downloaded() {
            println!("  {}{}", SUCCESS, episode.title.green());
        }
        for episode in report.removed() {
            println!("  {}{}", TRASH, episode.title.dimmed());
        }
        for episode in &report.user_deleted {
            println!(
                "  {}{} {}",
                TRASH,
                episode.title.yellow(),
                "(deleted by you, not downloaded again)".dimmed()
            );
        }
        for episode in report.failed() {
            if let ActionOutcome::Failed { reason } = &episode.outcome {
                println!(
                    "  {}{} - {}",
                    CROSS,
                    episode.title.yellow(),
                    reason.dimmed()
                );
            }
        }
        for warning in &report.warnings {
            println!("  {}{}", CROSS, warning.dimmed());
        }
    }

    let failed_subscriptions = summary
        .subscriptions
        .iter()
        .filter(|s| matches!(s.status, SubscriptionStatus::Failed { .. }))
        .count();

    println!(
        "\n{PARTY}{} {} downloaded, {} removed, {} failed, {} subscription(s) skipped\n",
        "Sync complete:".bold().green(),
        summary.downloaded_count().to_string().green().bold(),
        summary.removed_count().to_string().yellow(),
        if summary.failed_count() > 0 {
            summary.failed_count().to_string().red().bold()
        } else {
            summary.failed_count().to_string().green()
        },
        if failed_subscriptions > 0 {
            failed_subscriptions.to_string().red().bold()
        } else {
            failed_subscriptions.to_string().green()
        }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path().context("Could not determine the user config directory")?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podjar".bold().magenta(),
            "- Podcast Subscriptions".dimmed()
        );
    }

    let client = ReqwestClient::with_options(&HttpOptions {
        user_agent: config.settings.user_agent.clone(),
        timeout: config.settings.timeout,
    })
    .context("Failed to create HTTP client")?;

    let mut options = SyncOptions::from_settings(&config.settings);
    if args.verbose > 0 {
        options.concurrency = 1;
    }

    let reporter: SharedProgressReporter = if args.quiet {
        NoopReporter::shared()
    } else {
        Arc::new(IndicatifReporter::new())
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after in-flight work");
                cancel.cancel();
            }
        }
    });

    let services = SyncServices {
        tagger: Arc::new(LoftyTagger),
        url_updater: Arc::new(ConfigFileUpdater::new(&config.path)),
        reporter,
        cancel,
    };

    info!(
        config = %config.path.display(),
        subscriptions = config.subscriptions.len(),
        "Starting sync"
    );
    let summary = sync_all(&client, &config.subscriptions, &options, &services)
        .await
        .context("Failed to sync subscriptions")?;

    // Clear the progress bars before printing the summary
    drop(services);

    if !args.quiet {
        print_summary(&summary);
    }

    if summary.has_failures() {
        std::process::exit(1);
    }

    Ok(())
}
