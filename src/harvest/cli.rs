//! Command line entry point for Feed Harvester
//! Uses clap for arguments and dialoguer for the interactive login fallback

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::harvest::browser::chromium::{ChromiumDriver, ChromiumOptions};
use crate::harvest::browser::BrowserDriver;
use crate::harvest::discovery::DiscoveryEnd;
use crate::harvest::fetcher::{HttpFetcher, HttpFetcherConfig};
use crate::harvest::logger::Logger;
use crate::harvest::orchestration::{init_pipeline, HarvestRequest, Pipeline, RunReport};
use crate::harvest::session_store::SessionStore;
use crate::harvest::{AppConfig, ConfigManager};

pub const SITE_ROOT: &str = "https://www.instagram.com/";
pub const LOGIN_URL: &str = "https://www.instagram.com/accounts/login/";

/// Download media from a profile feed through a real browser
#[derive(Parser, Debug, Clone)]
#[command(name = "feed_harvester", version, about)]
pub struct Args {
    /// Profile name or profile URL
    pub target: Option<String>,

    /// Number of items to download
    #[arg(short = 'n', long, default_value_t = 50)]
    pub count: usize,

    /// Output directory (defaults to the configured download directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Number of parallel downloads
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Log in interactively before scanning
    #[arg(long)]
    pub login: bool,

    /// Neither load nor save a session
    #[arg(long)]
    pub no_session: bool,

    /// Delete the saved session and exit
    #[arg(long)]
    pub clear_session: bool,

    /// Show the browser window
    #[arg(long)]
    pub show_browser: bool,

    /// Open multi-image posts and download every slide instead of the cover
    #[arg(long)]
    pub carousel: bool,

    /// Minimum time between download starts, in milliseconds
    #[arg(long)]
    pub spacing_ms: Option<u64>,

    /// Attempts per download before giving up
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Do not read or write the collection manifest
    #[arg(long)]
    pub no_manifest: bool,

    /// Directory holding config.toml
    #[arg(long, default_value = "./config")]
    pub config_dir: PathBuf,
}

/// Collection id from a bare profile name or a profile URL.
pub fn parse_target(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let name = match Url::parse(raw) {
        Ok(url) => {
            let host = url.host_str()?;
            if !(host == "instagram.com" || host.ends_with(".instagram.com")) {
                return None;
            }
            url.path_segments()?.find(|s| !s.is_empty())?.to_string()
        }
        Err(_) => raw.trim_matches('/').trim_start_matches('@').to_string(),
    };
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    valid.then_some(name)
}

/// Profile feed URL for a collection id.
pub fn origin_for(collection: &str) -> Result<Url> {
    let root = Url::parse(SITE_ROOT)?;
    Ok(root.join(&format!("{}/", collection))?)
}

/// Fold command line overrides into the loaded config.
pub fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(dir) = &args.output_dir {
        config.paths.download_directory = dir.display().to_string();
    }
    if let Some(concurrency) = args.concurrency {
        config.download.concurrency = concurrency.max(1);
    }
    if let Some(spacing) = args.spacing_ms {
        config.download.spacing_ms = spacing;
    }
    if let Some(attempts) = args.max_attempts {
        config.download.max_attempts = attempts.max(1);
    }
    if args.carousel {
        config.container.expand_containers = true;
    }
}

fn chromium_options(config: &AppConfig, visible: bool) -> ChromiumOptions {
    ChromiumOptions {
        headless: !visible,
        settle_delay: Duration::from_millis(config.scan.settle_delay_ms),
        action_timeout: config.scan.navigation_timeout(),
        ..ChromiumOptions::default()
    }
}

/// Run the harvester with parsed arguments. Returns the process exit code.
pub async fn run_cli(args: Args, config_manager: &ConfigManager, logger: Arc<Logger>) -> Result<i32> {
    let mut config = config_manager.get_app_config()?;
    apply_overrides(&mut config, &args);

    if args.clear_session {
        SessionStore::new(&config.paths.session_file).clear()?;
        println!("{}", style("Saved session cleared").green());
        return Ok(0);
    }

    let collection = args
        .target
        .as_deref()
        .and_then(parse_target)
        .ok_or_else(|| anyhow!("A profile name or profile URL is required"))?;
    let request = HarvestRequest {
        origin: origin_for(&collection)?,
        collection,
        count: args.count,
        output_dir: PathBuf::from(&config.paths.download_directory),
        use_manifest: !args.no_manifest,
    };

    print_banner(&request, &args, &config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let fetcher = HttpFetcher::new(HttpFetcherConfig {
        user_agent: config.download.user_agent.clone(),
        request_timeout: Duration::from_secs(config.download.attempt_timeout_secs),
        ..HttpFetcherConfig::default()
    })?;
    let pipeline = init_pipeline(config.clone(), Arc::new(fetcher), cancel.clone(), logger.clone());

    let mut visible = args.show_browser || args.login;
    let mut driver = ChromiumDriver::launch(chromium_options(&config, visible))
        .await
        .context("Failed to launch Chromium")?;

    let mut has_session = if args.no_session {
        false
    } else {
        pipeline.restore_session(&mut driver).await?
    };

    if args.login {
        has_session = interactive_login(&pipeline, &mut driver, !args.no_session).await? || has_session;
    }

    let mut outcome = pipeline.run(&mut driver, &request, has_session).await;

    if matches!(&outcome, Err(e) if e.is_auth_required()) && console::user_attended() && !cancel.is_cancelled() {
        println!("{}", style("This profile needs a login.").yellow());
        if confirm("Open a browser window and log in now?").await? {
            if !visible {
                driver.close().await;
                driver = ChromiumDriver::launch(chromium_options(&config, true))
                    .await
                    .context("Failed to launch Chromium")?;
                visible = true;
            }
            if interactive_login(&pipeline, &mut driver, !args.no_session).await? {
                info!("Retrying discovery after login");
                outcome = pipeline.run(&mut driver, &request, true).await;
            }
        }
    }
    info!(visible, "Closing browser");
    driver.close().await;

    match outcome {
        Ok(report) => {
            print_summary(&report);
            Ok(report.exit_code())
        }
        Err(e) => {
            logger.log_error("run_failed", &e.to_string());
            error!("Run failed: {}", e);
            eprintln!("{} {}", style("Run failed:").red().bold(), e);
            Ok(if e.is_auth_required() { 2 } else { 1 })
        }
    }
}

/// Let the user log in by hand in a visible window. Returns whether it worked.
async fn interactive_login(pipeline: &Pipeline, driver: &mut ChromiumDriver, persist: bool) -> Result<bool> {
    let login = Url::parse(LOGIN_URL)?;
    driver
        .navigate(&login, pipeline.config().scan.navigation_timeout())
        .await?;

    println!("{}", style("Log in to your account in the browser window.").cyan());
    println!("  - Enter your username and password");
    println!("  - Complete any two-factor prompt");
    println!("  - Wait for the home feed to load");

    if !confirm("Finished logging in?").await? {
        return Ok(false);
    }

    let current = driver.current_url().await?;
    if current.to_lowercase().contains("login") {
        println!("{}", style("Still on the login page, continuing without a session.").yellow());
        return Ok(false);
    }

    if persist {
        pipeline.save_session(driver).await?;
    }
    println!("{}", style("Login detected").green());
    Ok(true)
}

async fn confirm(prompt: &'static str) -> Result<bool> {
    let answer = tokio::task::spawn_blocking(move || {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(true)
            .interact()
    })
    .await??;
    Ok(answer)
}

fn print_banner(request: &HarvestRequest, args: &Args, config: &AppConfig) {
    println!("{}", style("Feed Harvester").bold());
    println!("  Target:  {}", request.collection);
    println!("  Count:   {}", request.count);
    println!("  Browser: {}", if args.show_browser || args.login { "visible" } else { "headless" });
    println!("  Session: {}", if args.no_session { "disabled" } else { "enabled" });
    println!("  Posts:   {}", if config.container.expand_containers { "all slides" } else { "cover only" });
    println!("  Output:  {}", request.output_dir.join(&request.collection).display());
}

fn print_summary(report: &RunReport) {
    println!("{}", style("-".repeat(60)).dim());
    let end = match report.discovery_end {
        DiscoveryEnd::QuotaReached => "requested count reached",
        DiscoveryEnd::Stalled => "end of feed",
        DiscoveryEnd::CeilingReached => "scroll limit reached",
        DiscoveryEnd::Cancelled => "cancelled",
        DiscoveryEnd::DriverFailed => "browser failed, partial result",
    };
    println!("  Discovered: {} ({})", report.discovered, end);
    println!("  Succeeded:  {}", style(report.succeeded).green());
    if report.reused > 0 {
        println!("  Reused:     {}", style(report.reused).cyan());
    }
    if report.failed > 0 {
        println!("  Failed:     {}", style(report.failed).red());
    }
    for failure in &report.container_failures {
        println!("  {} {}: {}", style("Skipped container").yellow(), failure.container_id, failure.reason);
    }
    if let Some(first) = report.files().next() {
        if let Some(dir) = first.parent() {
            println!("  Files in:   {}", dir.display());
        }
    }
}
