// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use vidrelay::config::{self, Config};
use vidrelay::format::{format_duration, format_size};
use vidrelay::sink::{LineSink, Sink, TerminalSink};
use vidrelay::{
    extract_urls, is_valid_url, logging, ArtifactInfo, DownloadSession, FetchError, RegistryError, SessionHandle,
    SessionRegistry, UserKey,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often `relay` sweeps for stale sessions.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Data error - bad URL or media over the size cap
    pub const DATA_ERR: i32 = 65;
    /// I/O error - download directory or output copy failed
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
    /// Interrupted by Ctrl+C
    pub const INTERRUPTED: i32 = 130;
}

use exit_codes::*;

#[derive(Parser)]
#[command(name = "vidrelay")]
#[command(version = VERSION)]
#[command(about = "Download videos from links with live progress, one session per user.")]
#[command(long_about = "vidrelay - per-user video downloads with live progress\n\n\
    Download one link:   vidrelay fetch https://example.com/watch?v=...\n\
    Relay chat lines:    printf 'alice https://...\\n' | vidrelay relay\n\
    Check links:         vidrelay check https://... --probe\n\
    Configure:           vidrelay config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $VIDRELAY_CONFIG or ~/.vidrelay/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode: only warnings and errors in the log
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one link, showing progress in the terminal
    ///
    /// Example:
    ///   vidrelay fetch https://vimeo.com/123456789 --output ~/Videos
    Fetch {
        /// Link to the video page or file
        url: String,

        /// Session key (one download per key at a time)
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Directory the finished video is copied into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Read `<user> <message>` lines from stdin and download every link
    ///
    /// Example:
    ///   printf 'alice see https://a.example/v.mp4\n' | vidrelay relay
    Relay {
        /// Directory finished videos are copied into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Validate links without downloading
    ///
    /// Example:
    ///   vidrelay check https://a.example/v.mp4 --probe
    Check {
        /// Links to check
        #[arg(required = true)]
        urls: Vec<String>,

        /// Also ask the backend for title, duration, and size
        #[arg(long)]
        probe: bool,
    },

    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration (file plus environment)
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let command = match cli.command {
        Commands::Config { command } => return config_command(command, cli.config.as_deref()),
        other => other,
    };

    let config = match config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            eprintln!("    Check the file with: vidrelay config show");
            return Ok(CONFIG);
        }
    };

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        config.log_level.as_str()
    };
    logging::init_logging(level);

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || on_interrupt.cancel()) {
        tracing::warn!("Ctrl+C handler not installed: {}", e);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async move {
        match command {
            Commands::Fetch { url, user, output } => fetch_command(&config, &url, &user, &output, shutdown).await,
            Commands::Relay { output } => relay_command(&config, &output, shutdown).await,
            Commands::Check { urls, probe } => check_command(&config, &urls, probe, &shutdown).await,
            Commands::Config { .. } => Ok(USAGE),
        }
    })
}

fn exit_code_for(err: &FetchError) -> i32 {
    match err {
        FetchError::InvalidUrl | FetchError::TooLarge { .. } => DATA_ERR,
        FetchError::NotFound(_) => ERROR,
        FetchError::Network(_) => TEMP_FAIL,
        FetchError::Cancelled => INTERRUPTED,
        FetchError::Storage(_) => IO_ERR,
    }
}

fn registry_for(config: &Config) -> SessionRegistry {
    SessionRegistry::new(config.build_backend(), config.session_settings())
}

/// Copy the artifact into `dir`, recording the upload on the session.
async fn deliver(session: &DownloadSession, artifact: &ArtifactInfo, dir: &Path) -> Result<PathBuf> {
    session.begin_upload();
    let target = dir.join(&artifact.file_name);

    let copied = async {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        tokio::fs::copy(&artifact.path, &target)
            .await
            .with_context(|| format!("Failed to copy to {}", target.display()))?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    session.finish_upload(copied.is_ok());
    copied.map(|_| target)
}

async fn fetch_command(
    config: &Config,
    url: &str,
    user: &str,
    output: &Path,
    shutdown: CancellationToken,
) -> Result<i32> {
    if !is_valid_url(url) {
        eprintln!("{}", FetchError::InvalidUrl.report());
        return Ok(DATA_ERR);
    }

    let registry = registry_for(config);
    let sink = Arc::new(TerminalSink::new());
    let mut handle = registry.start(user, url, sink.clone())?;
    let key = handle.user_key().clone();

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = shutdown.cancelled() => {
            registry.stop(&key).await;
            handle.wait().await
        }
    };

    let code = match outcome {
        Ok(artifact) => {
            sink.clear();
            let duration = artifact.duration_secs.map(|d| format!(", {}", format_duration(Some(d))));
            println!(
                "{} {} ({}{})",
                "[OK]".green(),
                artifact.title.as_deref().unwrap_or(&artifact.file_name),
                format_size(artifact.size_bytes),
                duration.unwrap_or_default()
            );
            let delivered = tokio::select! {
                delivered = deliver(handle.session(), &artifact, output) => Some(delivered),
                _ = shutdown.cancelled() => None,
            };
            match delivered {
                Some(Ok(path)) => {
                    println!("     Saved to {}", path.display().to_string().bold());
                    SUCCESS
                }
                Some(Err(e)) => {
                    eprintln!("{} {:#}", "[✗]".red(), e);
                    IO_ERR
                }
                None => {
                    handle.session().finish_upload(false);
                    println!("{} Copy to {} interrupted", "[!]".yellow(), output.display());
                    INTERRUPTED
                }
            }
        }
        Err(FetchError::Cancelled) => {
            sink.clear();
            println!("{} {}", "[!]".yellow(), FetchError::Cancelled.user_message());
            INTERRUPTED
        }
        Err(e) => {
            sink.clear();
            eprintln!("{}", e.report());
            exit_code_for(&e)
        }
    };

    handle.finish().await;
    Ok(code)
}

async fn relay_command(config: &Config, output: &Path, shutdown: CancellationToken) -> Result<i32> {
    let registry = registry_for(config);
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut reaper = tokio::time::interval(REAPER_INTERVAL);

    tracing::info!(backend = registry.backend().name(), "relay started, reading stdin");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = reaper.tick() => {
                let reaped = registry.stop_stale(config.session_timeout()).await;
                if reaped > 0 {
                    tracing::warn!("reaped {} stale session(s)", reaped);
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("relay task failed: {}", e);
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => relay_line(&registry, &line, output, &mut tasks),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("stdin read failed: {}", e);
                    break;
                }
            },
        }
    }

    tokio::select! {
        _ = async { while tasks.join_next().await.is_some() {} } => {}
        _ = shutdown.cancelled() => {
            let stopped = registry.stop_all().await;
            tracing::info!("stopped {} session(s) on interrupt", stopped);
        }
    }
    while tasks.join_next().await.is_some() {}

    Ok(if shutdown.is_cancelled() { INTERRUPTED } else { SUCCESS })
}

/// Start a session for every link in one `<user> <message>` line.
fn relay_line(registry: &SessionRegistry, line: &str, output: &Path, tasks: &mut JoinSet<()>) {
    let line = line.trim();
    let (user, text) = match line.split_once(char::is_whitespace) {
        Some((user, text)) => (user, text.trim()),
        None => return,
    };
    let user_key = UserKey::from(user);
    let sink = Arc::new(LineSink::new(user));

    let urls = extract_urls(text);
    if urls.is_empty() {
        if text.contains("http") {
            println!("[{}] {}", user_key, FetchError::InvalidUrl.user_message());
        }
        return;
    }

    for url in urls {
        match registry.start(user_key.clone(), url, sink.clone()) {
            Ok(handle) => {
                let output = output.to_path_buf();
                let sink = sink.clone();
                tasks.spawn(relay_session(handle, sink, output));
            }
            Err(e @ RegistryError::AlreadyActive { .. }) => {
                println!("[{}] {}", user_key, e.user_message().replace('\n', " "));
            }
        }
    }
}

async fn relay_session(mut handle: SessionHandle, sink: Arc<LineSink>, output: PathBuf) {
    let status = match handle.wait().await {
        Ok(artifact) => match deliver(handle.session(), &artifact, &output).await {
            Ok(path) => format!("✅ {} ({:.2} MB) -> {}", artifact.file_name, artifact.size_mb(), path.display()),
            Err(e) => {
                tracing::error!(user = %handle.user_key(), "delivery failed: {:#}", e);
                FetchError::Storage(e.to_string()).user_message()
            }
        },
        Err(e) => e.user_message(),
    };

    if let Err(e) = sink.publish(&status).await {
        tracing::warn!("status publish failed: {}", e);
    }
    handle.finish().await;
}

async fn check_command(config: &Config, urls: &[String], probe: bool, shutdown: &CancellationToken) -> Result<i32> {
    let backend = config.build_backend();
    let limit = config.max_file_size;
    let mut code = SUCCESS;

    for url in urls {
        if !is_valid_url(url) {
            println!("{} {}  {}", "[✗]".red(), url, "invalid".red());
            code = DATA_ERR;
            continue;
        }
        if !probe {
            println!("{} {}", "[OK]".green(), url);
            continue;
        }

        let probed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                println!("{} {}  {}", "[!]".yellow(), url, "interrupted".yellow());
                return Ok(INTERRUPTED);
            }
            probed = backend.probe(url) => probed,
        };

        match probed {
            Ok(info) => {
                let size = info.estimated_size.map(format_size).unwrap_or_else(|| "unknown size".into());
                let over = info.estimated_size.map(|s| s > limit).unwrap_or(false);
                let tag = if over { "[!]".yellow() } else { "[OK]".green() };
                println!("{} {}", tag, url);
                println!("     {}", info.title.as_deref().unwrap_or("(untitled)").bold());
                println!("     {} · {}", format_duration(info.duration_secs), size);
                if over {
                    println!("     {}", FetchError::TooLarge { size: info.estimated_size.unwrap_or(0), limit });
                    code = DATA_ERR;
                }
            }
            Err(e) => {
                println!("{} {}  {}", "[✗]".red(), url, e);
                if code == SUCCESS {
                    code = exit_code_for(&e);
                }
            }
        }
    }
    Ok(code)
}

fn config_command(command: ConfigCommands, explicit: Option<&Path>) -> Result<i32> {
    match command {
        ConfigCommands::Show => {
            let config = match config::load_config(explicit) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{} {:#}", "[✗]".red(), e);
                    return Ok(CONFIG);
                }
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(SUCCESS)
        }
        ConfigCommands::Path => {
            println!("{}", config::config_path(explicit)?.display());
            Ok(SUCCESS)
        }
        ConfigCommands::Init { force } => {
            let path = config::config_path(explicit)?;
            if path.exists() && !force {
                eprintln!("{} {} already exists (use --force to overwrite)", "[!]".yellow(), path.display());
                return Ok(USAGE);
            }
            config::save_config(&Config::default(), &path)?;
            println!("{} Wrote {}", "[OK]".green(), path.display());
            Ok(SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> Config {
        Config {
            ytdlp_bin: "/nonexistent/yt-dlp-binary".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_check_without_probe_ignores_interrupt() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let urls = vec!["https://good.example/v.mp4".to_string()];
        assert_eq!(check_command(&offline_config(), &urls, false, &shutdown).await.unwrap(), SUCCESS);
    }

    #[tokio::test]
    async fn test_check_probe_stops_on_interrupt() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let urls = vec!["https://good.example/v.mp4".to_string()];
        assert_eq!(check_command(&offline_config(), &urls, true, &shutdown).await.unwrap(), INTERRUPTED);
    }

    #[test]
    fn test_exit_codes_for_fetch_errors() {
        assert_eq!(exit_code_for(&FetchError::InvalidUrl), DATA_ERR);
        assert_eq!(exit_code_for(&FetchError::Network("reset".into())), TEMP_FAIL);
        assert_eq!(exit_code_for(&FetchError::Cancelled), INTERRUPTED);
    }
}
