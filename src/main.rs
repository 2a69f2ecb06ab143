// ABOUTME: Main entry point for the dockhand CLI
// Thin clap front-end over the library: run-and-wait, lifecycle commands, probes, and listing

//! `dockhand` command line: run containers until ready, stop, remove, list and probe them.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dockhand::container::{ContainerHandle, ContainerRunner, PortMapping, RemoveOptions, SignalScope};
use dockhand::engine::{list_containers, tag_image, ExecOptions, ListOptions};
use dockhand::engine::{current_platform, current_platform_arch, ENGINE_ARCHS};
use dockhand::{AppConfig, CommandExecutor, Container, FetchCondition, FetchProbe, ReadinessProber, RunOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(about = "Run containers and wait until they are actually ready")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to ~/.dockhand/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr instead of ~/.dockhand/logs
    #[arg(long, global = true)]
    log_stderr: bool,

    /// Log every engine invocation
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a container, optionally waiting for a log line
    Run(RunArgs),
    /// Stop a container
    Stop {
        id: String,
        /// Seconds to wait before killing
        #[arg(short, long)]
        time: Option<u64>,
    },
    /// Remove a container
    Rm {
        id: String,
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        volumes: bool,
    },
    /// Stop and remove a container, never failing
    Cleanup {
        id: String,
        /// Remove without -f
        #[arg(long)]
        no_force: bool,
    },
    /// Remove any container with this exact name
    EnsureStopped { name: String },
    /// List containers
    Ps {
        /// Only containers created from this image
        #[arg(long)]
        image: Option<String>,
        #[arg(short, long)]
        all: bool,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Poll a URL until it answers
    WaitUrl {
        url: String,
        /// Require this status code
        #[arg(long)]
        status: Option<u16>,
        /// Wait until the URL stops answering instead
        #[arg(long, conflicts_with = "status")]
        gone: bool,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Extra header as NAME:VALUE
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Follow a container's logs until a string appears
    WaitLog {
        id: String,
        signal: String,
        /// Marker printed when a previous instance ended inside the same container
        #[arg(long)]
        end_signal: Option<String>,
        #[arg(long, default_value_t = 30000)]
        timeout_ms: u64,
    },
    /// Tag an image
    Tag {
        source: String,
        target: String,
        /// Attempts before giving up
        #[arg(long, default_value_t = 1)]
        retry: u32,
    },
    /// Print the host platform as the engine names it
    Platform,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    image: String,
    #[arg(long)]
    name: Option<String>,
    /// Port mapping as EXTERNAL:INTERNAL
    #[arg(short, long = "port", value_parser = parse_port)]
    ports: Vec<PortMapping>,
    #[arg(short = 'v', long = "volume")]
    volumes: Vec<String>,
    /// Environment variable as KEY=VALUE
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,
    #[arg(short, long)]
    workdir: Option<String>,
    #[arg(long)]
    network: Option<String>,
    #[arg(long)]
    platform: Option<String>,
    #[arg(long)]
    rm: bool,
    /// Run attached (ignored while waiting for a pattern)
    #[arg(long)]
    no_detach: bool,
    /// Regular expression that marks the container ready
    #[arg(long)]
    wait_for: Option<String>,
    #[arg(long)]
    wait_timeout_ms: Option<u64>,
    /// Echo container output, and keep echoing after readiness
    #[arg(long)]
    show_output: bool,
    /// After readiness, keep following output until the container exits
    #[arg(long, requires = "show_output")]
    follow: bool,
    #[arg(long)]
    no_color: bool,
    /// Remove an existing container with the same name first
    #[arg(long, requires = "name")]
    replace: bool,
    /// Command to run inside the container
    #[arg(last = true)]
    command: Vec<String>,
}

fn parse_port(value: &str) -> std::result::Result<PortMapping, String> {
    let (external, internal) = value
        .split_once(':')
        .ok_or_else(|| format!("expected EXTERNAL:INTERNAL, got {value}"))?;
    let external = external.parse().map_err(|e| format!("bad external port: {e}"))?;
    let internal = internal.parse().map_err(|e| format!("bad internal port: {e}"))?;
    Ok(PortMapping::new(internal, external))
}

fn parse_env(value: &str) -> std::result::Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {value}"))
}

fn parse_header(value: &str) -> std::result::Result<(String, String), String> {
    value
        .split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected NAME:VALUE, got {value}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.log_stderr);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config =
        AppConfig::load_with(cli.config.as_deref(), |key| std::env::var(key).ok()).await?;
    if cli.verbose {
        config.engine.verbose = true;
    }
    let executor: Arc<dyn CommandExecutor> = Arc::new(config.executor());

    match cli.command {
        Command::Run(args) => run(&config, executor, args).await,
        Command::Stop { id, time } => {
            let handle = ContainerHandle::new(id)?;
            let lifecycle = dockhand::ContainerLifecycle::new(executor).with_verbose(config.engine.verbose);
            println!("{}", lifecycle.stop(&handle, time.map(Duration::from_secs)).await?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Rm { id, force, volumes } => {
            let handle = ContainerHandle::new(id)?;
            let options = RemoveOptions { force, volumes };
            println!(
                "{}",
                dockhand::ContainerLifecycle::new(executor)
                    .remove(handle, options)
                    .await?
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Cleanup { id, no_force } => {
            let handle = ContainerHandle::new(id)?;
            dockhand::ContainerLifecycle::new(executor)
                .with_verbose(config.engine.verbose)
                .cleanup(handle, !no_force)
                .await;
            Ok(ExitCode::SUCCESS)
        }
        Command::EnsureStopped { name } => {
            dockhand::ContainerLifecycle::new(executor)
                .ensure_stopped(&name)
                .await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ps {
            image,
            all,
            filter,
            json,
        } => {
            if let Some(image) = image {
                let rows = dockhand::ContainerLifecycle::new(executor).list(&image).await?;
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                let mut options = if all { ListOptions::all() } else { ListOptions::default() };
                if let Some(filter) = filter {
                    options = options.with_filter(filter);
                }
                if json {
                    options = options.as_json();
                }
                println!("{}", list_containers(executor.as_ref(), &options).await?.into_text());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::WaitUrl {
            url,
            status,
            gone,
            method,
            headers,
            timeout_ms,
        } => {
            let condition = match (status, gone) {
                (Some(code), _) => FetchCondition::Status(code),
                (None, true) => FetchCondition::NoResponse,
                (None, false) => FetchCondition::AnyResponse,
            };
            let method = method
                .to_uppercase()
                .parse()
                .map_err(|_| anyhow!("invalid HTTP method: {}", method))?;
            let mut probe = config
                .probe_tuning()
                .apply(FetchProbe::new(url, condition))
                .with_method(method);
            for (name, value) in headers {
                probe = probe.with_header(name, value);
            }
            if let Some(ms) = timeout_ms {
                probe = probe.with_timeout(Duration::from_millis(ms));
            }
            ReadinessProber::new().wait_until_ready(&probe).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::WaitLog {
            id,
            signal,
            end_signal,
            timeout_ms,
        } => {
            let handle = ContainerHandle::new(id)?;
            ContainerRunner::new(executor)
                .wait_for_signal_in_logs(
                    &handle,
                    &signal,
                    Duration::from_millis(timeout_ms),
                    end_signal.as_deref(),
                    config.engine.verbose,
                )
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Tag {
            source,
            target,
            retry,
        } => {
            let options = ExecOptions::new()
                .with_retry_delay(config.retry_delay())
                .with_retry(retry);
            tag_image(executor.as_ref(), &source, &target, &options)
                .await
                .with_context(|| format!("Failed to tag {} as {}", source, target))?;
            println!("{}", target);
            Ok(ExitCode::SUCCESS)
        }
        Command::Platform => {
            println!("platform: {}", current_platform());
            println!("arch dir: {}", current_platform_arch());
            for arch in ENGINE_ARCHS.iter() {
                println!("  {} -> {}/{}", arch.arch_dir, arch.os, arch.arch);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: &AppConfig, executor: Arc<dyn CommandExecutor>, args: RunArgs) -> Result<ExitCode> {
    let mut spec = config.run_spec(args.image);
    spec.name = args.name;
    spec.ports = args.ports;
    spec.volumes = args.volumes;
    spec.env = args.env.into_iter().collect();
    spec.workdir = args.workdir;
    spec.network = args.network;
    spec.platform = args.platform;
    spec.remove_on_exit = args.rm;
    spec.detach = !args.no_detach;
    spec.wait_for = args.wait_for;
    spec.show_output = spec.show_output || args.show_output;
    spec.force_color = spec.force_color && !args.no_color;
    if let Some(ms) = args.wait_timeout_ms {
        spec.wait_timeout = Duration::from_millis(ms);
    }
    if !args.command.is_empty() {
        spec.command = Some(shell_words::join(&args.command));
    }

    let mut container = Container::new(executor, spec);
    if args.replace {
        container.ensure_stopped().await;
    }

    let cancel = CancellationToken::new();
    match container.run(&cancel).await? {
        RunOutcome::Ready { handle, follower } => {
            println!("{}", handle);
            if let Some(follower) = follower {
                if args.follow {
                    info!("Following output of {} until it exits", handle);
                    // The run's scope is gone; without a new one signals would be swallowed
                    let scope = SignalScope::install(&cancel)?;
                    if !follower.follow_until(&scope.token()).await {
                        eprintln!("Stopped following {}", handle);
                        return Ok(ExitCode::from(130));
                    }
                } else {
                    follower.stop().await;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Interrupted { handle } => {
            if let Some(handle) = handle {
                println!("{}", handle);
            }
            eprintln!("Interrupted before the container became ready");
            Ok(ExitCode::from(130))
        }
    }
}

fn setup_logging(log_stderr: bool) {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "dockhand=info".into())
    };

    let file = if log_stderr {
        None
    } else {
        let log_dir = AppConfig::home_dir()
            .map(|dir| dir.join("logs"))
            .unwrap_or_else(|| PathBuf::from(".dockhand/logs"));
        let _ = std::fs::create_dir_all(&log_dir);
        let log_file = log_dir.join(format!(
            "dockhand-{}.log",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        ));
        OpenOptions::new().create(true).append(true).open(log_file).ok()
    };

    match file {
        Some(file) => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(file)
                    .with_ansi(false),
            )
            .with(filter())
            .init(),
        None => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter())
            .init(),
    }
}
