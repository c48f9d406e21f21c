//! `quadbridge` – robot state-channel bridge
//!
//! 1. `run` (default): streams every configured device to its telemetry
//!    sink and serves the command gateway until **Ctrl-C**, then waits for
//!    every device to release its connections and prints the fleet report.
//!    Runs the **First-Run Wizard** when no config exists yet.
//! 2. `init`: writes a starter `~/.quadbridge/config.toml`.
//! 3. `check`: validates the config and prints the device table.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use quadbridge_gateway::{CommandFacade, GatewayServer};
use quadbridge_middleware::WsTopicChannel;
use quadbridge_runtime::connector::channel_url;
use quadbridge_runtime::{FleetReport, FleetStatus, LiveConnector, StreamSupervisor, TaskOutcome, init_tracing};
use quadbridge_types::SecretToken;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "quadbridge", version)]
#[command(about = "Bridge quadruped robot state to ThingsBoard and expose stand-up/stand-down over HTTP", long_about = None)]
struct Cli {
    /// Config file (default: ~/.quadbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Stream telemetry and serve the gateway until Ctrl-C
    Run,
    /// Write a starter config
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
        /// Skip the prompts and write the defaults
        #[arg(long)]
        defaults: bool,
    },
    /// Validate the config and list the devices
    Check,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Before the runtime: the OTLP exporter must not need one.
    let _tracing = init_tracing("quadbridge");

    print_banner();

    let path = cli.config.unwrap_or_else(config::config_path);
    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => cmd_run(&path),
        Command::Init { force, defaults } => cmd_init(&path, force, defaults),
        Command::Check => cmd_check(&path),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            println!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_run(path: &Path) -> Result<ExitCode, String> {
    let cfg = match config::load_from(path)? {
        Some(cfg) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        None => {
            let mut cfg = run_first_run_wizard(path)?;
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cfg.validate().map_err(|e| format!("Invalid config: {e}"))?;
    if cfg.devices.is_empty() && !cfg.gateway.enabled {
        return Err("nothing to do: no devices and the gateway is disabled".to_string());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {e}"))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Shutdown requested – releasing device connections …".yellow().bold());
        on_signal.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; stop the process with SIGKILL");
    }

    println!(
        "  Streaming {} device(s) every {}s; press {} to stop.\n",
        cfg.devices.len(),
        cfg.publish_interval_secs,
        "Ctrl-C".bold()
    );
    let report = runtime.block_on(serve(&cfg, cancel));
    print_report(&report);

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Run the fleet and the gateway until `cancel` fires.
async fn serve(cfg: &Config, cancel: CancellationToken) -> FleetReport {
    let status = FleetStatus::new();

    let gateway = cfg.gateway.enabled.then(|| {
        let channel = Arc::new(WsTopicChannel::new(channel_url(&cfg.gateway.target)));
        let server = GatewayServer::new(Arc::new(CommandFacade::new(channel)), status.clone())
            .with_port(cfg.gateway.port)
            .with_status_timeout(cfg.status_timeout());
        println!(
            "  Gateway listening on {}",
            format!("http://localhost:{}", server.port()).bold()
        );
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!(error = %e, "gateway stopped");
            }
        })
    });

    let supervisor = StreamSupervisor::new(LiveConnector::new(&cfg.sink_host), cfg.stream_settings())
        .with_policy(cfg.restart_policy())
        .with_status(status);
    let report = supervisor.run(&cfg.device_descriptors(), cancel.clone()).await;

    if let Some(gateway) = gateway {
        if !cancel.is_cancelled() {
            info!("every device has stopped; gateway keeps serving until Ctrl-C");
        }
        cancel.cancelled().await;
        if let Err(e) = gateway.await {
            error!(error = %e, "gateway task ended abnormally");
        }
    }
    report
}

fn print_report(report: &FleetReport) {
    println!();
    println!("  {}", "Fleet report".bold());
    for device in &report.devices {
        let outcome = match &device.outcome {
            TaskOutcome::Cancelled => "stopped".green().to_string(),
            TaskOutcome::Failed { error } => format!("{} ({})", "failed".red().bold(), error),
        };
        println!(
            "    {:<24} {}  published={} missed={} restarts={}",
            device.id.bold(),
            outcome,
            device.published,
            device.missed,
            device.restarts
        );
    }
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// init / check
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_init(path: &Path, force: bool, defaults: bool) -> Result<ExitCode, String> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        ));
    }
    if defaults {
        save(&Config::starter(config::DEFAULT_ROBOT_TARGET), path)?;
    } else {
        run_first_run_wizard(path)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_check(path: &Path) -> Result<ExitCode, String> {
    let cfg = config::load_from(path)?
        .ok_or_else(|| format!("No config at {}; run `quadbridge init`", path.display()))?;
    cfg.validate().map_err(|e| format!("Invalid config: {e}"))?;

    println!("  {} {}", "✓".green().bold(), path.display().to_string().bold());
    println!(
        "  sink {} every {}s on {} (sample timeout {}s)",
        cfg.sink_host.bold(),
        cfg.publish_interval_secs,
        cfg.sink_channel,
        cfg.sample_timeout_secs
    );
    if cfg.gateway.enabled {
        println!(
            "  gateway :{} → {}",
            cfg.gateway.port,
            channel_url(&cfg.gateway.target)
        );
    } else {
        println!("  gateway {}", "disabled".dimmed());
    }
    println!();
    for device in &cfg.devices {
        let token = if device.sink_token.is_empty() {
            "no token".yellow().to_string()
        } else {
            "token set".green().to_string()
        };
        println!(
            "    {:<24} {:<12} {:<16} {}  {}",
            device.id.bold(),
            device.kind.to_string(),
            device.topic,
            channel_url(&device.target).dimmed(),
            token
        );
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard(path: &Path) -> Result<Config, String> {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║     QuadBridge First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up the bridge.\n");

    let target = prompt_line(
        &format!("  Robot address [{}]: ", config::DEFAULT_ROBOT_TARGET),
        config::DEFAULT_ROBOT_TARGET,
    );
    let mut cfg = Config::starter(&target);

    cfg.sink_host = prompt_line(&format!("  ThingsBoard host [{}]: ", cfg.sink_host), &cfg.sink_host);

    let interval = prompt_line(
        &format!("  Publish interval in seconds [{}]: ", cfg.publish_interval_secs),
        &cfg.publish_interval_secs.to_string(),
    );
    if let Ok(secs) = interval.parse::<u64>()
        && secs > 0
    {
        cfg.publish_interval_secs = secs;
    }

    let port = prompt_line(
        &format!("  Gateway HTTP port [{}]: ", cfg.gateway.port),
        &cfg.gateway.port.to_string(),
    );
    if let Ok(p) = port.parse::<u16>() {
        cfg.gateway.port = p;
    }

    println!("\n  One ThingsBoard device per telemetry kind.  Paste each access token:");
    for device in &mut cfg.devices {
        let placeholder = device.sink_token.expose().to_string();
        let token = prompt_line(&format!("    {} [{}]: ", device.id, placeholder), &placeholder);
        device.sink_token = SecretToken::new(token);
    }

    save(&cfg, path)?;
    Ok(cfg)
}

fn save(cfg: &Config, path: &Path) -> Result<(), String> {
    config::save_to(cfg, path)?;
    println!(
        "\n  {} Config saved to {}\n",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____                  ______       _     __        "#.bold().cyan());
    println!("{}", r#"  / __ \__ _____ ____ _/ / __ )____(_)___/ /__ ____ "#.bold().cyan());
    println!("{}", r#" / /_/ / // / _ `/ _ `/ / __  / __/ / _  / _ `/ -_)"#.bold().cyan());
    println!("{}", r#" \___\_\_,_/\_,_/\_,_/_/_/ /_/_/ /_/\_,_/\_, /\__/ "#.bold().cyan());
    println!("{}", r#"                                       /___/       "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "QuadBridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot state-channel bridge");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
