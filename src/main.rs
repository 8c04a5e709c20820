//! PriFi Proxy - CLI Entry Point
//!
//! - `run`: start a session, follow its status, stop cleanly on Ctrl-C
//! - `probe`: check relay reachability only
//! - `check`: validate the configuration and exit

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use prifi_proxy::probe::{ReachabilityProbe, ReachabilityResult, TcpProber};
use prifi_proxy::{launch, ClientConfig, Config, FailureReason, RunState, VERSION};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for the core to confirm a stop on Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "prifi-proxy")]
#[command(version = VERSION)]
#[command(about = "Lifecycle orchestrator for the PriFi anonymity proxy client")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "prifi.yaml", global = true)]
    config: PathBuf,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<CommandKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone)]
enum CommandKind {
    /// Start the client and keep it running until Ctrl-C (default)
    Run,
    /// Probe the relay control and SOCKS ports
    Probe {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and exit
    Check,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .enable_all()
        .thread_name("prifi-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(format: LogFormat, level: Option<&str>) -> anyhow::Result<()> {
    let directive = format!("prifi_proxy={}", level.unwrap_or("info"));
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?);

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json())
            .with(filter)
            .init(),
    }
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load_async(&args.config)
        .await
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    init_logging(args.log_format, config.log_level.as_deref())?;
    info!("PriFi Proxy v{}", VERSION);
    info!("Loaded configuration from: {}", args.config.display());

    match args.command.clone().unwrap_or(CommandKind::Run) {
        CommandKind::Check => {
            info!("Configuration test passed");
            Ok(())
        }
        CommandKind::Probe { json } => probe(&config, json).await,
        CommandKind::Run => run(&config, args.config).await,
    }
}

async fn probe(config: &Config, json: bool) -> anyhow::Result<()> {
    let client = config
        .client
        .as_ref()
        .context("configuration has no client section")?;

    let ports = TcpProber::new()
        .probe(
            &client.relay_host,
            &[client.relay_port, client.socks_port],
            config.probe.timeout(),
        )
        .await;
    let result = ReachabilityResult::from_ports(client, &ports);

    if json {
        let report = serde_json::json!({
            "host": client.relay_host,
            "ports": ports,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in report_lines(client, &ports) {
            println!("{}", line);
        }
        println!("result: {}", result);
    }
    Ok(())
}

fn report_lines(client: &ClientConfig, ports: &HashMap<u16, bool>) -> [String; 2] {
    let verdict = |port: u16| match ports.get(&port) {
        Some(true) => "reachable",
        _ => "unreachable",
    };
    [
        format!("control {} {}", client.control_address(), verdict(client.relay_port)),
        format!("socks   {} {}", client.socks_address(), verdict(client.socks_port)),
    ]
}

async fn run(config: &Config, config_path: PathBuf) -> anyhow::Result<()> {
    let (orchestrator, control) = launch(config, config_path);

    let mut updates = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(status) => match &status.reason {
                    Some(reason) => warn!("Client {} ({})", status.state, reason),
                    None => info!("Client {}", status.state),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Status stream lagged by {} updates", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Err(rejected) = orchestrator.start().await {
        error!("Cannot start client: {}", rejected);
        orchestrator.shutdown().await;
        let _ = control.await;
        std::process::exit(1);
    }

    let mut session = orchestrator.watch();
    let failure = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
        status = session.wait_for(|s| s.state == RunState::Idle) => {
            warn!("Client went idle, exiting");
            status.ok().and_then(|s| s.reason.clone())
        }
    };

    match orchestrator.stop().await {
        Ok(()) => {
            let mut status = orchestrator.watch();
            let confirmed = tokio::time::timeout(
                SHUTDOWN_GRACE,
                status.wait_for(|s| s.state == RunState::Idle),
            )
            .await
            .is_ok();
            if !confirmed {
                warn!("Core did not confirm stop within {:?}", SHUTDOWN_GRACE);
            }
        }
        Err(rejected) => info!("Nothing to stop: {}", rejected),
    }

    orchestrator.shutdown().await;
    let _ = control.await;
    info!("PriFi Proxy stopped");
    session_outcome(failure)
}

/// A session that ended on its own with a reason is a failed run
fn session_outcome(failure: Option<FailureReason>) -> anyhow::Result<()> {
    match failure {
        Some(reason) => anyhow::bail!("client stopped: {}", reason),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_session_exits_with_error() {
        let err = session_outcome(Some(FailureReason::CoreStoppedExternally)).unwrap_err();
        assert_eq!(err.to_string(), "client stopped: CORE_STOPPED_EXTERNALLY");

        let err = session_outcome(Some(FailureReason::CoreStartError("boom".into()))).unwrap_err();
        assert!(err.to_string().contains("CORE_START_ERROR: boom"));
    }

    #[test]
    fn test_clean_session_exits_ok() {
        assert!(session_outcome(None).is_ok());
    }

    #[test]
    fn test_report_names_relay_addresses() {
        let client = ClientConfig::new("relay.example", 9000, 9001);
        let ports = HashMap::from([(9000, true)]);

        assert_eq!(
            report_lines(&client, &ports),
            [
                "control relay.example:9000 reachable".to_string(),
                "socks   relay.example:9001 unreachable".to_string(),
            ]
        );
    }
}
