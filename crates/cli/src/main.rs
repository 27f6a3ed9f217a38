use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    nodegate_config::{GatewayConfig, NodegateConfig},
    nodegate_gateway::{GatewayBuilder, persist},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "nodegate", about = "nodegate: peer-to-peer node gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of searching the default locations.
    #[arg(long, global = true, env = "NODEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until interrupted.
    Run {
        /// Address to listen on, e.g. `0.0.0.0:9981`.
        #[arg(long)]
        listen: Option<String>,
        /// Directory holding the known-node list.
        #[arg(long)]
        persist_dir: Option<PathBuf>,
        /// Do not reconnect to known nodes or run discovery.
        #[arg(long)]
        no_bootstrap: bool,
        /// Host advertised to peers instead of the bind host.
        #[arg(long)]
        announce_host: Option<String>,
        /// Peers to connect to once listening. May be repeated.
        #[arg(long = "connect", value_name = "ADDR")]
        connect: Vec<String>,
    },
    /// Print the known nodes stored in a persist directory.
    Nodes {
        #[arg(long)]
        persist_dir: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Config,
}

/// Install the global subscriber. `RUST_LOG` wins over `--log-level`.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let json = cli.json_logs.then(|| fmt::layer().json().with_target(true));
    let text = (!cli.json_logs).then(|| {
        fmt::layer()
            .with_target(false)
            .with_ansi(std::io::stdout().is_terminal())
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<NodegateConfig> {
    match path {
        Some(path) => nodegate_config::load_config(path),
        None => Ok(nodegate_config::discover_and_load()),
    }
}

/// Apply command-line overrides on top of the loaded `[gateway]` section.
fn apply_overrides(
    mut config: GatewayConfig,
    listen: Option<String>,
    persist_dir: Option<PathBuf>,
    no_bootstrap: bool,
    announce_host: Option<String>,
) -> anyhow::Result<GatewayConfig> {
    if let Some(listen) = listen {
        config.listen_address = listen;
    }
    if persist_dir.is_some() {
        config.persist_dir = persist_dir;
    }
    config.no_bootstrap |= no_bootstrap;
    if announce_host.is_some() {
        config.announce_host = announce_host;
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: GatewayConfig, connect: Vec<String>) -> anyhow::Result<()> {
    let gateway = GatewayBuilder::from_config(&config).build().await?;
    info!(address = %gateway.address(), "gateway running");

    for addr in connect {
        match gateway.connect(addr.as_str()).await {
            Ok(()) => info!(peer = %addr, "connected"),
            Err(e) => warn!(peer = %addr, error = %e, "failed to connect"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    gateway.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "nodegate starting");
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            listen,
            persist_dir,
            no_bootstrap,
            announce_host,
            connect,
        } => {
            let gateway = apply_overrides(
                config.gateway,
                listen,
                persist_dir,
                no_bootstrap,
                announce_host,
            )?;
            run(gateway, connect).await
        },
        Commands::Nodes { persist_dir } => {
            let dir = persist_dir.unwrap_or_else(|| config.gateway.persist_dir_or_default());
            for node in persist::load(&dir)? {
                println!("{node}");
            }
            Ok(())
        },
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_repeated_connect() {
        let cli = Cli::try_parse_from([
            "nodegate",
            "run",
            "--listen",
            "0.0.0.0:9981",
            "--connect",
            "10.0.0.1:9981",
            "--connect",
            "10.0.0.2:9981",
            "--no-bootstrap",
        ])
        .unwrap();
        let Commands::Run {
            listen,
            connect,
            no_bootstrap,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(listen.as_deref(), Some("0.0.0.0:9981"));
        assert_eq!(connect, vec!["10.0.0.1:9981", "10.0.0.2:9981"]);
        assert!(no_bootstrap);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["nodegate", "nodes", "--json-logs", "--log-level", "debug"])
            .unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Nodes { persist_dir: None }));
    }

    #[test]
    fn overrides_win_over_config() {
        let base = GatewayConfig::default();
        let config = apply_overrides(
            base,
            Some("127.0.0.1:0".into()),
            Some(PathBuf::from("/tmp/ng")),
            true,
            Some("node.example.org".into()),
        )
        .unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:0");
        assert_eq!(config.persist_dir, Some(PathBuf::from("/tmp/ng")));
        assert!(config.no_bootstrap);
        assert_eq!(config.announce_host.as_deref(), Some("node.example.org"));
    }

    #[test]
    fn overrides_are_validated() {
        let err = apply_overrides(GatewayConfig::default(), Some(" ".into()), None, false, None);
        assert!(err.is_err());
    }

    #[test]
    fn explicit_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodegate.toml");
        std::fs::write(&path, "[gateway]\nlisten_address = \"127.0.0.1:7000\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.gateway.listen_address, "127.0.0.1:7000");
    }
}
