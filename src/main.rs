//! probectl - remote control of network measurement tests

use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use probectl::client::{RemoteOutcome, connect_control, run_remote_test};
use probectl::config::{Config, SslConfig};
use probectl::module::{Registry, TestModule};
use probectl::net::{AddressFamily, resolve_destination};
use probectl::serve::{ControlServer, Daemon, serve_test};
use probectl::sockopt::SocketConfig;
use probectl::tls::SecureContext;

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("probectl={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    if let Some(file_path) = log_file {
        let expanded_path = match file_path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(file_path)),
            None => PathBuf::from(file_path),
        };

        if let Some(parent) = expanded_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_appender = tracing_appender::rolling::daily(
            expanded_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
            expanded_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("probectl.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep guard alive for the duration of the program
        std::mem::forget(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "probectl")]
#[command(author, version, about = "Run network measurement tests on remote hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log file path (e.g., "~/.config/probectl/probectl.log")
    #[arg(long, global = true, env = "PROBECTL_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "PROBECTL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Configuration file (default: ~/.config/probectl/config.toml)
    #[arg(long, global = true, env = "PROBECTL_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    sockets: SocketArgs,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Args, Debug, Clone, Default)]
struct SocketArgs {
    /// Source IPv4 address
    #[arg(long, global = true)]
    source_v4: Option<Ipv4Addr>,

    /// Source IPv6 address
    #[arg(long, global = true)]
    source_v6: Option<Ipv6Addr>,

    /// Network interface to bind sockets to
    #[arg(short = 'I', long, global = true)]
    device: Option<String>,

    /// DSCP value for control traffic
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(0..64))]
    dscp: Option<u8>,
}

#[derive(Args, Debug, Clone, Default)]
struct TlsArgs {
    /// CA certificate (PEM) that signs both ends
    #[arg(long, global = true, env = "PROBECTL_CACERT")]
    cacert: Option<PathBuf>,

    /// Certificate (PEM) presented to the peer
    #[arg(long, global = true, env = "PROBECTL_CERT")]
    cert: Option<PathBuf>,

    /// Private key (PEM) for the certificate
    #[arg(long, global = true, env = "PROBECTL_KEY")]
    key: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a remote control daemon to run a test and print the result
    Run {
        /// Test name or id
        test: String,

        /// Host running the control daemon
        host: String,

        /// Targets for the remote test
        targets: Vec<String>,

        /// Parameters passed to the test
        #[arg(long, allow_hyphen_values = true)]
        params: Option<String>,

        /// Control daemon port
        #[arg(short, long)]
        port: Option<u16>,

        /// Use IPv4 only
        #[arg(short = '4', long, conflicts_with = "ipv6")]
        ipv4: bool,

        /// Use IPv6 only
        #[arg(short = '6', long)]
        ipv6: bool,
    },

    /// Wait for one control connection and serve a single test
    Serve {
        /// Test name or id
        test: String,

        /// First control port to try
        #[arg(short, long)]
        port: Option<u16>,

        /// Last control port to try
        #[arg(long)]
        port_max: Option<u16>,

        /// How long to wait for the control connection
        #[arg(long, value_parser = parse_duration)]
        max_wait: Option<Duration>,

        /// Parameters passed to the test server
        #[arg(long, allow_hyphen_values = true)]
        params: Option<String>,
    },

    /// Accept control connections and run requested tests
    Daemon {
        /// Control daemon port
        #[arg(short, long)]
        port: Option<u16>,

        /// Exit after one connection
        #[arg(long)]
        one_off: bool,
    },

    /// List available tests
    List,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn find_module(registry: &Registry, test: &str) -> Result<Arc<dyn TestModule>> {
    registry
        .by_name(test)
        .or_else(|| test.parse().ok().and_then(|id| registry.by_id(id)))
        .ok_or_else(|| anyhow!("Unknown test: {}", test))
}

/// Socket configuration from the config file, overridden by flags
fn socket_config(file_config: &Config, args: &SocketArgs) -> SocketConfig {
    let mut defaults = file_config.sockets.clone();
    if args.source_v4.is_some() || args.source_v6.is_some() {
        defaults.source_v4 = args.source_v4;
        defaults.source_v6 = args.source_v6;
    }
    if args.device.is_some() {
        defaults.device = args.device.clone();
    }
    if args.dscp.is_some() {
        defaults.dscp = args.dscp;
    }
    defaults.socket_config()
}

fn secure_context(file_config: &Config, args: &TlsArgs) -> Result<Option<SecureContext>> {
    let ssl = SslConfig {
        cacert: args.cacert.clone().or_else(|| file_config.ssl.cacert.clone()),
        cert: args.cert.clone().or_else(|| file_config.ssl.cert.clone()),
        key: args.key.clone().or_else(|| file_config.ssl.key.clone()),
    };
    let context = SecureContext::from_config(&ssl).context("Failed to load TLS material")?;
    if context.is_some() {
        info!("TLS enabled");
    }
    Ok(context)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_default(),
    };

    let log_file = cli.log_file.as_ref().or(file_config.log_file.as_ref());
    let log_level = cli.log_level.as_ref().or(file_config.log_level.as_ref());
    init_logging(log_file.map(|s| s.as_str()), log_level.map(|s| s.as_str()))?;

    let registry = Registry::builtin();

    match cli.command {
        Commands::List => {
            for module in registry.list() {
                println!("{:>4}  {}", module.id(), module.name());
            }
        }

        Commands::Run {
            test,
            host,
            targets,
            params,
            port,
            ipv4,
            ipv6,
        } => {
            let module = find_module(&registry, &test)?;
            let context = secure_context(&file_config, &cli.tls)?;
            let config = socket_config(&file_config, &cli.sockets);
            let port = port.unwrap_or(file_config.control.daemon_port());
            let family = if ipv4 {
                AddressFamily::V4Only
            } else if ipv6 {
                AddressFamily::V6Only
            } else {
                AddressFamily::Any
            };

            let destinations = resolve_destination(&host, port, family)?;
            let destination = destinations
                .first()
                .ok_or_else(|| anyhow!("Could not resolve host: {}", host))?;

            let mut session = connect_control(
                destination,
                port,
                &config,
                context.as_ref(),
                file_config.control.retry_policy(),
            )
            .await?;

            let outcome =
                run_remote_test(&mut session, module.as_ref(), params.as_deref(), &targets)
                    .await?;
            session.close().await;

            match outcome {
                RemoteOutcome::Printed => {}
                RemoteOutcome::Failed { code, message }
                | RemoteOutcome::Rejected { code, message } => {
                    eprintln!("Remote test failed: {} {}", code, message);
                    std::process::exit(1);
                }
                RemoteOutcome::Unexpected(kind) => {
                    eprintln!("Remote test failed: unexpected {} message", kind);
                    std::process::exit(1);
                }
            }
        }

        Commands::Serve {
            test,
            port,
            port_max,
            max_wait,
            params,
        } => {
            let module = find_module(&registry, &test)?;
            let mut server = module
                .server(params.as_deref())
                .ok_or_else(|| anyhow!("{} has no server component", module.name()))?;
            let context = secure_context(&file_config, &cli.tls)?;
            let mut config = socket_config(&file_config, &cli.sockets);

            let (default_first, default_last) = file_config.control.control_ports();
            let first = port.unwrap_or(default_first);
            let last = port_max.unwrap_or(default_last).max(first);
            let max_wait = max_wait.unwrap_or(file_config.control.max_wait());

            let control = ControlServer::bind(first, last, &config)?;

            // The initiator reads the control port from our stdout
            let mut stdout = std::io::stdout();
            writeln!(stdout, "port: {}", control.port())?;
            stdout.flush()?;

            let mut session = control
                .accept(&mut config, context.as_ref(), max_wait)
                .await?;
            serve_test(&mut session, server.as_mut(), &config).await?;
            session.close().await;
        }

        Commands::Daemon { port, one_off } => {
            let context = secure_context(&file_config, &cli.tls)?;
            let config = socket_config(&file_config, &cli.sockets);
            let port = port.unwrap_or(file_config.control.daemon_port());

            let daemon = Daemon::new(registry, context, config).one_off(one_off);
            tokio::select! {
                result = daemon.run(port) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
        }
    }

    Ok(())
}
