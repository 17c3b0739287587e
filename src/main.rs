//! USB driver broker - binds and unbinds a managed USB driver on request
//! from unprivileged local clients, gated by administrator filter rules.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usb_broker::commands::ServiceManager;
use usb_broker::config::ConfigLoader;
use usb_broker::filter::FilterPolicy;
use usb_broker::gateway::{DriverOpsGateway, RetryPolicy};
use usb_broker::platform::{SysfsBus, SysfsDriverHost};
use usb_broker::protocol::BrokerClient;
use usb_broker::server::PipeServer;

#[derive(Parser)]
#[command(
    name = "usb-broker",
    about = "Privileged local broker for binding a managed USB driver",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use a specific config file instead of the default search paths.
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the broker as an autostart system service.
    Install,
    /// Unregister the service; fails while it is running.
    Uninstall,
    /// Send install/remove requests to a running broker.
    Request {
        /// Devices as hex vid:pid pairs, e.g. 04b4:0888.
        #[arg(required = true, value_parser = parse_device)]
        devices: Vec<(u16, u16)>,
        /// Install only until this invocation exits.
        #[arg(short = 't', long, conflicts_with = "remove")]
        session: bool,
        /// Remove the managed driver instead of installing it.
        #[arg(short = 'u', long)]
        remove: bool,
    },
}

fn parse_device(value: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = value
        .split_once(':')
        .ok_or_else(|| format!("expected vid:pid, got {value:?}"))?;
    let vid = u16::from_str_radix(vid, 16).map_err(|_| format!("bad vid {vid:?}"))?;
    let pid = u16::from_str_radix(pid, 16).map_err(|_| format!("bad pid {pid:?}"))?;
    Ok((vid, pid))
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn loader(config: Option<PathBuf>) -> ConfigLoader {
    config.map_or_else(ConfigLoader::new, ConfigLoader::with_path)
}

/// Runs the broker in the foreground until SIGINT/SIGTERM.
async fn run_broker(config_path: Option<PathBuf>) -> bool {
    let config = loader(config_path).load_or_default();
    let policy = FilterPolicy::from_config(config.filter_rules.as_deref());
    let gateway = Arc::new(DriverOpsGateway::new(
        Arc::new(SysfsBus::new()),
        Arc::new(SysfsDriverHost::new(config.managed_driver.clone())),
        policy,
        config.managed_driver.clone(),
        RetryPolicy::from(config.retry),
    ));

    let server = PipeServer::new(&config.socket_path, gateway)
        .with_max_connections(config.max_connections);
    let handle = match server.start() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Broker startup failed");
            return false;
        }
    };

    wait_for_signal().await;
    tracing::info!("Shutdown requested, draining connections");
    handle.shutdown().await;
    true
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Sends one request per device; a session install keeps the connection
/// open until the user hits Enter, then lets the disconnect revert the
/// grants.
async fn run_requests(
    config_path: Option<PathBuf>,
    devices: Vec<(u16, u16)>,
    session: bool,
    remove: bool,
) -> bool {
    let config = loader(config_path).load_or_default();
    let mut client = match BrokerClient::connect(&config.socket_path).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("cannot reach broker: {e}");
            return false;
        }
    };

    let mut all_ok = true;
    for (vid, pid) in devices {
        let verb = if remove {
            "Removing"
        } else if session {
            "Installing (session)"
        } else {
            "Installing"
        };
        println!("{verb} {vid:04x}:{pid:04x}...");
        let result = if remove {
            client.remove(vid, pid).await
        } else if session {
            client.session_install(vid, pid).await
        } else {
            client.install(vid, pid).await
        };
        match result {
            Ok(true) => println!("Completed successfully"),
            Ok(false) => {
                println!("Failed");
                all_ok = false;
            }
            Err(e) => {
                eprintln!("request failed: {e}");
                return false;
            }
        }
    }

    if session {
        println!("Hit Enter to terminate session");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    }
    all_ok
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let success = match cli.command {
        None => run_broker(cli.config).await,
        Some(Commands::Install) => match ServiceManager::from_current_exe() {
            Ok(manager) => match manager.install() {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("install failed: {e}");
                    false
                }
            },
            Err(e) => {
                eprintln!("install failed: {e}");
                false
            }
        },
        Some(Commands::Uninstall) => match ServiceManager::from_current_exe() {
            Ok(manager) => match manager.uninstall() {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("uninstall failed: {e}");
                    false
                }
            },
            Err(e) => {
                eprintln!("uninstall failed: {e}");
                false
            }
        },
        Some(Commands::Request {
            devices,
            session,
            remove,
        }) => run_requests(cli.config, devices, session, remove).await,
    };

    if success {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::FAILURE
    }
}
