//! nat-redirect: install NAT redirects for a transparent proxy
//!
//! Enables the redirect chain, installs the configured redirects, and tears
//! everything down again on Ctrl-C or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./nat-redirect
//!
//! # Run with custom configuration
//! sudo ./nat-redirect -c /path/to/config.json
//!
//! # Remove a chain left behind by a crashed instance
//! sudo ./nat-redirect --teardown
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use nat_redirect::config::{load_config_or_default_with_env, Config};
use nat_redirect::{is_root, Translator};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Only remove the chain and its hooks
    teardown: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/nat-redirect/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut teardown = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "--teardown" => {
                    teardown = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("nat-redirect v{}", nat_redirect::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            teardown,
        }
    }
}

fn print_help() {
    println!(
        r#"nat-redirect v{}

Kernel NAT redirection for transparent proxies.

USAGE:
    nat-redirect [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/nat-redirect/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    --teardown              Remove the chain and its hooks, then exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    NAT_REDIRECT_CHAIN       Override chain name
    NAT_REDIRECT_LOG_LEVEL   Override log level (trace, debug, info, warn, error)
    NAT_REDIRECT_DRY_RUN     Keep rules in memory instead of calling iptables

REQUIREMENTS:
    - iptables with the nat table and REDIRECT target
    - CAP_NET_ADMIN capability (or root)
"#,
        nat_redirect::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) -> Result<()> {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    let result = if config.log.format == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

/// Wait for Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        nat_redirect::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_or_default_with_env(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    init_logging(&config)?;

    if !args.config_path.exists() {
        warn!(
            "Configuration file {:?} not found, using defaults",
            args.config_path
        );
    }

    if !config.dry_run && !is_root() {
        warn!("Not running as root; iptables requires CAP_NET_ADMIN");
    }

    let translator = Translator::from_config(&config)?;

    if args.teardown {
        let report = translator.disable();
        info!("Teardown finished: {report}");
        return Ok(());
    }

    let report = translator.enable();
    info!("Chain {} ready: {report}", translator.chain_name());

    let report = translator.apply_redirects(&config.redirects);
    if !report.is_clean() {
        warn!("Some redirects were not installed: {report}");
    }
    for r in translator.mappings() {
        info!("  {} -> :{}", r.key, r.port);
    }

    shutdown_signal().await;

    let report = translator.disable();
    info!("Shutdown complete: {report}");
    Ok(())
}
