//! mcp-link: serves configured resources and prompts over MCP.
//!
//! Loads the configuration, applies its security section, publishes the
//! configured resources and prompts and answers requests on stdin/stdout or
//! HTTP until EOF, a `shutdown` request, or a termination signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_link::config;
use mcp_link::mcp::server::McpServer;
use mcp_link::security::SecurityPolicy;

/// Serve resources over the Model Context Protocol.
///
/// Reads JSON-RPC requests from stdin and writes replies to stdout, or
/// serves them over HTTP with `--http`. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "mcp-link")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,

    /// Serve HTTP on this address instead of stdin/stdout
    #[arg(long, value_name = "ADDR")]
    http: Option<SocketAddr>,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber. Output goes to stderr so stdout
/// carries protocol traffic only.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nExpected config at: {}", default_path.display());
                }
            }
            return ExitCode::FAILURE;
        }
    };

    init_tracing(get_log_level(args.verbose, args.quiet, &cfg.logging.level));

    info!(version = env!("CARGO_PKG_VERSION"), "Starting mcp-link server");

    let policy = SecurityPolicy::new();
    if let Err(e) = cfg.security.apply(&policy) {
        error!(error = %e, "Invalid security configuration");
        return ExitCode::FAILURE;
    }

    let http_bind = args.http.or(cfg.server.http_bind);
    if cfg.server.require_auth && http_bind.is_none() {
        error!("server.require_auth needs HTTP serving; stdin/stdout carries no credentials");
        return ExitCode::FAILURE;
    }

    let server = McpServer::new(cfg.server.to_server_config());
    for resource in &cfg.resources {
        server.publish_resource(resource.uri.clone(), resource.provider());
    }
    for prompt in &cfg.prompts {
        server.register_template(prompt.template());
    }

    if let Err(e) = server.start(&policy) {
        error!(error = %e, "Refusing to start");
        return ExitCode::FAILURE;
    }

    info!(
        resources = server.resources().len(),
        prompts = server.templates().len(),
        "MCP server ready, waiting for client connection..."
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let result = match http_bind {
        Some(addr) => runtime.block_on(server.run_http(addr, &cfg.server.to_http_config())),
        None => runtime.block_on(server.run_stdio()),
    };
    info!(status = %server.status(), "Final status");

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
