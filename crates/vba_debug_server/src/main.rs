use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vba_bridge_core::{DebugConfig, ExportDirTarget, MemoryTarget, TargetHandle};
use vba_debug_server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "vba_debug_server", version, about = "Debug adapter for VBA code in an automation host")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "VBA_DEBUG_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "VBA_DEBUG_PORT", default_value_t = 5678)]
    port: u16,

    /// Serve a single client over stdin/stdout instead of TCP
    #[arg(long)]
    stdio: bool,

    /// Directory of exported modules (.bas, .cls, .frm); breakpoints edit these files
    #[arg(long, env = "VBA_DEBUG_MODULES", value_name = "DIR")]
    modules: Option<PathBuf>,

    /// Debug an in-memory copy of the modules, leaving the files untouched
    #[arg(long)]
    in_memory: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout carries protocol traffic in --stdio mode.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let server_config = ServerConfig {
        bind: format!("{}:{}", cli.host, cli.port),
        stdio: cli.stdio,
        modules_dir: cli.modules,
        in_memory: cli.in_memory,
    };
    let config = DebugConfig::from_env();
    let target = match &server_config.modules_dir {
        Some(dir) if !server_config.in_memory => {
            info!(dir = %dir.display(), "Debugging exported modules in place");
            let root = dir.clone();
            TargetHandle::spawn("export", move || ExportDirTarget::new(root))
        }
        dir => {
            let memory = match dir {
                Some(dir) => MemoryTarget::new()
                    .load_dir(dir)
                    .with_context(|| format!("loading modules from {}", dir.display()))?,
                None => {
                    warn!("No --modules directory given; the target starts empty");
                    MemoryTarget::new()
                }
            };
            TargetHandle::spawn("memory", move || memory)
        }
    };
    let target = Arc::new(target.context("starting the automation bridge")?);
    let server = Arc::new(Server::new(target.clone(), config.clone()));

    let serve = async {
        if server_config.stdio {
            server.serve_stdio().await;
            Ok(())
        } else {
            let listener = TcpListener::bind(&server_config.bind)
                .await
                .with_context(|| format!("binding {}", server_config.bind))?;
            server.clone().serve_tcp(listener).await.context("accepting clients")
        }
    };

    let outcome = tokio::select! {
        result = serve => result,
        signal = tokio::signal::ctrl_c() => {
            info!("Interrupted, restoring breakpoint lines");
            signal.context("waiting for Ctrl-C")
        }
    };

    let report = target.shutdown(&config).await;
    if report.is_clean() {
        info!(%report, "Shutdown complete");
    } else {
        error!(%report, "Some breakpoint lines could not be restored");
    }
    outcome
}
