//! jupyter-session CLI
//!
//! Connects to a running Jupyter kernel, checks its heartbeat and prints the
//! HTML rendering of everything it publishes on IOPub.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jupyter_session::runtime::{self, RuntimeWatcher};
use jupyter_session::{
    ConnectionInfo, DisplayCallbacks, DisplayDispatch, KernelSession, PreformattedMarkup,
    SessionOptions,
};

#[derive(Parser)]
#[command(name = "jupyter-session")]
#[command(about = "Attach to a running Jupyter kernel and render its output", long_about = None)]
struct Args {
    /// Path to the kernel connection file
    #[arg(short = 'f', long = "connection-file")]
    connection_file: Option<PathBuf>,

    /// Runtime directory searched for the newest kernel-*.json when no file is given
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Do not open the shell channel or send kernel_info_request
    #[arg(long)]
    no_handshake: bool,

    /// Wait for a kernel to start when the runtime directory has none
    #[arg(long)]
    wait: bool,

    /// Heartbeat timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    heartbeat_timeout_ms: u64,

    /// Per-channel connect timeout in milliseconds
    #[arg(long, default_value_t = 10000)]
    connect_timeout_ms: u64,

    /// Check the heartbeat once and exit
    #[arg(long)]
    probe_only: bool,
}

/// Writes rendered output to stdout, one fragment per line
struct StdoutSink;

impl DisplayCallbacks for StdoutSink {
    fn execute(&mut self, code: &str) {
        println!("<script type='text/javascript'>{}</script>", code);
    }

    fn result(&mut self, html: &str) {
        println!("{}", html);
    }

    fn trace(&mut self, html: &str) {
        println!("{}", html);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("jupyter-session v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let connection_file = match args.connection_file {
        Some(path) => path,
        None => find_connection_file(args.runtime_dir, args.wait).await?,
    };

    tracing::info!("Loading connection file: {}", connection_file.display());
    let connection = ConnectionInfo::from_file(&connection_file)
        .with_context(|| format!("Failed to load {}", connection_file.display()))?;

    let mut options = SessionOptions::default()
        .with_heartbeat_timeout(Some(Duration::from_millis(args.heartbeat_timeout_ms)))
        .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms));
    if args.no_handshake {
        options = options.without_shell();
    }

    let mut session = KernelSession::connect(connection, options)
        .await
        .context("Failed to connect to kernel")?;

    let mut alive = false;
    session.check_health(|ok| alive = ok).await?;
    if args.probe_only {
        println!("{}", if alive { "alive" } else { "unresponsive" });
        if !alive {
            anyhow::bail!("kernel did not answer the heartbeat");
        }
        return Ok(());
    }
    if !alive {
        tracing::warn!("Kernel did not answer the heartbeat; listening anyway");
    }

    let dispatch = DisplayDispatch::new(PreformattedMarkup);
    let mut sink = StdoutSink;
    session.on(move |msg| dispatch.handle_message(&msg, &mut sink));

    session.run().await?;

    tracing::info!("Session closed");
    Ok(())
}

async fn find_connection_file(runtime_dir: Option<PathBuf>, wait: bool) -> Result<PathBuf> {
    let dir = runtime_dir
        .or_else(runtime::default_runtime_dir)
        .context("No runtime directory (set JUPYTER_RUNTIME_DIR or use -f)")?;

    // Start watching before the scan so a kernel starting in between is seen.
    let mut watcher = if wait {
        let watcher = RuntimeWatcher::new(&dir)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        Some(watcher)
    } else {
        None
    };

    if let Some(path) = runtime::newest_connection_file(&dir)
        .with_context(|| format!("Failed to scan {}", dir.display()))?
    {
        return Ok(path);
    }

    let Some(watcher) = watcher.as_mut() else {
        anyhow::bail!("No kernel-*.json found in {}", dir.display());
    };
    tracing::info!("Waiting for a kernel to start in {}", dir.display());
    watcher
        .next_connection_file()
        .await
        .with_context(|| format!("Stopped watching {}", dir.display()))
}
