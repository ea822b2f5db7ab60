//! Brokerage daemon binary: hosts a demo calculator service behind an
//! in-process broker, republishes it over the IPC relay, and exposes a
//! small CLI for smoke-testing connect/add/cancel.

mod app;
mod broker_wire;
mod calculator;
mod paths;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Broker daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "brokerd")]
#[command(about = "Brokered-service framework reference daemon")]
struct Args {
	/// Socket path for IPC
	#[arg(short, long, value_name = "PATH")]
	socket: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the broker daemon, serving the demo calculator over IPC.
	Serve,
	/// Connect to a running daemon, call `add`, and exit.
	Smoke,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	info!("starting brokerd");

	let socket_path = args.socket.unwrap_or_else(paths::default_socket_path);

	if let Some(parent) = socket_path.parent() {
		if !parent.exists() {
			std::fs::create_dir_all(parent)?;
		}
	}

	info!(socket = %socket_path.display(), "IPC socket path");

	match args.command.unwrap_or(Command::Serve) {
		Command::Serve => {
			let shutdown = CancellationToken::new();
			app::serve(&socket_path, shutdown).await?;
		}
		Command::Smoke => {
			app::smoke_test(&socket_path).await?;
		}
	}

	Ok(())
}

/// Installs the global `tracing` subscriber. `BROKERAGE_LOG_DIR` (mirroring
/// the teacher's `XENO_LOG_DIR`) redirects output to a per-process log file
/// with `EnvFilter` honoring `RUST_LOG`; without it, falls back to a plain
/// stderr subscriber gated on `--verbose`.
fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;
	use tracing_subscriber::EnvFilter;

	if let Some(log_dir) = std::env::var("BROKERAGE_LOG_DIR").ok().map(PathBuf::from) {
		if std::fs::create_dir_all(&log_dir).is_ok() {
			let pid = std::process::id();
			let log_path = log_dir.join(format!("brokerd.{pid}.log"));

			if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
				let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
					if verbose {
						EnvFilter::new("brokerage=trace,debug")
					} else {
						EnvFilter::new("brokerage=debug,info")
					}
				});

				let file_layer = tracing_subscriber::fmt::layer()
					.with_writer(file)
					.with_ansi(false)
					.with_span_events(FmtSpan::CLOSE)
					.with_target(true);

				tracing_subscriber::registry().with(filter).with(file_layer).init();

				tracing::info!(path = ?log_path, "brokerd tracing initialized");
				return;
			}
		}
	}

	tracing_subscriber::fmt()
		.with_max_level(if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
		.init();
}
