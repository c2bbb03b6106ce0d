use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use routegate::app::{BindError, Termination};
use routegate::config;
use tracing::{error, info};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BIND_FAILURE: u8 = 2;
const EXIT_DRAIN_TIMEOUT: u8 = 64;

#[derive(Parser, Debug)]
#[command(about = "Layer-7 reverse proxy", long_about = None)]
struct Args {
	/// Path to the YAML config file.
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Inline YAML config (instead of --file).
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Parse and validate the config, then exit.
	#[arg(long)]
	validate_only: bool,
}

fn main() -> ExitCode {
	router_core::telemetry::setup_logging();
	let args = Args::parse();

	let contents = match (&args.config, &args.file) {
		(Some(_), Some(_)) => {
			error!("only one of --config or --file may be given");
			return ExitCode::from(EXIT_CONFIG_ERROR);
		},
		(Some(inline), None) => inline.clone(),
		(None, Some(path)) => match std::fs::read_to_string(path) {
			Ok(c) => c,
			Err(e) => {
				error!("failed to read config {}: {e}", path.display());
				return ExitCode::from(EXIT_CONFIG_ERROR);
			},
		},
		(None, None) => {
			error!("a config file is required (--file or --config)");
			return ExitCode::from(EXIT_CONFIG_ERROR);
		},
	};

	let cfg = match config::parse_config(&contents) {
		Ok(cfg) => Arc::new(cfg),
		Err(e) => {
			error!("configuration error: {e:#}");
			return ExitCode::from(EXIT_CONFIG_ERROR);
		},
	};
	if args.validate_only {
		info!("configuration is valid");
		return ExitCode::SUCCESS;
	}

	let _ = rustls::crypto::ring::default_provider().install_default();

	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.worker_threads(cfg.num_worker_threads)
		.thread_name("routegate")
		.enable_all()
		.build()
	{
		Ok(rt) => rt,
		Err(e) => {
			error!("failed to build runtime: {e}");
			return ExitCode::from(EXIT_CONFIG_ERROR);
		},
	};

	runtime.block_on(async move {
		let bound = match routegate::app::run(cfg).await {
			Ok(bound) => bound,
			Err(e) => {
				return if e.downcast_ref::<BindError>().is_some() {
					error!("{e:#}");
					ExitCode::from(EXIT_BIND_FAILURE)
				} else {
					error!("startup failed: {e:#}");
					ExitCode::from(EXIT_CONFIG_ERROR)
				};
			},
		};
		match bound.wait_termination().await {
			Ok(Termination::Clean) => {
				info!("shutdown complete");
				ExitCode::SUCCESS
			},
			Ok(Termination::DrainTimeoutExceeded) => ExitCode::from(EXIT_DRAIN_TIMEOUT),
			Err(e) => {
				error!("shutdown failed: {e:#}");
				ExitCode::from(EXIT_CONFIG_ERROR)
			},
		}
	})
}
