use std::{env::var, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Result};
use futures::{Stream, StreamExt};
use reqwest::Url;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use area::WebMercator;
use client::{HttpTransport, IsochroneClient, RetryPolicy};
use coordinator::Coordinator;
use descriptor::{DEFAULT_POINT_LABELS, DEFAULT_PROFILES, DEFAULT_TIME_LIMITS};
use report::ErrorReporter;
use writer::ResultWriter;

mod area;
mod areas;
mod client;
mod coordinator;
mod descriptor;
mod report;
#[cfg(test)]
mod testing;
mod writer;

#[derive(Clone, Debug, StructOpt)]
struct Args {
	#[structopt(short, parse(from_occurrences), global = true)]
	verbose: u8,

	#[structopt(short, long, global = true)]
	quiet: bool,

	#[structopt(subcommand)]
	command: Command,
}

#[derive(Clone, Debug, StructOpt)]
enum Command {
	/// Fetch isochrones for every point of every block group.
	Fetch(FetchArgs),

	/// Sum isochrone areas per block group, profile and time limit.
	Areas(AreasArgs),
}

#[derive(Clone, Debug, StructOpt)]
struct FetchArgs {
	#[structopt(long, default_value = "blockgroup_centers.csv")]
	input: PathBuf,

	#[structopt(long, default_value = "isochrones.geojson")]
	output: PathBuf,

	#[structopt(long, default_value = "error_file.log")]
	error_log: PathBuf,

	#[structopt(long, env = "GRAPHHOPPER_URL", default_value = client::DEFAULT_ENDPOINT)]
	endpoint: Url,

	/// Travel profiles, comma-separated [default: foot,car,pt]
	#[structopt(long = "profile", use_delimiter = true)]
	profiles: Vec<String>,

	/// Time limits in seconds, comma-separated [default: 300,900,1800]
	#[structopt(long = "time-limit", use_delimiter = true)]
	time_limits: Vec<u64>,

	/// Point labels to read from the input table [default: center,north,east,south,west]
	#[structopt(long = "point", use_delimiter = true)]
	points: Vec<String>,

	/// Concurrent requests [default: number of CPUs]
	#[structopt(long)]
	workers: Option<usize>,

	#[structopt(long, default_value = "5")]
	attempts: u32,

	/// Seconds to wait between attempts
	#[structopt(long, default_value = "2")]
	retry_delay: f64,

	/// Per-request timeout in seconds
	#[structopt(long, default_value = "30")]
	timeout: f64,

	/// Earliest departure for public transport isochrones
	#[structopt(long, default_value = client::DEFAULT_DEPARTURE)]
	departure: DateTime<Utc>,
}

#[derive(Clone, Debug, StructOpt)]
struct AreasArgs {
	/// Isochrone document, or a directory of them
	#[structopt(default_value = "isochrones.geojson")]
	input: PathBuf,

	#[structopt(long, default_value = "blockgroup_areas.csv")]
	output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let args = Args::from_args();

	if var("RUST_LOG").is_ok() {
		tracing_subscriber::fmt()
			.with_writer(std::io::stderr)
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.init();
	} else if !args.quiet {
		tracing_subscriber::fmt()
			.with_writer(std::io::stderr)
			.with_env_filter(match args.verbose {
				0 => "isochrones=info",
				1 => "isochrones=debug",
				2 => "isochrones=trace",
				3.. => "trace",
			})
			.try_init()
			.ok();
	}

	debug!(?args, "parsed arguments");

	match args.command {
		Command::Fetch(fetch) => run_fetch(fetch).await,
		Command::Areas(opts) => areas::run(&opts.input, &opts.output, &WebMercator).await,
	}
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
	let profiles = or_defaults(args.profiles, DEFAULT_PROFILES);
	let points = or_defaults(args.points, DEFAULT_POINT_LABELS);
	let time_limits = if args.time_limits.is_empty() {
		DEFAULT_TIME_LIMITS.to_vec()
	} else {
		args.time_limits
	};
	let retry = RetryPolicy {
		attempts: args.attempts,
		delay: seconds(args.retry_delay, "retry delay")?,
	};
	let timeout = seconds(args.timeout, "timeout")?;
	let workers = args.workers.unwrap_or_else(coordinator::default_workers);

	let locations = descriptor::read_locations(&args.input, &points).await?;
	let descriptors = descriptor::enumerate(&locations, &profiles, &time_limits);
	println!("[+] Generated {} request tasks...", descriptors.len());

	let client = IsochroneClient::new(
		HttpTransport::new(timeout)?,
		args.endpoint,
		args.departure,
		Arc::new(WebMercator),
	)
	.with_retry(retry);

	// the log only appends; the output is truncated on create
	let reporter = Arc::new(ErrorReporter::create(&args.error_log).await?);
	let writer = Arc::new(ResultWriter::create(&args.output).await?);

	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			let interrupts = futures::stream::unfold((), |()| async {
				tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
			});
			if watch_interrupts(Box::pin(interrupts), cancel).await {
				std::process::exit(130);
			}
		}
	});

	let summary = Coordinator::new(client, workers)
		.run(descriptors, Arc::clone(&writer), reporter, cancel)
		.await;
	let finalized = writer.finalize().await;

	let summary = summary?;
	let features = finalized?;
	info!(?summary, "run complete");
	println!(
		"[✓] Incrementally saved {} features to {}",
		features,
		args.output.display()
	);

	if summary.skipped > 0 {
		println!("[!] Interrupted: {} requests were not attempted", summary.skipped);
	}

	Ok(())
}

/// Cancels the run on the first interrupt. Returns true on a second one.
async fn watch_interrupts(
	mut interrupts: impl Stream<Item = ()> + Unpin,
	cancel: CancellationToken,
) -> bool {
	if interrupts.next().await.is_none() {
		return false;
	}
	warn!("interrupted, finishing in-flight requests (interrupt again to quit)");
	cancel.cancel();

	if interrupts.next().await.is_none() {
		return false;
	}
	warn!("interrupted again, quitting");
	true
}

fn or_defaults(values: Vec<String>, defaults: &[&str]) -> Vec<String> {
	if values.is_empty() {
		defaults.iter().map(|s| s.to_string()).collect()
	} else {
		values
	}
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
	if value.is_finite() && value >= 0.0 {
		Ok(Duration::from_secs_f64(value))
	} else {
		Err(eyre!("invalid {}: {}", what, value))
	}
}
