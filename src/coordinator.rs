use std::{
	collections::VecDeque,
	num::NonZeroUsize,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	thread::available_parallelism,
};

use color_eyre::eyre::{eyre, Result};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	client::{IsochroneClient, Outcome, Transport},
	descriptor::Descriptor,
	report::ErrorReporter,
	writer::ResultWriter,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
	pub total: usize,
	pub succeeded: usize,
	pub failed: usize,
	pub skipped: usize,
	pub features: usize,
}

/// Runs a fixed pool of workers over a shared queue of descriptors.
pub struct Coordinator<T> {
	client: Arc<IsochroneClient<T>>,
	workers: usize,
}

/// One worker per available execution unit on the host.
pub fn default_workers() -> usize {
	available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

impl<T: Transport> Coordinator<T> {
	pub fn new(client: IsochroneClient<T>, workers: usize) -> Self {
		Self {
			client: Arc::new(client),
			workers: workers.max(1),
		}
	}

	/// Fetches every descriptor exactly once, routing successes to the writer.
	///
	/// Failures have already been reported by the client by the time they get
	/// here. Returns once every descriptor is resolved, or once the token is
	/// cancelled and in-flight fetches have finished. A write failure on either
	/// sink stops all workers and is returned. The writer is not finalized.
	pub async fn run(
		&self,
		descriptors: Vec<Descriptor>,
		writer: Arc<ResultWriter>,
		reporter: Arc<ErrorReporter>,
		cancel: CancellationToken,
	) -> Result<RunSummary> {
		let total = descriptors.len();
		let workers = self.workers.min(total.max(1));
		info!(%total, %workers, "fetching isochrones");

		let shared = Arc::new(Shared {
			queue: Mutex::new(descriptors.into()),
			total,
			processed: AtomicUsize::new(0),
			succeeded: AtomicUsize::new(0),
			failed: AtomicUsize::new(0),
			features: AtomicUsize::new(0),
			writer,
			reporter,
			cancel: cancel.child_token(),
		});

		let handles = (0..workers).map(|id| {
			let client = Arc::clone(&self.client);
			let shared = Arc::clone(&shared);
			tokio::spawn(async move {
				let res = work(id, &client, &shared).await;
				if res.is_err() {
					shared.cancel.cancel();
				}
				res
			})
		});

		try_join_all(handles)
			.await?
			.into_iter()
			.collect::<Result<Vec<_>, _>>()?;

		let summary = shared.summary();
		if summary.skipped > 0 {
			warn!(skipped=%summary.skipped, "run cancelled before all descriptors were fetched");
		}
		info!(
			succeeded=%summary.succeeded,
			failed=%summary.failed,
			features=%summary.features,
			"fetch complete"
		);

		Ok(summary)
	}
}

struct Shared {
	queue: Mutex<VecDeque<Descriptor>>,
	total: usize,
	processed: AtomicUsize,
	succeeded: AtomicUsize,
	failed: AtomicUsize,
	features: AtomicUsize,
	writer: Arc<ResultWriter>,
	reporter: Arc<ErrorReporter>,
	cancel: CancellationToken,
}

impl Shared {
	fn next(&self) -> Result<Option<Descriptor>> {
		if self.cancel.is_cancelled() {
			return Ok(None);
		}

		let mut queue = self
			.queue
			.lock()
			.map_err(|_| eyre!("work queue poisoned"))?;
		Ok(queue.pop_front())
	}

	fn advance(&self) -> usize {
		let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
		println!(
			"[{}%] {}/{} features processed",
			processed * 100 / self.total,
			processed,
			self.total
		);
		processed
	}

	fn summary(&self) -> RunSummary {
		let succeeded = self.succeeded.load(Ordering::SeqCst);
		let failed = self.failed.load(Ordering::SeqCst);
		RunSummary {
			total: self.total,
			succeeded,
			failed,
			skipped: self.total - succeeded - failed,
			features: self.features.load(Ordering::SeqCst),
		}
	}
}

async fn work<T: Transport>(id: usize, client: &IsochroneClient<T>, shared: &Shared) -> Result<()> {
	debug!(worker=%id, "worker started");

	while let Some(descriptor) = shared.next()? {
		match client.fetch(descriptor, &shared.reporter).await? {
			Outcome::Success(success) => {
				let features = shared.writer.append(&success).await?;
				shared.features.fetch_add(features, Ordering::SeqCst);
				shared.succeeded.fetch_add(1, Ordering::SeqCst);
			}
			Outcome::Failure(failure) => {
				warn!(
					worker=%id,
					descriptor=%failure.descriptor,
					attempts=%failure.attempts,
					"dropping descriptor: {:#}",
					failure.last_error
				);
				shared.failed.fetch_add(1, Ordering::SeqCst);
			}
		}

		shared.advance();
	}

	debug!(worker=%id, "worker finished");
	Ok(())
}
