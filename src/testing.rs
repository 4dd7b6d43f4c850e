use std::{
	io,
	path::PathBuf,
	pin::Pin,
	sync::atomic::{AtomicUsize, Ordering},
	task::{Context, Poll},
	time::Duration,
};

use color_eyre::eyre::Result;
use reqwest::Url;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncWrite;

use crate::{client::Transport, report::ErrorReporter};

/// Transport answering from a closure of (url, zero-based call number).
pub struct FnTransport<F> {
	respond: F,
	delay: Duration,
	calls: AtomicUsize,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
}

impl<F> FnTransport<F>
where
	F: Fn(&Url, usize) -> Result<Vec<u8>> + Send + Sync + 'static,
{
	pub fn new(respond: F) -> Self {
		Self {
			respond,
			delay: Duration::ZERO,
			calls: AtomicUsize::new(0),
			in_flight: AtomicUsize::new(0),
			max_in_flight: AtomicUsize::new(0),
		}
	}

	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = delay;
		self
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn max_in_flight(&self) -> usize {
		self.max_in_flight.load(Ordering::SeqCst)
	}
}

impl<F> Transport for FnTransport<F>
where
	F: Fn(&Url, usize) -> Result<Vec<u8>> + Send + Sync + 'static,
{
	async fn get(&self, url: Url) -> Result<Vec<u8>> {
		let call = self.calls.fetch_add(1, Ordering::SeqCst);
		let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_in_flight.fetch_max(now, Ordering::SeqCst);

		if !self.delay.is_zero() {
			tokio::time::sleep(self.delay).await;
		}
		let result = (self.respond)(&url, call);

		self.in_flight.fetch_sub(1, Ordering::SeqCst);
		result
	}
}

/// A routing service body holding one square polygon per (lon, lat, side).
pub fn polygon_body(squares: &[(f64, f64, f64)]) -> Vec<u8> {
	let polygons = squares
		.iter()
		.enumerate()
		.map(|(bucket, &(x, y, side))| {
			json!({
				"properties": { "bucket": bucket },
				"geometry": {
					"type": "Polygon",
					"coordinates": [[
						[x, y],
						[x + side, y],
						[x + side, y + side],
						[x, y + side],
						[x, y],
					]],
				},
			})
		})
		.collect::<Vec<_>>();

	serde_json::to_vec(&json!({
		"polygons": polygons,
		"info": { "copyrights": ["GraphHopper", "OpenStreetMap contributors"], "took": 4 },
	}))
	.unwrap()
}

pub async fn temp_reporter() -> (TempDir, PathBuf, ErrorReporter) {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("errors.log");
	let reporter = ErrorReporter::create(&path).await.unwrap().quiet();
	(dir, path, reporter)
}

/// A sink whose every write fails, like a full disk.
pub struct FailingSink;

impl AsyncWrite for FailingSink {
	fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
		Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
	}

	fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}
