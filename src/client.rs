use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::eyre::{Report, Result, WrapErr};
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::{area::AreaCalculator, descriptor::Descriptor, report::ErrorReporter};

/// Profile that routes over public transport and needs a departure time.
pub const TRANSIT_PROFILE: &str = "pt";

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8989/isochrone";
pub const DEFAULT_DEPARTURE: &str = "2025-03-31T14:00:00Z";

/// How a request reaches the routing service.
///
/// Implementations must treat a non-success status as an error and return the
/// body bytes otherwise.
pub trait Transport: Send + Sync + 'static {
	fn get(&self, url: Url) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

#[derive(Clone, Debug)]
pub struct HttpTransport {
	client: Client,
}

impl HttpTransport {
	pub fn new(timeout: Duration) -> Result<Self> {
		let client = Client::builder()
			.timeout(timeout)
			.user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
			.build()?;
		Ok(Self { client })
	}
}

impl Transport for HttpTransport {
	async fn get(&self, url: Url) -> Result<Vec<u8>> {
		let resp = self.client.get(url).send().await?.error_for_status()?;
		trace!(status=?resp.status(), headers=?resp.headers(), "headers");

		let body = resp.bytes().await?;
		trace!(bytes=%body.len(), "read response body");
		Ok(body.to_vec())
	}
}

/// Bounded attempts with a fixed pause between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	pub attempts: u32,
	pub delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			attempts: 5,
			delay: Duration::from_secs(2),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
struct IsochroneResponse {
	#[serde(default)]
	polygons: Vec<ResponsePolygon>,
}

#[derive(Clone, Debug, Deserialize)]
struct ResponsePolygon {
	geometry: geojson::Geometry,
}

/// A polygon as returned by the service, with its measured area.
#[derive(Clone, Debug, PartialEq)]
pub struct Isochrone {
	pub geometry: geojson::Geometry,
	pub area_m2: f64,
}

#[derive(Clone, Debug)]
pub struct Success {
	pub descriptor: Descriptor,
	pub isochrones: Vec<Isochrone>,
}

#[derive(Debug)]
pub struct Failure {
	pub descriptor: Descriptor,
	pub attempts: u32,
	pub last_error: Report,
}

#[derive(Debug)]
pub enum Outcome {
	Success(Success),
	Failure(Failure),
}

pub struct IsochroneClient<T> {
	transport: T,
	endpoint: Url,
	departure: DateTime<Utc>,
	retry: RetryPolicy,
	area: Arc<dyn AreaCalculator>,
}

impl<T: Transport> IsochroneClient<T> {
	pub fn new(
		transport: T,
		endpoint: Url,
		departure: DateTime<Utc>,
		area: Arc<dyn AreaCalculator>,
	) -> Self {
		Self {
			transport,
			endpoint,
			departure,
			retry: RetryPolicy::default(),
			area,
		}
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	#[cfg(test)]
	pub(crate) fn transport(&self) -> &T {
		&self.transport
	}

	pub fn url(&self, descriptor: &Descriptor) -> Url {
		let mut url = self.endpoint.clone();
		{
			let mut query = url.query_pairs_mut();
			query
				.append_pair("profile", &descriptor.profile)
				.append_pair("point", &descriptor.center.to_string())
				.append_pair("time_limit", &descriptor.time_limit.to_string());

			if descriptor.profile == TRANSIT_PROFILE {
				query.append_pair(
					"pt.earliest_departure_time",
					&self.departure.to_rfc3339_opts(SecondsFormat::Secs, true),
				);
			}
		}
		url
	}

	/// Fetches one descriptor, retrying per the policy.
	///
	/// Every failed attempt is reported before the pause or before giving up.
	/// The only error returned is a failure to write to the reporter; fetch
	/// failures come back as [`Outcome::Failure`].
	pub async fn fetch(&self, descriptor: Descriptor, reporter: &ErrorReporter) -> Result<Outcome> {
		let url = self.url(&descriptor);
		let attempts = self.retry.attempts.max(1);

		let mut attempt = 1;
		loop {
			trace!(%url, %attempt, "requesting isochrone");
			let err = match self.attempt(&url).await {
				Ok(isochrones) => {
					debug!(%descriptor, %attempt, polygons=%isochrones.len(), "got isochrone");
					return Ok(Outcome::Success(Success {
						descriptor,
						isochrones,
					}));
				}
				Err(err) => err,
			};

			warn!(%descriptor, %attempt, "isochrone request failed: {:#}", err);
			if attempt < attempts {
				reporter
					.report(format!(
						"[!] Error on attempt {} of {} for {}: {:#}; retrying in {:?}",
						attempt, attempts, descriptor, err, self.retry.delay
					))
					.await?;
				sleep(self.retry.delay).await;
				attempt += 1;
			} else {
				reporter
					.report(format!(
						"[!] Error on attempt {} of {} for {}: {:#}; giving up",
						attempt, attempts, descriptor, err
					))
					.await?;
				return Ok(Outcome::Failure(Failure {
					descriptor,
					attempts: attempt,
					last_error: err,
				}));
			}
		}
	}

	async fn attempt(&self, url: &Url) -> Result<Vec<Isochrone>> {
		let body = self.transport.get(url.clone()).await?;
		trace!(%url, bytes=%body.len(), "received isochrone body");

		let response: IsochroneResponse =
			serde_json::from_slice(&body).wrap_err("malformed isochrone response")?;

		response
			.polygons
			.into_iter()
			.map(|polygon| -> Result<_> {
				let area_m2 = self
					.area
					.area_m2(&polygon.geometry)
					.wrap_err("measuring isochrone polygon")?;
				Ok(Isochrone {
					geometry: polygon.geometry,
					area_m2,
				})
			})
			.collect()
	}
}
