use std::{fmt, path::Path, str::FromStr};

use color_eyre::eyre::{eyre, Result, WrapErr};
use itertools::iproduct;
use tokio::fs;
use tracing::{debug, info, trace};

pub const DEFAULT_POINT_LABELS: &[&str] = &["center", "north", "east", "south", "west"];
pub const DEFAULT_PROFILES: &[&str] = &["foot", "car", "pt"];
pub const DEFAULT_TIME_LIMITS: &[u64] = &[300, 900, 1800];

const GEOID_COLUMN: &str = "GEOID10";

/// A `lat,lon` pair, in that order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Center {
	pub lat: f64,
	pub lon: f64,
}

impl fmt::Display for Center {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{},{}", self.lat, self.lon)
	}
}

impl FromStr for Center {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (lat, lon) = s
			.split_once(',')
			.ok_or_else(|| format!("invalid coordinate pair: {}", s))?;
		let lat = lat
			.trim()
			.parse()
			.map_err(|err| format!("invalid latitude in {:?}: {}", s, err))?;
		let lon = lon
			.trim()
			.parse()
			.map_err(|err| format!("invalid longitude in {:?}: {}", s, err))?;
		Ok(Self { lat, lon })
	}
}

/// One row of the input table: a block group and its labelled points.
#[derive(Clone, Debug, PartialEq)]
pub struct Location {
	pub geoid: String,
	pub points: Vec<(String, Center)>,
}

/// One unit of work. Never mutated after enumeration.
#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
	pub geoid: String,
	pub point_label: String,
	pub profile: String,
	pub time_limit: u64,
	pub center: Center,
}

impl fmt::Display for Descriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"geoid={} point={} profile={} time_limit={}s center={}",
			self.geoid, self.point_label, self.profile, self.time_limit, self.center
		)
	}
}

pub async fn read_locations(path: impl AsRef<Path>, labels: &[String]) -> Result<Vec<Location>> {
	let path = path.as_ref();
	debug!(?path, "reading input table");

	let contents = fs::read(path)
		.await
		.wrap_err_with(|| format!("reading input table {}", path.display()))?;
	debug!(?path, bytes=%contents.len(), "read input table");

	let locations = parse_locations(&contents[..], labels)
		.wrap_err_with(|| format!("parsing input table {}", path.display()))?;
	info!(?path, "loaded {} locations", locations.len());

	Ok(locations)
}

fn parse_locations(reader: impl std::io::Read, labels: &[String]) -> Result<Vec<Location>> {
	let mut csv = csv::Reader::from_reader(reader);
	let headers = csv.headers()?.clone();
	trace!(?headers, "input table headers");

	let column = |name: &str| {
		headers
			.iter()
			.position(|h| h.trim() == name)
			.ok_or_else(|| eyre!("missing column {}", name))
	};

	let geoid_col = column(GEOID_COLUMN)?;
	let point_cols = labels
		.iter()
		.map(|label| -> Result<_> {
			Ok((
				label.clone(),
				column(&format!("{}_lat", label))?,
				column(&format!("{}_lon", label))?,
			))
		})
		.collect::<Result<Vec<_>>>()?;

	let mut locations = Vec::new();
	for (n, record) in csv.records().enumerate() {
		let record = record?;
		let row = n + 2;

		let field = |col: usize| {
			record
				.get(col)
				.map(str::trim)
				.ok_or_else(|| eyre!("row {}: missing field {}", row, col))
		};
		let coord = |col: usize| -> Result<f64> {
			let value = field(col)?;
			value
				.parse()
				.map_err(|err| eyre!("row {}: invalid coordinate {:?}: {}", row, value, err))
		};

		let geoid = field(geoid_col)?.to_string();
		let points = point_cols
			.iter()
			.map(|(label, lat, lon)| -> Result<_> {
				Ok((
					label.clone(),
					Center {
						lat: coord(*lat)?,
						lon: coord(*lon)?,
					},
				))
			})
			.collect::<Result<Vec<_>>>()?;

		trace!(%geoid, ?points, "parsed location");
		locations.push(Location { geoid, points });
	}

	Ok(locations)
}

/// Expands locations into every (point, profile, time limit) combination.
///
/// Order is location, then point, then profile, then time limit.
pub fn enumerate(locations: &[Location], profiles: &[String], time_limits: &[u64]) -> Vec<Descriptor> {
	locations
		.iter()
		.flat_map(|location| {
			iproduct!(location.points.iter(), profiles.iter(), time_limits.iter()).map(
				move |((label, center), profile, time_limit)| Descriptor {
					geoid: location.geoid.clone(),
					point_label: label.clone(),
					profile: profile.clone(),
					time_limit: *time_limit,
					center: *center,
				},
			)
		})
		.collect()
}
