use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use color_eyre::eyre::{eyre, Result, WrapErr};
use futures::future::try_join_all;
use geojson::{Feature, GeoJson};
use serde::Serialize;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info, trace, warn};

use crate::area::AreaCalculator;

/// Total isochrone area for one block group, profile and time limit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AreaRow {
	#[serde(rename = "GEOID10")]
	pub geoid: String,
	pub profile: String,
	pub time_limit: u64,
	/// Historical name: this is the sum over all directional points.
	pub average_area: f64,
}

/// Loads every feature of a GeoJSON file, or of every `*.geojson` in a directory.
pub async fn load_features(path: impl AsRef<Path>) -> Result<Vec<Feature>> {
	let path = path.as_ref();
	if !path.is_dir() {
		return load_geojson(path.to_path_buf()).await;
	}

	let mut files = Vec::new();
	for entry in glob::glob(path.join("*.geojson").display().to_string().as_str())? {
		files.push(tokio::spawn(async move { load_geojson(entry?).await }));
	}
	debug!(?path, files=%files.len(), "loading isochrone documents");

	let features = try_join_all(files)
		.await?
		.into_iter()
		.collect::<Result<Vec<_>, _>>()?
		.into_iter()
		.flatten()
		.collect::<Vec<_>>();

	Ok(features)
}

async fn load_geojson(path: PathBuf) -> Result<Vec<Feature>> {
	debug!(?path, "reading geojson");

	let mut file = File::open(&path)
		.await
		.wrap_err_with(|| format!("opening {}", path.display()))?;

	let bytes = usize::try_from(file.metadata().await?.len())?;
	let mut contents = Vec::with_capacity(bytes);
	file.read_to_end(&mut contents).await?;
	debug!(?path, bytes=%contents.len(), "read geojson file");

	let features = match GeoJson::from_reader(&contents[..])
		.wrap_err_with(|| format!("parsing {}", path.display()))?
	{
		GeoJson::FeatureCollection(fc) => fc.features,
		GeoJson::Feature(feature) => vec![feature],
		GeoJson::Geometry(_) => {
			return Err(eyre!("{} holds a bare geometry, not features", path.display()))
		}
	};
	info!(?path, "loaded {} features", features.len());

	Ok(features)
}

/// Sums the projected area of every feature per (geoid, profile, time limit).
///
/// Features lacking a geometry or one of the keys are skipped with a warning.
/// Rows summing to zero are omitted. Output is sorted by key.
pub fn sum_areas(features: &[Feature], calculator: &dyn AreaCalculator) -> Result<Vec<AreaRow>> {
	let mut sums: BTreeMap<(String, String, u64), f64> = BTreeMap::new();

	for (n, feature) in features.iter().enumerate() {
		let key = match feature_key(feature) {
			Some(key) => key,
			None => {
				warn!(feature=%n, "feature is missing geoid, profile or time_limit, skipping");
				continue;
			}
		};

		let geometry = match &feature.geometry {
			Some(geometry) => geometry,
			None => {
				warn!(feature=%n, geoid=%key.0, "feature has no geometry, skipping");
				continue;
			}
		};

		let area = calculator
			.area_m2(geometry)
			.wrap_err_with(|| format!("measuring feature {} (geoid {})", n, key.0))?;
		trace!(feature=%n, ?key, %area, "measured feature");
		*sums.entry(key).or_default() += area;
	}

	Ok(sums
		.into_iter()
		.filter(|(_, area)| *area != 0.0)
		.map(|((geoid, profile, time_limit), average_area)| AreaRow {
			geoid,
			profile,
			time_limit,
			average_area,
		})
		.collect())
}

fn feature_key(feature: &Feature) -> Option<(String, String, u64)> {
	// Older documents carry the geoid as a number.
	let geoid = match feature.property("geoid")? {
		serde_json::Value::String(s) => s.clone(),
		serde_json::Value::Number(n) => n.to_string(),
		_ => return None,
	};
	let profile = feature.property("profile")?.as_str()?.to_string();
	let time_limit = feature.property("time_limit")?.as_u64()?;
	Some((geoid, profile, time_limit))
}

pub fn write_csv(rows: &[AreaRow], writer: impl std::io::Write) -> Result<()> {
	let mut csv = csv::Writer::from_writer(writer);
	for row in rows {
		csv.serialize(row)?;
	}
	csv.flush()?;
	Ok(())
}

pub async fn run(input: &Path, output: &Path, calculator: &dyn AreaCalculator) -> Result<()> {
	let features = load_features(input).await?;
	info!(features=%features.len(), "summing isochrone areas");

	let rows = sum_areas(&features, calculator)?;
	let mut buf = Vec::new();
	write_csv(&rows, &mut buf)?;

	tokio::fs::write(output, buf)
		.await
		.wrap_err_with(|| format!("writing {}", output.display()))?;
	info!(rows=%rows.len(), ?output, "wrote area table");

	Ok(())
}
