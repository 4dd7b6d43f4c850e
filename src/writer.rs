use std::path::Path;

use color_eyre::eyre::{eyre, Result, WrapErr};
use geojson::Feature;
use tokio::{
	fs::File,
	io::{AsyncWrite, AsyncWriteExt},
	sync::Mutex,
};
use tracing::{debug, trace};

use crate::client::{Isochrone, Success};
use crate::descriptor::Descriptor;

const HEADER: &str = r#"{"type": "FeatureCollection", "features": ["#;
const SEPARATOR: &str = ",\n";
const FOOTER: &str = "\n]}";

/// Streams features into a single GeoJSON FeatureCollection.
///
/// The document is only valid once [`ResultWriter::finalize`] has run; until
/// then the features array is left open. Appends hold the lock across the
/// separator and the feature bytes, so concurrent appends never interleave.
pub struct ResultWriter {
	inner: Mutex<Inner>,
}

struct Inner {
	sink: Box<dyn AsyncWrite + Send + Unpin>,
	written: usize,
	finished: bool,
}

impl ResultWriter {
	pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		debug!(?path, "creating output document");

		let file = File::create(path)
			.await
			.wrap_err_with(|| format!("creating output document {}", path.display()))?;
		Self::open(file).await
	}

	pub async fn open(sink: impl AsyncWrite + Send + Unpin + 'static) -> Result<Self> {
		let mut sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(sink);
		sink.write_all(HEADER.as_bytes())
			.await
			.wrap_err("writing output header")?;
		sink.flush().await?;

		Ok(Self {
			inner: Mutex::new(Inner {
				sink,
				written: 0,
				finished: false,
			}),
		})
	}

	/// Writes one feature per isochrone of the outcome, returning how many.
	pub async fn append(&self, success: &Success) -> Result<usize> {
		let features = success
			.isochrones
			.iter()
			.map(|isochrone| serde_json::to_string_pretty(&feature(&success.descriptor, isochrone)))
			.collect::<Result<Vec<_>, _>>()?;

		if features.is_empty() {
			trace!(descriptor=%success.descriptor, "no polygons to write");
			return Ok(0);
		}

		let mut inner = self.inner.lock().await;
		if inner.finished {
			return Err(eyre!("output document already finalized"));
		}

		let mut chunk = String::with_capacity(features.iter().map(|f| f.len() + SEPARATOR.len()).sum());
		for (n, feature) in features.iter().enumerate() {
			if inner.written + n > 0 {
				chunk.push_str(SEPARATOR);
			}
			chunk.push_str(feature);
		}

		inner
			.sink
			.write_all(chunk.as_bytes())
			.await
			.wrap_err("writing features to output document")?;
		inner.sink.flush().await?;
		inner.written += features.len();
		trace!(descriptor=%success.descriptor, features=%features.len(), bytes=%chunk.len(), "appended features");

		Ok(features.len())
	}

	/// Closes the collection. Returns the total number of features written.
	pub async fn finalize(&self) -> Result<usize> {
		let mut inner = self.inner.lock().await;
		if inner.finished {
			return Ok(inner.written);
		}

		inner
			.sink
			.write_all(FOOTER.as_bytes())
			.await
			.wrap_err("writing output footer")?;
		inner.sink.flush().await?;
		inner.sink.shutdown().await?;
		inner.finished = true;
		debug!(features=%inner.written, "finalized output document");

		Ok(inner.written)
	}
}

fn feature(descriptor: &Descriptor, isochrone: &Isochrone) -> Feature {
	let mut feature = Feature::from(isochrone.geometry.clone());
	feature.set_property("geoid", descriptor.geoid.clone());
	feature.set_property("point_label", descriptor.point_label.clone());
	feature.set_property("profile", descriptor.profile.clone());
	feature.set_property("time_limit", descriptor.time_limit);
	feature.set_property("center", descriptor.center.to_string());
	feature.set_property("area_m2", isochrone.area_m2);
	feature
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use futures::future::try_join_all;
	use geojson::{FeatureCollection, GeoJson, Value};

	use super::*;
	use crate::{descriptor::Center, testing::FailingSink};

	fn success(geoid: &str, squares: usize) -> Success {
		Success {
			descriptor: Descriptor {
				geoid: geoid.into(),
				point_label: "center".into(),
				profile: "foot".into(),
				time_limit: 300,
				center: Center {
					lat: 39.95,
					lon: -75.16,
				},
			},
			isochrones: (0..squares)
				.map(|n| Isochrone {
					geometry: geojson::Geometry::new(Value::Polygon(vec![vec![
						vec![-75.16, 39.95],
						vec![-75.15, 39.95],
						vec![-75.15, 39.96],
						vec![-75.16, 39.95],
					]])),
					area_m2: 1000.0 * (n + 1) as f64,
				})
				.collect(),
		}
	}

	fn read_collection(path: &Path) -> FeatureCollection {
		let text = std::fs::read_to_string(path).unwrap();
		match text.parse::<GeoJson>().unwrap() {
			GeoJson::FeatureCollection(fc) => fc,
			other => panic!("not a feature collection: {:?}", other),
		}
	}

	async fn temp_writer() -> (tempfile::TempDir, std::path::PathBuf, ResultWriter) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("isochrones.geojson");
		let writer = ResultWriter::create(&path).await.unwrap();
		(dir, path, writer)
	}

	#[tokio::test]
	async fn empty_collection_is_valid() {
		let (_dir, path, writer) = temp_writer().await;
		assert_eq!(writer.finalize().await.unwrap(), 0);
		assert_eq!(read_collection(&path).features.len(), 0);
	}

	#[tokio::test]
	async fn writes_features_in_append_order() {
		let (_dir, path, writer) = temp_writer().await;

		assert_eq!(writer.append(&success("1001", 2)).await.unwrap(), 2);
		assert_eq!(writer.append(&success("1002", 0)).await.unwrap(), 0);
		assert_eq!(writer.append(&success("1003", 1)).await.unwrap(), 1);
		assert_eq!(writer.finalize().await.unwrap(), 3);

		let fc = read_collection(&path);
		let geoids = fc
			.features
			.iter()
			.map(|f| f.property("geoid").unwrap().as_str().unwrap().to_string())
			.collect::<Vec<_>>();
		assert_eq!(geoids, vec!["1001", "1001", "1003"]);

		let first = &fc.features[0];
		assert_eq!(first.property("point_label").unwrap(), "center");
		assert_eq!(first.property("profile").unwrap(), "foot");
		assert_eq!(first.property("time_limit").unwrap(), 300);
		assert_eq!(first.property("center").unwrap(), "39.95,-75.16");
		assert_eq!(first.property("area_m2").unwrap(), 1000.0);
		assert_eq!(fc.features[1].property("area_m2").unwrap(), 2000.0);
		assert!(matches!(
			first.geometry.as_ref().map(|g| &g.value),
			Some(Value::Polygon(_))
		));
	}

	#[tokio::test]
	async fn layout_has_no_trailing_separator() {
		let (_dir, path, writer) = temp_writer().await;
		writer.append(&success("1001", 1)).await.unwrap();
		writer.append(&success("1002", 1)).await.unwrap();
		writer.finalize().await.unwrap();

		let text = std::fs::read_to_string(&path).unwrap();
		assert!(text.starts_with(HEADER));
		assert!(text.ends_with("}\n]}"));
		assert_eq!(text.matches("},\n{").count(), 1);
	}

	#[tokio::test]
	async fn finalize_is_idempotent_and_closes() {
		let (_dir, path, writer) = temp_writer().await;
		writer.append(&success("1001", 1)).await.unwrap();
		assert_eq!(writer.finalize().await.unwrap(), 1);
		assert_eq!(writer.finalize().await.unwrap(), 1);
		assert!(writer.append(&success("1002", 1)).await.is_err());
		assert_eq!(read_collection(&path).features.len(), 1);
	}

	#[tokio::test]
	async fn unfinalized_document_is_incomplete() {
		let (_dir, path, writer) = temp_writer().await;
		writer.append(&success("1001", 1)).await.unwrap();
		drop(writer);

		let text = std::fs::read_to_string(&path).unwrap();
		assert!(text.parse::<GeoJson>().is_err());
	}

	#[tokio::test]
	async fn concurrent_appends_do_not_interleave() {
		let (_dir, path, writer) = temp_writer().await;
		let writer = Arc::new(writer);

		let tasks = (0..16).map(|worker| {
			let writer = Arc::clone(&writer);
			tokio::spawn(async move {
				for n in 0..10 {
					writer
						.append(&success(&format!("{}-{}", worker, n), 1 + n % 3))
						.await?;
				}
				Ok::<_, color_eyre::eyre::Report>(())
			})
		});
		try_join_all(tasks)
			.await
			.unwrap()
			.into_iter()
			.collect::<Result<Vec<_>>>()
			.unwrap();

		let expected = 16 * (0..10).map(|n| 1 + n % 3).sum::<usize>();
		assert_eq!(writer.finalize().await.unwrap(), expected);

		let fc = read_collection(&path);
		assert_eq!(fc.features.len(), expected);
		for feature in &fc.features {
			let geoid = feature.property("geoid").unwrap().as_str().unwrap();
			let n: usize = geoid.split('-').nth(1).unwrap().parse().unwrap();
			let polygons_for_geoid = fc
				.features
				.iter()
				.filter(|f| f.property("geoid").unwrap() == geoid)
				.count();
			assert_eq!(polygons_for_geoid, 1 + n % 3);
		}
	}

	#[tokio::test]
	async fn unwritable_sink_is_an_error() {
		assert!(ResultWriter::open(FailingSink).await.is_err());
	}
}
