use std::f64::consts::FRAC_PI_4;

use color_eyre::eyre::{eyre, Result};
use geo::{Area, Coord, CoordsIter, GeometryCollection, MapCoords};
use geojson::{quick_collection, GeoJson};
use tracing::trace;

/// WGS84 semi-major axis, as used by EPSG:3857.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude at which web mercator becomes a square; beyond it the projection is undefined.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

pub trait AreaCalculator: Send + Sync {
	/// Area in square metres of a geometry given in EPSG:4326 (lon, lat).
	fn area_m2(&self, geometry: &geojson::Geometry) -> Result<f64>;
}

/// Reprojects to Web Mercator (EPSG:3857) and measures the planar area there.
///
/// Mercator inflates areas away from the equator; the figures are only
/// comparable with each other, which is all the dataset needs.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebMercator;

impl AreaCalculator for WebMercator {
	fn area_m2(&self, geometry: &geojson::Geometry) -> Result<f64> {
		let gc: GeometryCollection<f64> = quick_collection(&GeoJson::Geometry(geometry.clone()))?;
		if let Some(c) = gc
			.coords_iter()
			.find(|c| c.y.abs() > MAX_LATITUDE || c.x.abs() > 180.0)
		{
			return Err(eyre!("coordinate ({}, {}) is outside web mercator bounds", c.x, c.y));
		}

		let area = gc.map_coords(to_mercator).unsigned_area();
		trace!(geometries=%gc.0.len(), %area, "projected area");

		if area.is_finite() {
			Ok(area)
		} else {
			Err(eyre!("projected area is not finite"))
		}
	}
}

pub fn to_mercator(Coord { x, y }: Coord<f64>) -> Coord<f64> {
	Coord {
		x: EARTH_RADIUS * x.to_radians(),
		y: EARTH_RADIUS * (FRAC_PI_4 + y.to_radians() / 2.0).tan().ln(),
	}
}
