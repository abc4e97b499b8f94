use once_cell::sync::Lazy;
use regex::Regex;
use rs978::config::Settings;
use rs978::model::{Product, ProductType};
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

/**
 * Location enrichment from the read-only side store: airports, navaids,
 * designated points, SUA polygons and a declination grid. Weather
 * products get a GeoJSON point for their station; PIREPs resolve their
 * /OV base fix, applying the magnetic-to-true correction when a radial
 * and distance follow the fix. With no declination available the product
 * is emitted without `geojson` rather than guessing.
 */

static OV_FIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/OV\s*([A-Z]{2,5})(?:(\d{3})(\d{3}))?\b").expect("OV regex")
});

pub struct LocationIndex {
    conn: Connection,
}

impl LocationIndex {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        Ok(LocationIndex { conn })
    }

    fn point(&self, table: &str, ident: &str) -> Option<(f64, f64)> {
        let sql =
            format!("SELECT lon, lat FROM {table} WHERE ident = ?1 LIMIT 1");
        self.conn
            .query_row(&sql, rusqlite::params![ident], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .ok()
    }

    /// (lon, lat) of an airport, navaid or designated point
    pub fn fix(&self, ident: &str) -> Option<(f64, f64)> {
        self.point("AIRPORTS", ident)
            .or_else(|| self.point("NAVAIDS", ident))
            .or_else(|| self.point("DESIGNATED_POINTS", ident))
            .or_else(|| {
                // Identifiers sometimes arrive with the K prefix dropped
                // or added
                ident
                    .strip_prefix('K')
                    .and_then(|short| self.point("AIRPORTS", short))
            })
    }

    /// Magnetic declination at the nearest whole-degree grid point, east
    /// positive
    pub fn declination(&self, lon: f64, lat: f64) -> Option<f64> {
        self.conn
            .query_row(
                "SELECT declination FROM DECLINATION
                 WHERE lon = ?1 AND lat = ?2 LIMIT 1",
                rusqlite::params![
                    lon.round() as i64,
                    lat.round() as i64
                ],
                |row| row.get(0),
            )
            .ok()
    }

    /// GeoJSON geometry of a SUA airspace by its NFDC identifier
    pub fn sua_geometry(&self, ident: &str) -> Option<serde_json::Value> {
        let text: String = self
            .conn
            .query_row(
                "SELECT geojson FROM SUA WHERE ident = ?1 LIMIT 1",
                rusqlite::params![ident],
                |row| row.get(0),
            )
            .ok()?;
        serde_json::from_str(&text).ok()
    }
}

fn point_geojson(lon: f64, lat: f64) -> serde_json::Value {
    serde_json::json!({
        "type": "Point",
        "coordinates": [lon, lat],
    })
}

/// Project a radial/distance from a fix. The radial is magnetic;
/// declination turns it true before the (flat-earth, short-range)
/// projection.
fn project(
    lon: f64,
    lat: f64,
    radial_deg: f64,
    distance_nm: f64,
    declination: f64,
) -> (f64, f64) {
    let bearing = (radial_deg + declination).to_radians();
    let delta_lat = distance_nm * bearing.cos() / 60.0;
    let delta_lon =
        distance_nm * bearing.sin() / (60.0 * lat.to_radians().cos());
    (lon + delta_lon, lat + delta_lat)
}

/// Attach `geojson` where the side store resolves the product's
/// location. Returns false for a PIREP whose base fix is unknown, so the
/// caller can honor `save_unmatched_pireps`.
pub fn enrich(
    product: &mut Product,
    index: &LocationIndex,
    settings: &Settings,
) -> bool {
    match product.product_type {
        ProductType::Metar
        | ProductType::Taf
        | ProductType::Winds06Hr
        | ProductType::Winds12Hr
        | ProductType::Winds24Hr
            if settings.location_wx =>
        {
            if let Some((lon, lat)) = index.fix(&product.unique_name) {
                product.geojson = Some(point_geojson(lon, lat));
            }
            true
        }
        ProductType::Pirep if settings.location_pirep => {
            let Some(contents) = product.contents.clone() else {
                return true;
            };
            let Some(captures) = OV_FIX.captures(&contents) else {
                return true;
            };
            let Some((lon, lat)) = index.fix(&captures[1]) else {
                debug!(
                    pirep = product.unique_name,
                    "base fix not in location store"
                );
                return false;
            };
            match (captures.get(2), captures.get(3)) {
                (Some(radial), Some(distance)) => {
                    // Without a declination the location would be a
                    // guess: leave geojson off
                    if let Some(declination) = index.declination(lon, lat) {
                        let (lon, lat) = project(
                            lon,
                            lat,
                            radial.as_str().parse().unwrap_or(0.0),
                            distance.as_str().parse().unwrap_or(0.0),
                            declination,
                        );
                        product.geojson = Some(point_geojson(lon, lat));
                    }
                }
                _ => product.geojson = Some(point_geojson(lon, lat)),
            }
            true
        }
        ProductType::Sua if settings.location_sua => {
            if let Some(contents) = &product.contents {
                // The NFDC identifier is the second pipe field
                if let Some(ident) = contents.split('|').nth(1) {
                    product.geojson = index.sua_geometry(ident);
                }
            }
            true
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn side_store(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("location.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE AIRPORTS (ident TEXT, lon REAL, lat REAL);
             CREATE TABLE NAVAIDS (ident TEXT, lon REAL, lat REAL);
             CREATE TABLE DESIGNATED_POINTS (ident TEXT, lon REAL, lat REAL);
             CREATE TABLE DECLINATION (lon INTEGER, lat INTEGER,
                                       declination REAL);
             CREATE TABLE SUA (ident TEXT, geojson TEXT);
             INSERT INTO AIRPORTS VALUES ('KOCQ', -87.9, 44.9);
             INSERT INTO NAVAIDS VALUES ('APE', -83.0, 40.0);
             INSERT INTO DECLINATION VALUES (-83, 40, -7.0);
             INSERT INTO SUA VALUES ('R-5503B',
                 '{\"type\":\"Polygon\",\"coordinates\":[]}');",
        )
        .unwrap();
        path
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.location_wx = true;
        settings.location_pirep = true;
        settings.location_sua = true;
        settings
    }

    fn product(product_type: ProductType, name: &str, contents: &str) -> Product {
        let t0 = Utc.with_ymd_and_hms(2021, 5, 14, 7, 18, 0).unwrap();
        let mut product =
            Product::new(product_type, name, t0, t0 + Duration::hours(1));
        product.contents = Some(contents.into());
        product
    }

    #[test]
    fn test_metar_gets_station_point() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocationIndex::open(&side_store(dir.path())).unwrap();
        let mut metar = product(
            ProductType::Metar,
            "KOCQ",
            "METAR KOCQ 140715Z AUTO=",
        );
        assert!(enrich(&mut metar, &index, &settings()));
        let geojson = metar.geojson.unwrap();
        assert_eq!(geojson["type"], "Point");
        assert_eq!(geojson["coordinates"][0], -87.9);
    }

    #[test]
    fn test_pirep_radial_applies_declination() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocationIndex::open(&side_store(dir.path())).unwrap();
        let mut pirep = product(
            ProductType::Pirep,
            "APE090030-0715-abcd1234",
            "PIREP CMH UA /OV APE090030/TM 0715/FL350=",
        );
        assert!(enrich(&mut pirep, &index, &settings()));
        let geojson = pirep.geojson.unwrap();
        let lon = geojson["coordinates"][0].as_f64().unwrap();
        let lat = geojson["coordinates"][1].as_f64().unwrap();
        // Magnetic 090 with 7 degrees west declination: true 083, a bit
        // north of due east
        assert!(lon > -83.0 + 0.5, "projected east of the fix");
        assert!(lat > 40.0, "declination pulled the point north");
    }

    #[test]
    fn test_pirep_without_declination_has_no_geojson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE AIRPORTS (ident TEXT, lon REAL, lat REAL);
             CREATE TABLE NAVAIDS (ident TEXT, lon REAL, lat REAL);
             CREATE TABLE DESIGNATED_POINTS (ident TEXT, lon REAL, lat REAL);
             CREATE TABLE DECLINATION (lon INTEGER, lat INTEGER,
                                       declination REAL);
             CREATE TABLE SUA (ident TEXT, geojson TEXT);
             INSERT INTO NAVAIDS VALUES ('APE', -83.0, 40.0);",
        )
        .unwrap();
        drop(conn);
        let index = LocationIndex::open(&path).unwrap();
        let mut pirep = product(
            ProductType::Pirep,
            "APE090030-0715-abcd1234",
            "PIREP CMH UA /OV APE090030/TM 0715/FL350=",
        );
        // Matched fix, but no declination: emitted without geojson
        assert!(enrich(&mut pirep, &index, &settings()));
        assert!(pirep.geojson.is_none());
    }

    #[test]
    fn test_unmatched_pirep_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocationIndex::open(&side_store(dir.path())).unwrap();
        let mut pirep = product(
            ProductType::Pirep,
            "ZZZZZ-0715-abcd1234",
            "PIREP CMH UA /OV ZZZZZ/TM 0715=",
        );
        assert!(!enrich(&mut pirep, &index, &settings()));
    }

    #[test]
    fn test_sua_polygon_attached() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocationIndex::open(&side_store(dir.path())).unwrap();
        let mut sua = product(
            ProductType::Sua,
            "21-0455",
            "21-0455|R-5503B|BULLDOG B MOA|W|M|150700|151300|050|180=",
        );
        assert!(enrich(&mut sua, &index, &settings()));
        assert_eq!(sua.geojson.unwrap()["type"], "Polygon");
    }
}
