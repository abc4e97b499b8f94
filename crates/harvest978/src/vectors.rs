use rs978::decode::time::to_iso8601;
use rs978::model::{GeometryKind, ProductType};
use std::io::Write;

use crate::store::{Store, StoreError};

/**
 * CSV WKT export of the current vector layers: one row per geometry
 * element of every stored vector product.
 */

const VECTOR_TYPES: &[ProductType] = &[
    ProductType::Airmet,
    ProductType::GAirmet00Hr,
    ProductType::GAirmet03Hr,
    ProductType::GAirmet06Hr,
    ProductType::Sigmet,
    ProductType::Wst,
    ProductType::Cwa,
    ProductType::NotamD,
    ProductType::NotamFdc,
    ProductType::NotamTfr,
    ProductType::Sua,
    ProductType::Sigwx,
];

fn wkt(kind: GeometryKind, vertices: &[(f64, f64)]) -> String {
    let coordinates = |list: &[(f64, f64)]| {
        list.iter()
            .map(|(lon, lat)| format!("{lon} {lat}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    match kind {
        GeometryKind::Point | GeometryKind::Circle => {
            let (lon, lat) = vertices.first().copied().unwrap_or((0.0, 0.0));
            format!("POINT ({lon} {lat})")
        }
        GeometryKind::Linestring => {
            format!("LINESTRING ({})", coordinates(vertices))
        }
        GeometryKind::Polygon => {
            // WKT rings close explicitly
            let mut ring = vertices.to_vec();
            if ring.first() != ring.last() {
                if let Some(first) = ring.first().copied() {
                    ring.push(first);
                }
            }
            format!("POLYGON (({}))", coordinates(&ring))
        }
    }
}

pub fn dump_vectors<S: Store, W: Write>(
    store: &S,
    out: &mut W,
) -> Result<usize, StoreError> {
    let mut writer = csv::Writer::from_writer(out);
    writer
        .write_record([
            "type",
            "unique_name",
            "element",
            "wkt",
            "radius_nm",
            "altitude_bottom_ft",
            "altitude_top_ft",
            "start_time",
            "stop_time",
            "expiration_time",
        ])
        .map_err(|e| StoreError::Permanent(e.to_string()))?;
    let mut rows = 0;
    for product_type in VECTOR_TYPES {
        for doc in store.by_type(*product_type)? {
            for element in &doc.product.geometry {
                let optional = |value: Option<String>| value.unwrap_or_default();
                writer
                    .write_record([
                        product_type.to_string(),
                        doc.product.unique_name.clone(),
                        format!("{:?}", element.kind).to_uppercase(),
                        wkt(element.kind, &element.vertices),
                        optional(element.radius_nm.map(|r| r.to_string())),
                        optional(
                            element
                                .altitude_bottom_ft
                                .map(|a| a.to_string()),
                        ),
                        optional(
                            element.altitude_top_ft.map(|a| a.to_string()),
                        ),
                        optional(element.start_time.map(|t| to_iso8601(&t))),
                        optional(element.stop_time.map(|t| to_iso8601(&t))),
                        to_iso8601(&doc.product.expiration_time),
                    ])
                    .map_err(|e| StoreError::Permanent(e.to_string()))?;
                rows += 1;
            }
        }
    }
    writer
        .flush()
        .map_err(|e| StoreError::Permanent(e.to_string()))?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, StoredProduct};
    use chrono::{Duration, TimeZone, Utc};
    use rs978::model::{AltitudeReference, GeometryElement, Product};

    #[test]
    fn test_dump() {
        let t0 = Utc.with_ymd_and_hms(2020, 9, 18, 20, 5, 0).unwrap();
        let mut store = MemStore::new();
        let mut product = Product::new(
            ProductType::NotamTfr,
            "6733-20",
            t0,
            t0 + Duration::hours(8),
        );
        product.geometry = vec![GeometryElement {
            kind: GeometryKind::Circle,
            vertices: vec![(-84.218445, 39.90097)],
            radius_nm: Some(30.0),
            secondary_radius_nm: None,
            altitude_bottom_ft: Some(0),
            altitude_top_ft: None,
            altitude_reference: AltitudeReference::Msl,
            start_time: Some(t0),
            stop_time: Some(t0 + Duration::hours(4)),
        }];
        store
            .upsert(&StoredProduct {
                insert_time: t0,
                product,
            })
            .unwrap();

        let mut out = Vec::new();
        let rows = dump_vectors(&store, &mut out).unwrap();
        assert_eq!(rows, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("NOTAM_TFR"));
        assert!(text.contains("POINT (-84.218445 39.90097)"));
        assert!(text.contains("30"));
    }

    #[test]
    fn test_polygon_ring_closes() {
        let ring = wkt(
            GeometryKind::Polygon,
            &[(-84.0, 39.0), (-83.5, 39.5), (-84.0, 40.0)],
        );
        assert_eq!(
            ring,
            "POLYGON ((-84 39, -83.5 39.5, -84 40, -84 39))"
        );
    }
}
