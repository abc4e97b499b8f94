use chrono::{DateTime, Duration, Utc};

use crate::config::Settings;
use crate::decode::products::{OverlayObject, TwgoGraphics, TwgoText};
use crate::decode::time::{self, horizons, Horizon};
use crate::errors::FisbError;
use crate::model::{GeometryElement, Product, ProductType};
use crate::reassembly::Assembled;
use crate::synthesis::{text, TWGO_FALLBACK_HOURS};

/**
 * TWGO product synthesis: the text half carries the report body, the
 * graphics half carries shapes whose applicability windows drive the
 * product's validity and expiration.
 */

/// Product classes sharing a report-number space with each wire class
pub fn types_for_class(product_id: u16) -> &'static [ProductType] {
    match product_id {
        8 | 16 | 17 => &[
            ProductType::NotamD,
            ProductType::NotamFdc,
            ProductType::NotamTfr,
        ],
        11 => &[ProductType::Airmet],
        12 => &[ProductType::Sigmet, ProductType::Wst],
        13 => &[ProductType::Sua],
        14 => &[
            ProductType::Sigwx,
            ProductType::GAirmet00Hr,
            ProductType::GAirmet03Hr,
            ProductType::GAirmet06Hr,
        ],
        15 => &[ProductType::Cwa],
        _ => &[],
    }
}

fn classify_text(product_id: u16, text: &str) -> Result<ProductType, FisbError> {
    match product_id {
        8 | 16 | 17 => {
            if text.contains("!FDC") {
                Ok(ProductType::NotamFdc)
            } else if text.contains("!TFR") || text.contains("NOTAM-TFR") {
                Ok(ProductType::NotamTfr)
            } else {
                Ok(ProductType::NotamD)
            }
        }
        11 => Ok(ProductType::Airmet),
        12 => {
            if text.starts_with("WST") || text.contains("CONVECTIVE SIGMET") {
                Ok(ProductType::Wst)
            } else {
                Ok(ProductType::Sigmet)
            }
        }
        14 => Ok(ProductType::Sigwx),
        15 => Ok(ProductType::Cwa),
        other => Err(FisbError::UnknownProduct(other)),
    }
}

fn applicability_window(product_id: u16) -> Horizon {
    match product_id {
        // NOTAM activity can sit months out
        8 | 16 | 17 => horizons::NOTAM_ACTIVITY,
        _ => horizons::TWGO_BEGIN,
    }
}

pub fn unique_name(report_number: u16, report_year: u8) -> String {
    format!("{report_number}-{report_year:02}")
}

/// The text half alone: emitted immediately and later replaced by the
/// paired emission under the same key
pub fn text_product(
    settings: &Settings,
    assembled: &Assembled,
    record: &TwgoText,
) -> Result<Product, FisbError> {
    let product_id = assembled
        .product_id
        .ok_or(FisbError::UnknownProduct(0))?;
    // SUA text records carry their own structured form
    if product_id == 13 {
        let mut product = text::sua(assembled, &record.text)?;
        product.report_number = Some(record.report_number);
        product.report_year = Some(record.report_year);
        product.has_text = Some(true);
        product.has_graphics = Some(false);
        return Ok(product);
    }
    let product_type = classify_text(product_id, &record.text)?;
    let issued = header_time(assembled)?;
    let mut product = Product::new(
        product_type,
        unique_name(record.report_number, record.report_year),
        assembled.rcvd_time,
        expiration(settings, assembled, issued, None),
    );
    product.product_id = Some(product_id);
    product.issued_time = Some(issued);
    product.contents = Some(record.text.clone());
    product.report_number = Some(record.report_number);
    product.report_year = Some(record.report_year);
    product.has_text = Some(true);
    product.has_graphics = Some(false);
    Ok(product)
}

/// Both halves: geometry attached, validity lifted from the overlay
/// applicability windows
pub fn paired_product(
    settings: &Settings,
    assembled: &Assembled,
    text: &TwgoText,
    graphics: &TwgoGraphics,
) -> Result<Product, FisbError> {
    let mut product = text_product(settings, assembled, text)?;
    let product_id = assembled.product_id.unwrap_or_default();
    let window = applicability_window(product_id);
    product.geometry = graphics
        .objects
        .iter()
        .map(|object| resolve_overlay(object, assembled.rcvd_time, window))
        .collect::<Result<Vec<_>, _>>()?;
    product.has_graphics = Some(true);

    let begin = product.geometry.iter().filter_map(|g| g.start_time).min();
    let stop = product.geometry.iter().filter_map(|g| g.stop_time).max();
    match product.product_type {
        ProductType::NotamD | ProductType::NotamFdc | ProductType::NotamTfr => {
            product.start_of_activity_time = begin;
            product.end_of_validity_time = stop;
        }
        _ => {
            product.valid_period_begin_time = begin;
            product.valid_period_end_time = stop;
        }
    }

    // G-AIRMET forecasts are typed by their whole-hour offset
    if product.product_type == ProductType::Sigwx {
        product.model_run_time = Some(header_time(assembled)?);
        let offset_hours = begin
            .map(|b| {
                ((b - assembled.rcvd_time).num_minutes() as f64 / 60.0).round()
                    as i64
            })
            .unwrap_or(0);
        product.product_type = if offset_hours < 2 {
            ProductType::GAirmet00Hr
        } else if offset_hours < 5 {
            ProductType::GAirmet03Hr
        } else {
            ProductType::GAirmet06Hr
        };
    }

    product.expiration_time = expiration(
        settings,
        assembled,
        product.issued_time.unwrap_or(assembled.rcvd_time),
        stop,
    );
    if product.product_type == ProductType::NotamTfr {
        if let Some(end) = product.end_of_validity_time {
            product.expiration_time = end;
        }
    }
    Ok(product)
}

/// Cancellation tombstone: the curator deletes every record of the class
/// under this unique name and drops the tombstone itself
pub fn cancel_product(
    assembled: &Assembled,
    report_number: u16,
    report_year: u8,
) -> Result<Product, FisbError> {
    let product_id = assembled
        .product_id
        .ok_or(FisbError::UnknownProduct(0))?;
    let primary = *types_for_class(product_id)
        .first()
        .ok_or(FisbError::UnknownProduct(product_id))?;
    let mut product = Product::new(
        primary,
        unique_name(report_number, report_year),
        assembled.rcvd_time,
        assembled.rcvd_time + Duration::hours(1),
    );
    product.product_id = Some(product_id);
    product.report_number = Some(report_number);
    product.report_year = Some(report_year);
    product.cancelled = Some(true);
    Ok(product)
}

/// The APDU header time when present, else the receipt time
fn header_time(assembled: &Assembled) -> Result<DateTime<Utc>, FisbError> {
    if assembled.time.is_empty() {
        return Ok(assembled.rcvd_time);
    }
    time::resolve(
        &assembled.time,
        assembled.rcvd_time,
        horizons::GENERIC,
        "APDU header",
    )
}

/// The standard-defined stop time of the latest geometry element, the
/// fallback TTL otherwise; the bypass flag pins a fixed TTL instead
fn expiration(
    settings: &Settings,
    assembled: &Assembled,
    issued: DateTime<Utc>,
    last_stop: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    if settings.bypass_smart_expiration {
        return assembled.rcvd_time
            + Duration::seconds(settings.twgo_fixed_ttl_secs as i64);
    }
    match last_stop {
        Some(stop) => stop,
        None => issued + Duration::hours(TWGO_FALLBACK_HOURS),
    }
}

fn resolve_overlay(
    object: &OverlayObject,
    rcvd_time: DateTime<Utc>,
    window: Horizon,
) -> Result<GeometryElement, FisbError> {
    let start = object
        .start
        .as_ref()
        .map(|partial| {
            time::resolve(partial, rcvd_time, window, "overlay start")
        })
        .transpose()?;
    // The stop side anchors on the start when there is one, so windows
    // spanning the wraparound stay coherent
    let stop = object
        .stop
        .as_ref()
        .map(|partial| {
            time::resolve(
                partial,
                start.unwrap_or(rcvd_time),
                horizons::TAF_VALID,
                "overlay stop",
            )
        })
        .transpose()?;
    Ok(GeometryElement {
        kind: object.kind,
        vertices: object.vertices.clone(),
        radius_nm: object.radius_nm,
        secondary_radius_nm: object.secondary_radius_nm,
        altitude_bottom_ft: object.altitude_bottom_ft,
        altitude_top_ft: object.altitude_top_ft,
        altitude_reference: object.altitude_reference,
        start_time: start,
        stop_time: stop,
    })
}
