pub mod image;
pub mod text;
pub mod twgo;

use chrono::{DateTime, Duration, Utc};

use crate::config::Settings;
use crate::errors::{ErrorSink, FisbError};
use crate::model::{CrlPayload, Product, ProductType, ServiceStatusPayload};
use crate::reassembly::{Assembled, AssembledKind};

/**
 * L2 turns reassembled records into typed products with fully qualified
 * ISO-8601 times and an expiration. One upstream report frequently
 * bundles many logical products (a text block of METARs); they are split
 * here, one product per logical entity with its own unique name.
 */

pub struct Synthesizer {
    settings: Settings,
}

impl Synthesizer {
    pub fn new(settings: Settings) -> Self {
        Synthesizer { settings }
    }

    /// Errors are per logical report: one bad METAR in a block never
    /// suppresses its neighbors
    pub fn synthesize(
        &self,
        assembled: &Assembled,
        sink: &mut ErrorSink,
    ) -> Vec<Product> {
        let mut products = Vec::new();
        match &assembled.kind {
            AssembledKind::Text { reports } => {
                for report in reports {
                    match text::report(assembled, report) {
                        Ok(product) => products.push(product),
                        Err(error) => sink.record(&error, report),
                    }
                }
            }
            AssembledKind::TwgoText(record) => {
                match twgo::text_product(&self.settings, assembled, record) {
                    Ok(product) => products.push(product),
                    Err(error) => sink.record(&error, &record.text),
                }
            }
            AssembledKind::TwgoPaired { text, graphics } => {
                match twgo::paired_product(
                    &self.settings,
                    assembled,
                    text,
                    graphics,
                ) {
                    Ok(product) => products.push(product),
                    Err(error) => sink.record(&error, &text.text),
                }
            }
            AssembledKind::TwgoCancel {
                report_number,
                report_year,
            } => {
                match twgo::cancel_product(
                    assembled,
                    *report_number,
                    *report_year,
                ) {
                    Ok(product) => products.push(product),
                    Err(error) => sink.record(&error, &assembled.station),
                }
            }
            AssembledKind::Crl(record) => {
                match crl_product(assembled, record) {
                    Ok(product) => products.push(product),
                    Err(error) => sink.record(&error, &assembled.station),
                }
            }
            AssembledKind::Image(block) => {
                match image::block_products(assembled, block) {
                    Ok(mut blocks) => products.append(&mut blocks),
                    Err(error) => sink.record(&error, &assembled.station),
                }
            }
            AssembledKind::ServiceStatus(record) => {
                products.push(service_status_product(assembled, record))
            }
        }
        for product in &mut products {
            product.station = Some(assembled.station.clone());
            // Every product leaves L2 alive: nothing expires before it
            // was even received
            if product.expiration_time < product.rcvd_time {
                product.expiration_time = product.rcvd_time;
            }
        }
        products
    }
}

pub const METAR_VALIDITY_HOURS: i64 = 2;
pub const PIREP_VALIDITY_MINUTES: i64 = 75;
pub const SERVICE_STATUS_VALIDITY_SECS: i64 = 40;
pub const CRL_VALIDITY_MINUTES: i64 = 30;
pub const TWGO_FALLBACK_HOURS: i64 = 8;

/// Per-product image time-to-live, in minutes
pub fn image_ttl_minutes(product_id: u16) -> i64 {
    match product_id {
        63 | 64 | 103 => 75,
        _ => 90,
    }
}

fn crl_product(
    assembled: &Assembled,
    record: &crate::decode::products::CrlRecord,
) -> Result<Product, FisbError> {
    let product_type = ProductType::crl_for(record.product_class)
        .ok_or(FisbError::UnknownProduct(record.product_class))?;
    let mut product = Product::new(
        product_type,
        assembled.station.clone(),
        assembled.rcvd_time,
        assembled.rcvd_time + Duration::minutes(CRL_VALIDITY_MINUTES),
    );
    product.product_id = assembled.product_id;
    product.crl = Some(CrlPayload {
        product_class: record.product_class,
        overflow: record.overflow,
        entries: record.entries.clone(),
        status: None,
    });
    Ok(product)
}

fn service_status_product(
    assembled: &Assembled,
    record: &crate::decode::products::ServiceStatusRecord,
) -> Product {
    let mut product = Product::new(
        ProductType::ServiceStatus,
        assembled.station.clone(),
        assembled.rcvd_time,
        assembled.rcvd_time + Duration::seconds(SERVICE_STATUS_VALIDITY_SECS),
    );
    product.service_status = Some(ServiceStatusPayload {
        addresses: record.addresses.clone(),
    });
    product
}

/// The RSR synthetic product is built by the station registry rather than
/// from a frame; it shares the expiration convention here
pub fn rsr_expiration(
    rcvd_time: DateTime<Utc>,
    window_secs: u64,
) -> DateTime<Utc> {
    rcvd_time + Duration::seconds(window_secs as i64 + 10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::products::CrlRecord;
    use crate::decode::time::PartialTime;
    use crate::model::CrlEntry;

    fn assembled(kind: AssembledKind) -> Assembled {
        Assembled {
            station: "-84.21844~39.90097".into(),
            rcvd_time: "2021-05-14T07:18:00Z".parse().unwrap(),
            product_id: Some(8),
            time: PartialTime::default(),
            kind,
        }
    }

    #[test]
    fn test_crl_product() {
        let record = CrlRecord {
            product_class: 8,
            overflow: false,
            entries: vec![CrlEntry {
                report_number: 6733,
                report_year: 20,
                has_text: true,
                has_graphics: true,
            }],
        };
        let synthesizer = Synthesizer::new(Settings::default());
        let mut sink = ErrorSink::memory();
        let products = synthesizer.synthesize(
            &assembled(AssembledKind::Crl(record)),
            &mut sink,
        );
        assert_eq!(products.len(), 1);
        let product = &products[0];
        assert_eq!(product.product_type, ProductType::Crl8);
        assert_eq!(product.unique_name, "-84.21844~39.90097");
        assert_eq!(
            product.expiration_time - product.rcvd_time,
            Duration::minutes(30)
        );
        assert!(!product.crl.as_ref().unwrap().overflow);
    }

    #[test]
    fn test_service_status_product() {
        let record = crate::decode::products::ServiceStatusRecord {
            addresses: vec!["a74b2c".into()],
        };
        let synthesizer = Synthesizer::new(Settings::default());
        let mut sink = ErrorSink::memory();
        let products = synthesizer.synthesize(
            &assembled(AssembledKind::ServiceStatus(record)),
            &mut sink,
        );
        let product = &products[0];
        assert_eq!(product.product_type, ProductType::ServiceStatus);
        assert_eq!(
            product.expiration_time - product.rcvd_time,
            Duration::seconds(40)
        );
    }

    #[test]
    fn test_bad_report_does_not_suppress_good_one() {
        let synthesizer = Synthesizer::new(Settings::default());
        let mut sink = ErrorSink::memory();
        let products = synthesizer.synthesize(
            &assembled(AssembledKind::Text {
                reports: vec![
                    "GIBBERISH REPORT".into(),
                    "METAR KOCQ 140715Z AUTO 00000KT=".into(),
                ],
            }),
            &mut sink,
        );
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].unique_name, "KOCQ");
        assert_eq!(sink.count("report_text"), 1);
    }
}
