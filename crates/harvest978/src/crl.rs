use chrono::{DateTime, Utc};
use rs978::model::{CrlPayload, ProductType};
use rs978::synthesis::twgo::{types_for_class, unique_name};
use tracing::debug;

use crate::store::{Store, StoreError, StoredProduct};

/**
 * CRL reconciliation. A station's Current Report List is `complete` only
 * when overflow is clear and every listed report is held locally, with
 * both parts where both are announced and none of it expired. The
 * annotation is recomputed whenever either side changes: the CRL itself,
 * or any report of a CRL-bearing class.
 */

pub const STATUS_COMPLETE: &str = "complete";
pub const STATUS_INCOMPLETE: &str = "incomplete";

/// Find the stored report a CRL entry refers to, across the product
/// types sharing the class's report-number space
fn find_report<S: Store>(
    store: &S,
    product_class: u16,
    report_number: u16,
    report_year: u8,
) -> Result<Option<StoredProduct>, StoreError> {
    let name = unique_name(report_number, report_year);
    for product_type in types_for_class(product_class) {
        if let Some(doc) = store.get(*product_type, &name)? {
            return Ok(Some(doc));
        }
    }
    Ok(None)
}

pub fn status_for<S: Store>(
    store: &S,
    crl: &CrlPayload,
    now: DateTime<Utc>,
) -> Result<&'static str, StoreError> {
    // An overflowed list is a prefix of the truth: never complete
    if crl.overflow {
        return Ok(STATUS_INCOMPLETE);
    }
    for entry in &crl.entries {
        let Some(doc) = find_report(
            store,
            crl.product_class,
            entry.report_number,
            entry.report_year,
        )?
        else {
            return Ok(STATUS_INCOMPLETE);
        };
        if doc.product.expiration_time <= now {
            return Ok(STATUS_INCOMPLETE);
        }
        if entry.has_text && doc.product.has_text != Some(true) {
            return Ok(STATUS_INCOMPLETE);
        }
        if entry.has_graphics && doc.product.has_graphics != Some(true) {
            return Ok(STATUS_INCOMPLETE);
        }
    }
    Ok(STATUS_COMPLETE)
}

/// Recompute the status annotation of every stored CRL indexing the
/// given class (or all classes when `class` is None)
pub fn annotate<S: Store>(
    store: &mut S,
    class: Option<u16>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let crl_types: Vec<ProductType> = match class {
        Some(class) => ProductType::crl_for(class).into_iter().collect(),
        None => vec![
            ProductType::Crl8,
            ProductType::Crl11,
            ProductType::Crl12,
            ProductType::Crl14,
            ProductType::Crl15,
            ProductType::Crl16,
            ProductType::Crl17,
        ],
    };
    for crl_type in crl_types {
        for mut doc in store.by_type(crl_type)? {
            let Some(crl) = doc.product.crl.clone() else {
                continue;
            };
            let status = status_for(store, &crl, now)?;
            if crl.status.as_deref() != Some(status) {
                debug!(
                    station = doc.product.unique_name,
                    %crl_type,
                    status,
                    "CRL status annotated"
                );
                doc.product.crl = Some(CrlPayload {
                    status: Some(status.to_owned()),
                    ..crl
                });
                store.upsert(&doc)?;
            }
        }
    }
    Ok(())
}

/// Immediate CRL update: remove local reports of the class the station
/// no longer lists. Returns how many were removed.
pub fn remove_unlisted<S: Store>(
    store: &mut S,
    crl: &CrlPayload,
) -> Result<usize, StoreError> {
    // With an overflowed list, absence proves nothing
    if crl.overflow {
        return Ok(0);
    }
    let mut removed = 0;
    for product_type in types_for_class(crl.product_class) {
        for doc in store.by_type(*product_type)? {
            let (Some(number), Some(year)) =
                (doc.product.report_number, doc.product.report_year)
            else {
                continue;
            };
            let listed = crl
                .entries
                .iter()
                .any(|entry| {
                    entry.report_number == number
                        && entry.report_year == year
                });
            if !listed
                && store.delete(*product_type, &doc.product.unique_name)?
            {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use chrono::{Duration, TimeZone};
    use rs978::model::{CrlEntry, Product};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 14, 7, 18, 0).unwrap()
    }

    fn report(
        product_type: ProductType,
        number: u16,
        year: u8,
        graphics: bool,
    ) -> StoredProduct {
        let mut product = Product::new(
            product_type,
            unique_name(number, year),
            t0(),
            t0() + Duration::hours(8),
        );
        product.report_number = Some(number);
        product.report_year = Some(year);
        product.has_text = Some(true);
        product.has_graphics = Some(graphics);
        StoredProduct {
            insert_time: t0(),
            product,
        }
    }

    fn crl(overflow: bool, entries: Vec<CrlEntry>) -> CrlPayload {
        CrlPayload {
            product_class: 8,
            overflow,
            entries,
            status: None,
        }
    }

    fn entry(number: u16, year: u8, graphics: bool) -> CrlEntry {
        CrlEntry {
            report_number: number,
            report_year: year,
            has_text: true,
            has_graphics: graphics,
        }
    }

    #[test]
    fn test_complete_when_all_parts_present() {
        let mut store = MemStore::new();
        store
            .upsert(&report(ProductType::NotamTfr, 6733, 20, true))
            .unwrap();
        store
            .upsert(&report(ProductType::NotamD, 101, 21, false))
            .unwrap();
        let crl = crl(
            false,
            vec![entry(6733, 20, true), entry(101, 21, false)],
        );
        assert_eq!(status_for(&store, &crl, t0()).unwrap(), STATUS_COMPLETE);
    }

    #[test]
    fn test_missing_graphics_part_is_incomplete() {
        let mut store = MemStore::new();
        store
            .upsert(&report(ProductType::NotamTfr, 6733, 20, false))
            .unwrap();
        let crl = crl(false, vec![entry(6733, 20, true)]);
        assert_eq!(
            status_for(&store, &crl, t0()).unwrap(),
            STATUS_INCOMPLETE
        );
    }

    #[test]
    fn test_expired_report_is_incomplete() {
        let mut store = MemStore::new();
        store
            .upsert(&report(ProductType::NotamTfr, 6733, 20, true))
            .unwrap();
        let crl = crl(false, vec![entry(6733, 20, true)]);
        assert_eq!(
            status_for(&store, &crl, t0() + Duration::hours(9)).unwrap(),
            STATUS_INCOMPLETE
        );
    }

    #[test]
    fn test_overflow_forbids_complete() {
        let mut store = MemStore::new();
        store
            .upsert(&report(ProductType::NotamTfr, 6733, 20, true))
            .unwrap();
        // Everything listed is present, but the list overflowed
        let crl = crl(true, vec![entry(6733, 20, true)]);
        assert_eq!(
            status_for(&store, &crl, t0()).unwrap(),
            STATUS_INCOMPLETE
        );
    }

    #[test]
    fn test_annotate_updates_stored_crl() {
        let mut store = MemStore::new();
        store
            .upsert(&report(ProductType::NotamTfr, 6733, 20, true))
            .unwrap();
        let mut product = Product::new(
            ProductType::Crl8,
            "-84.21844~39.90097",
            t0(),
            t0() + Duration::minutes(30),
        );
        product.crl = Some(crl(false, vec![entry(6733, 20, true)]));
        store
            .upsert(&StoredProduct {
                insert_time: t0(),
                product,
            })
            .unwrap();

        annotate(&mut store, Some(8), t0()).unwrap();
        let doc = store
            .get(ProductType::Crl8, "-84.21844~39.90097")
            .unwrap()
            .unwrap();
        assert_eq!(
            doc.product.crl.unwrap().status.as_deref(),
            Some(STATUS_COMPLETE)
        );
    }

    #[test]
    fn test_remove_unlisted() {
        let mut store = MemStore::new();
        store
            .upsert(&report(ProductType::NotamTfr, 6733, 20, true))
            .unwrap();
        store
            .upsert(&report(ProductType::NotamD, 500, 21, false))
            .unwrap();
        let crl = crl(false, vec![entry(6733, 20, true)]);
        let removed = remove_unlisted(&mut store, &crl).unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get(ProductType::NotamTfr, &unique_name(6733, 20))
            .unwrap()
            .is_some());
        assert!(store
            .get(ProductType::NotamD, &unique_name(500, 21))
            .unwrap()
            .is_none());
    }
}
