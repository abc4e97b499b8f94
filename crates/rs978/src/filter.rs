use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

use crate::config::Settings;
use crate::model::{Product, ProductType};

/**
 * L3 suppresses the constant retransmission upstream of it: a product is
 * forwarded only when its content digest changes, or when the refresh
 * floor has elapsed since the last forward (a heartbeat so a silently
 * lost store record is eventually healed).
 *
 * The digest covers content-significant fields only; receive-side
 * metadata changes on every retransmission and is excluded.
 */

struct Entry {
    digest: [u8; 32],
    last_forward: DateTime<Utc>,
}

pub struct ChangeFilter {
    settings: Settings,
    cache: HashMap<(ProductType, String), Entry>,
}

impl ChangeFilter {
    pub fn new(settings: Settings) -> Self {
        ChangeFilter {
            settings,
            cache: HashMap::new(),
        }
    }

    /// True when the product should flow on to the curator
    pub fn admit(&mut self, product: &Product) -> bool {
        if product.product_type == ProductType::Pirep
            && self.settings.always_forward_pireps
        {
            return true;
        }
        let now = product.rcvd_time;
        let digest = content_digest(product);
        let key = (product.product_type, product.unique_name.clone());
        let floor =
            Duration::seconds(self.settings.refresh_floor_secs as i64);
        let admitted = match self.cache.get(&key) {
            None => true,
            Some(entry) => {
                entry.digest != digest || now - entry.last_forward >= floor
            }
        };
        if admitted {
            self.cache.insert(
                key,
                Entry {
                    digest,
                    last_forward: now,
                },
            );
            if self.cache.len() > self.settings.dedup_cache_cap {
                self.evict(now);
            }
        }
        admitted
    }

    /// Oldest-forward-first eviction down to nine tenths of the cap
    fn evict(&mut self, now: DateTime<Utc>) {
        let keep = self.settings.dedup_cache_cap * 9 / 10;
        let mut ages: Vec<((ProductType, String), DateTime<Utc>)> = self
            .cache
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_forward))
            .collect();
        ages.sort_by_key(|(_, last)| *last);
        let excess = self.cache.len().saturating_sub(keep);
        for (key, _) in ages.into_iter().take(excess) {
            self.cache.remove(&key);
        }
        debug!(size = self.cache.len(), at = %now, "dedup cache evicted");
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// SHA-256 over the canonical JSON of the product with receive-side
/// fields removed. Object keys serialize sorted, so equal content means
/// equal bytes.
pub fn content_digest(product: &Product) -> [u8; 32] {
    let mut value =
        serde_json::to_value(product).unwrap_or(serde_json::Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.remove("rcvd_time");
        map.remove("insert_time");
        map.remove("expiration_time");
        map.remove("geojson");
        // The relaying station is receive-side for weather products;
        // station-scoped products carry it in their unique name
        map.remove("station");
    }
    let canonical = value.to_string();
    Sha256::digest(canonical.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metar(rcvd: DateTime<Utc>, contents: &str) -> Product {
        let mut product = Product::new(
            ProductType::Metar,
            "KOCQ",
            rcvd,
            rcvd + Duration::hours(2),
        );
        product.contents = Some(contents.into());
        product
    }

    fn pirep(rcvd: DateTime<Utc>) -> Product {
        let mut product = Product::new(
            ProductType::Pirep,
            "APE230010-0715-abcd1234",
            rcvd,
            rcvd + Duration::minutes(75),
        );
        product.contents = Some("PIREP CMH UA /OV APE230010/TM 0715=".into());
        product
    }

    #[test]
    fn test_retransmission_suppressed() {
        let mut filter = ChangeFilter::new(Settings::default());
        let t0 = Utc.with_ymd_and_hms(2021, 5, 14, 7, 18, 0).unwrap();
        let text = "METAR KOCQ 140715Z AUTO=";

        assert!(filter.admit(&metar(t0, text)));
        // Same content five seconds later: suppressed, receive time is
        // not content
        assert!(!filter.admit(&metar(t0 + Duration::seconds(5), text)));
        // Neither is the relaying station
        let mut relayed = metar(t0 + Duration::seconds(6), text);
        relayed.station = Some("-83.00000~40.00000".into());
        assert!(!filter.admit(&relayed));
        // Changed content flows
        assert!(filter.admit(&metar(
            t0 + Duration::seconds(10),
            "METAR KOCQ 140745Z AUTO="
        )));
    }

    #[test]
    fn test_refresh_floor_heartbeat() {
        let mut settings = Settings::default();
        settings.refresh_floor_secs = 60;
        let mut filter = ChangeFilter::new(settings);
        let t0 = Utc.with_ymd_and_hms(2021, 5, 14, 7, 18, 0).unwrap();
        let text = "METAR KOCQ 140715Z AUTO=";

        assert!(filter.admit(&metar(t0, text)));
        assert!(!filter.admit(&metar(t0 + Duration::seconds(59), text)));
        assert!(filter.admit(&metar(t0 + Duration::seconds(61), text)));
    }

    #[test]
    fn test_pireps_always_forward() {
        let mut filter = ChangeFilter::new(Settings::default());
        let t0 = Utc.with_ymd_and_hms(2021, 5, 14, 7, 18, 0).unwrap();
        assert!(filter.admit(&pirep(t0)));
        assert!(filter.admit(&pirep(t0 + Duration::seconds(1))));

        let mut settings = Settings::default();
        settings.always_forward_pireps = false;
        let mut filter = ChangeFilter::new(settings);
        assert!(filter.admit(&pirep(t0)));
        assert!(!filter.admit(&pirep(t0 + Duration::seconds(1))));
    }

    #[test]
    fn test_cache_bounded() {
        let mut settings = Settings::default();
        settings.dedup_cache_cap = 100;
        let mut filter = ChangeFilter::new(settings);
        let t0 = Utc.with_ymd_and_hms(2021, 5, 14, 7, 0, 0).unwrap();
        for i in 0..500 {
            let mut product = Product::new(
                ProductType::Metar,
                format!("K{i:03}"),
                t0 + Duration::seconds(i),
                t0 + Duration::hours(2),
            );
            product.contents = Some(format!("METAR K{i:03} 140700Z="));
            assert!(filter.admit(&product));
        }
        assert!(filter.len() <= 101);
    }
}
