use chrono::{DateTime, Duration, Utc};
use rs978::clock::Clock;
use rs978::config::Settings;
use rs978::model::{Product, ProductType};
use rs978::spool::ordered_spool_files;
use rs978::synthesis::twgo::types_for_class;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::crl;
use crate::location::{self, LocationIndex};
use crate::raster::{legend, RasterSet};
use crate::store::{Store, StoreError, StoredProduct};

/**
 * The curator owns the authoritative current-state store: it is the
 * single writer. Products arrive through the spool directory in arrival
 * order; application is idempotent (upsert keyed by type and unique
 * name), so a crash between apply and delete only replays.
 *
 * All timing goes through the clock capability, so test replay under a
 * Trickle offset behaves exactly like production.
 */

pub struct Curator<S: Store> {
    pub settings: Settings,
    pub clock: Clock,
    pub store: S,
    pub rasters: RasterSet,
    location: Option<LocationIndex>,
    legends_written: HashSet<u16>,
    last_maintenance: Option<DateTime<Utc>>,
}

impl<S: Store> Curator<S> {
    pub fn new(settings: Settings, clock: Clock, store: S) -> Self {
        let rasters = RasterSet::new(settings.clone());
        Curator {
            settings,
            clock,
            store,
            rasters,
            location: None,
            legends_written: HashSet::new(),
            last_maintenance: None,
        }
    }

    pub fn with_location(mut self, index: LocationIndex) -> Self {
        self.location = Some(index);
        self
    }

    /// Rebuild the in-memory rasters from the stored block products, so
    /// a restart keeps the imagery whole
    pub fn reload_rasters(&mut self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut blocks = 0;
        for product_type in self.store.types_present()? {
            if !product_type.is_image() {
                continue;
            }
            for doc in self.store.by_type(product_type)? {
                let (Some(product_id), Some(payload)) =
                    (doc.product.product_id, &doc.product.image)
                else {
                    continue;
                };
                self.rasters.apply(product_type, product_id, payload, now);
                blocks += 1;
            }
        }
        if blocks > 0 {
            info!(blocks, "rasters rebuilt from store");
        }
        Ok(blocks)
    }

    /// Apply one product. Replace-by-key for everything; cancellations
    /// delete instead of storing; CRLs re-annotate their class.
    pub fn apply(&mut self, mut product: Product) -> Result<(), StoreError> {
        let now = self.clock.now();

        if product.cancelled == Some(true) {
            let Some(product_id) = product.product_id else {
                return Ok(());
            };
            for product_type in types_for_class(product_id) {
                if self
                    .store
                    .delete(*product_type, &product.unique_name)?
                {
                    debug!(
                        %product_type,
                        unique_name = product.unique_name,
                        "report cancelled"
                    );
                    continue;
                }
                // Some classes key their records by another name (SUA
                // schedules); match those on the report identity
                if product.report_number.is_none() {
                    continue;
                }
                for doc in self.store.by_type(*product_type)? {
                    if doc.product.report_number == product.report_number
                        && doc.product.report_year == product.report_year
                    {
                        self.store.delete(
                            *product_type,
                            &doc.product.unique_name,
                        )?;
                    }
                }
            }
            if self.settings.annotate_crl {
                crl::annotate(&mut self.store, Some(product_id), now)?;
            }
            return Ok(());
        }

        if let Some(index) = &self.location {
            let matched =
                location::enrich(&mut product, index, &self.settings);
            if !matched && !self.settings.save_unmatched_pireps {
                debug!(
                    unique_name = product.unique_name,
                    "unmatched PIREP dropped"
                );
                return Ok(());
            }
        }

        if let (Some(product_id), Some(payload)) =
            (product.product_id, product.image.clone())
        {
            self.rasters
                .apply(product.product_type, product_id, &payload, now);
            if self.legends_written.insert(product_id) {
                self.store.put_legend(
                    &product.product_type.to_string(),
                    &legend(product_id),
                )?;
            }
        }

        if let Some(crl_payload) = product.crl.clone() {
            if self.settings.immediate_crl_update {
                let removed =
                    crl::remove_unlisted(&mut self.store, &crl_payload)?;
                if removed > 0 {
                    debug!(removed, "reports no longer listed by station");
                }
            }
        }

        let crl_class_touched = match product.product_type {
            t if t.is_crl() => t.crl_class(),
            t if t.is_twgo() => product
                .product_id
                .filter(|id| ProductType::crl_for(*id).is_some()),
            _ => None,
        };

        self.store.upsert(&StoredProduct {
            insert_time: now,
            product,
        })?;

        if let (Some(class), true) =
            (crl_class_touched, self.settings.annotate_crl)
        {
            crl::annotate(&mut self.store, Some(class), now)?;
        }
        Ok(())
    }

    /// Read spool files in name order, apply and delete. A transient
    /// store error leaves the current file in place for the retry.
    pub fn ingest_spool(&mut self) -> Result<usize, StoreError> {
        let Ok(files) = ordered_spool_files(&self.settings.spool_dir)
        else {
            return Ok(0);
        };
        let mut applied = 0;
        for path in files {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(error) => {
                    warn!(?path, %error, "unreadable spool file set aside");
                    quarantine(&path);
                    continue;
                }
            };
            match serde_json::from_str::<Product>(&text) {
                Ok(product) => {
                    self.apply(product)?;
                    let _ = std::fs::remove_file(&path);
                    applied += 1;
                }
                Err(error) => {
                    warn!(?path, %error, "malformed spool file set aside");
                    quarantine(&path);
                }
            }
        }
        Ok(applied)
    }

    pub fn maintenance_due(&self) -> bool {
        let now = self.clock.now();
        match self.last_maintenance {
            None => true,
            Some(last) => {
                now - last
                    >= Duration::seconds(
                        self.settings.maint_interval_secs as i64,
                    )
            }
        }
    }

    /// One maintenance tick: expiration sweep, CRL re-annotation, and
    /// any image renders whose quiet period has elapsed
    pub fn maintenance(&mut self) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.last_maintenance = Some(now);

        if self.settings.expire_enabled {
            self.expire_sweep(now)?;
        }
        if self.settings.annotate_crl {
            crl::annotate(&mut self.store, None, now)?;
        }
        let image_dir = self.settings.image_dir.clone();
        let rendered = self.rasters.render_due(now, &image_dir);
        if !rendered.is_empty() {
            debug!(count = rendered.len(), "imagery re-rendered");
        }
        Ok(())
    }

    fn expire_sweep(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut removed = 0;
        for (product_type, unique_name) in self.store.expired(now)? {
            // Smart TWGO retention: hold the record for up to an hour
            // past the last geometry stop, unless bypassed
            if product_type.is_twgo()
                && !self.settings.bypass_smart_expiration
            {
                if let Some(doc) =
                    self.store.get(product_type, &unique_name)?
                {
                    if let Some(stop) = doc.product.last_geometry_stop() {
                        if stop + Duration::hours(1) > now {
                            continue;
                        }
                    }
                }
            }
            if product_type.is_image() {
                self.drop_raster_block(&unique_name, now);
            }
            if self.store.delete(product_type, &unique_name)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, at = %now, "expired products removed");
        }
        Ok(())
    }

    /// Image unique names are `product-scale-block`
    fn drop_raster_block(&mut self, unique_name: &str, now: DateTime<Utc>) {
        let mut parts = unique_name.splitn(3, '-');
        let (Some(product), Some(scale), Some(block)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return;
        };
        if let (Ok(product_id), Ok(scale), Ok(block_number)) =
            (product.parse(), scale.parse(), block.parse())
        {
            self.rasters
                .remove_block(product_id, scale, block_number, now);
        }
    }
}

fn quarantine(path: &Path) {
    let mut bad = path.to_path_buf();
    bad.set_extension("bad");
    let _ = std::fs::rename(path, bad);
}
