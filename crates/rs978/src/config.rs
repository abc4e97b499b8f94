use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One immutable configuration value handed to each stage at construction.
///
/// Defaults match a production run; the test harness replaces the whole
/// value per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Spool directory between L3 and the curator
    pub spool_dir: PathBuf,
    /// Directory receiving rendered PNGs and world files
    pub image_dir: PathBuf,
    /// Trickle sync file; absent in production
    pub sync_file: PathBuf,
    pub maint_interval_secs: u64,
    pub expire_enabled: bool,
    pub annotate_crl: bool,
    /// Remove locally stored reports a station no longer lists
    pub immediate_crl_update: bool,
    pub image_quiet_seconds: u64,
    /// 0: sentinels transparent, 1: distinct debug colors, 2: both the
    /// configured not-included color
    pub image_map_configuration: u8,
    pub not_included_rgb: [u8; 3],
    /// Per-product-id replacement of the leading palette entries (RGBA)
    pub palette_overrides: BTreeMap<u16, Vec<[u8; 4]>>,
    pub location_wx: bool,
    pub location_pirep: bool,
    pub location_sua: bool,
    /// Keep PIREPs whose base fix cannot be resolved
    pub save_unmatched_pireps: bool,
    /// PIREP cardinality makes deduplication lossy; forward them all
    pub always_forward_pireps: bool,
    /// L3 re-forwards an unchanged product after this long, as a heartbeat
    /// against silent store loss
    pub refresh_floor_secs: u64,
    pub dedup_cache_cap: usize,
    pub segment_ttl_secs: u64,
    pub segment_table_cap: usize,
    pub twgo_ttl_secs: u64,
    pub twgo_table_cap: usize,
    /// Force TWGO expiration to `twgo_fixed_ttl_secs` for test determinism
    pub bypass_smart_expiration: bool,
    pub twgo_fixed_ttl_secs: u64,
    /// Preserve reserved bit-fields verbatim in L0 output
    pub detailed: bool,
    /// Decode a trailing 4-or-5-bit DLAC remnant instead of discarding it
    pub legacy_dlac: bool,
    pub rsr_enabled: bool,
    pub rsr_window_secs: u64,
    pub rsr_interval_secs: u64,
    pub retry_db_conn_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            spool_dir: PathBuf::from("spool"),
            image_dir: PathBuf::from("images"),
            sync_file: PathBuf::from("sync.fisb"),
            maint_interval_secs: 10,
            expire_enabled: true,
            annotate_crl: true,
            immediate_crl_update: false,
            image_quiet_seconds: 10,
            image_map_configuration: 0,
            not_included_rgb: [0x60, 0x60, 0x60],
            palette_overrides: BTreeMap::new(),
            location_wx: false,
            location_pirep: false,
            location_sua: false,
            save_unmatched_pireps: true,
            always_forward_pireps: true,
            refresh_floor_secs: 1800,
            dedup_cache_cap: 20_000,
            segment_ttl_secs: 60,
            segment_table_cap: 256,
            twgo_ttl_secs: 12 * 3600,
            twgo_table_cap: 4096,
            bypass_smart_expiration: false,
            twgo_fixed_ttl_secs: 8 * 3600,
            detailed: false,
            legacy_dlac: false,
            rsr_enabled: false,
            rsr_window_secs: 30,
            rsr_interval_secs: 10,
            retry_db_conn_secs: 60,
        }
    }
}
