use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::raster::RasterSet;
use crate::store::{Store, StoreError};
use crate::vectors;

/**
 * Test-mode trigger dumps. Trickle schedules assertions at virtual
 * times; when one comes due the curator snapshots the per-type store
 * views, copies the current PNGs and exports the vector CSV into a
 * per-trigger directory. A failed dump surfaces the condition and the
 * run continues.
 */

/// `seconds_after_midnight, offset_seconds, sequence_number, message`
#[derive(Debug, Deserialize)]
struct TriggerRow {
    seconds_after_midnight: f64,
    offset_seconds: f64,
    sequence_number: u32,
    message: String,
}

/// `group, date` rows anchoring each test group
#[derive(Debug, Deserialize)]
struct StartDateRow {
    group: u32,
    date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub at: DateTime<Utc>,
    pub sequence_number: u32,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct TriggerSchedule {
    pending: Vec<Trigger>,
}

impl TriggerSchedule {
    /// Load the trigger list for one test group
    pub fn load(
        triggers_csv: &Path,
        start_dates_csv: &Path,
        group: u32,
    ) -> anyhow::Result<Self> {
        let mut dates = csv::Reader::from_path(start_dates_csv)?;
        let anchor = dates
            .deserialize::<StartDateRow>()
            .filter_map(|row| row.ok())
            .find(|row| row.group == group)
            .ok_or_else(|| {
                anyhow::anyhow!("no start date for test group {group}")
            })?;
        let midnight = anchor
            .date
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists")
            .and_utc();

        let mut reader = csv::Reader::from_path(triggers_csv)?;
        let mut pending = Vec::new();
        for row in reader.deserialize::<TriggerRow>() {
            let row = row?;
            pending.push(Trigger {
                at: midnight
                    + Duration::milliseconds(
                        ((row.seconds_after_midnight + row.offset_seconds)
                            * 1e3) as i64,
                    ),
                sequence_number: row.sequence_number,
                message: row.message,
            });
        }
        pending.sort_by_key(|trigger| trigger.at);
        Ok(TriggerSchedule { pending })
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Triggers whose virtual time has arrived
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Trigger> {
        let split = self
            .pending
            .iter()
            .position(|trigger| trigger.at > now)
            .unwrap_or(self.pending.len());
        self.pending.drain(..split).collect()
    }
}

/// Snapshot the store, imagery and vectors under
/// `<dump_dir>/trigger-<seq>/`
pub fn dump<S: Store>(
    store: &S,
    rasters: &RasterSet,
    image_dir: &Path,
    dump_dir: &Path,
    trigger: &Trigger,
) -> Result<PathBuf, StoreError> {
    let target = dump_dir.join(format!("trigger-{:04}", trigger.sequence_number));
    fs::create_dir_all(&target)
        .map_err(|e| StoreError::Permanent(e.to_string()))?;

    for product_type in store.types_present()? {
        let docs = store.by_type(product_type)?;
        let json = serde_json::to_string_pretty(&docs)?;
        fs::write(target.join(format!("{product_type}.json")), json)
            .map_err(|e| StoreError::Permanent(e.to_string()))?;
    }

    for key in rasters.keys() {
        if let Some(raster) = rasters.get(key.product_id, key.scale) {
            let stem = format!("{}-{}", raster.product_type, key.scale);
            for extension in ["png", "wld"] {
                let source = image_dir.join(format!("{stem}.{extension}"));
                if source.exists() {
                    let _ = fs::copy(
                        &source,
                        target.join(format!("{stem}.{extension}")),
                    );
                }
            }
        }
    }

    let mut csv_out = Vec::new();
    vectors::dump_vectors(store, &mut csv_out)?;
    fs::write(target.join("vectors.csv"), csv_out)
        .map_err(|e| StoreError::Permanent(e.to_string()))?;

    info!(
        sequence = trigger.sequence_number,
        message = trigger.message,
        "trigger dump written"
    );
    Ok(target)
}

/// Run one due trigger, surfacing failures without stopping the run
pub fn fire<S: Store>(
    store: &S,
    rasters: &RasterSet,
    image_dir: &Path,
    dump_dir: &Path,
    trigger: &Trigger,
) {
    if let Err(error) = dump(store, rasters, image_dir, dump_dir, trigger) {
        warn!(
            sequence = trigger.sequence_number,
            %error,
            "trigger dump failed, run continues"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use rs978::config::Settings;

    #[test]
    fn test_schedule_ordering_and_due() {
        let dir = tempfile::tempdir().unwrap();
        let triggers = dir.path().join("triggers.csv");
        fs::write(
            &triggers,
            "seconds_after_midnight,offset_seconds,sequence_number,message\n\
             3600,0.5,2,after first hour\n\
             60,0,1,first minute\n",
        )
        .unwrap();
        let start_dates = dir.path().join("start-dates.csv");
        fs::write(&start_dates, "group,date\n3,2021-05-14\n").unwrap();

        let mut schedule =
            TriggerSchedule::load(&triggers, &start_dates, 3).unwrap();
        assert!(!schedule.is_empty());

        let early: DateTime<Utc> = "2021-05-14T00:00:30Z".parse().unwrap();
        assert!(schedule.due(early).is_empty());

        let first: DateTime<Utc> = "2021-05-14T00:01:00Z".parse().unwrap();
        let due = schedule.due(first);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].sequence_number, 1);

        let rest: DateTime<Utc> = "2021-05-14T02:00:00Z".parse().unwrap();
        assert_eq!(schedule.due(rest).len(), 1);
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_dump_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemStore::new();
        let rasters = RasterSet::new(Settings::default());
        let trigger = Trigger {
            at: "2021-05-14T00:01:00Z".parse().unwrap(),
            sequence_number: 7,
            message: "check".into(),
        };
        let target = dump(
            &store,
            &rasters,
            dir.path(),
            dir.path(),
            &trigger,
        )
        .unwrap();
        assert!(target.ends_with("trigger-0007"));
        assert!(target.join("vectors.csv").exists());
    }
}
