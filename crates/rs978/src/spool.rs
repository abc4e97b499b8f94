use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::model::Product;

/**
 * Crash-tolerant handoff between L3 and the curator: one JSON document
 * per file, named so that lexicographic order is arrival order. Writes
 * land under a tmp name and rename into place, so the curator never
 * reads a torn file.
 */

/// `YYYYMMDDTHHMMSS.nnnnnn-seq.json`
pub fn spool_filename(time: DateTime<Utc>, seq: u64) -> String {
    format!("{}-{seq:06}.json", time.format("%Y%m%dT%H%M%S%.6f"))
}

pub struct SpoolWriter {
    dir: PathBuf,
    seq: u64,
}

impl SpoolWriter {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SpoolWriter { dir, seq: 0 })
    }

    pub fn write(
        &mut self,
        product: &Product,
        now: DateTime<Utc>,
    ) -> std::io::Result<PathBuf> {
        let name = spool_filename(now, self.seq);
        self.seq = self.seq.wrapping_add(1);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let json = serde_json::to_string(product)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// Spool files in application order; tmp files are invisible
pub fn ordered_spool_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProductType;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_filename_order_is_temporal_order() {
        let t0 = Utc
            .with_ymd_and_hms(2021, 5, 14, 7, 18, 0)
            .unwrap()
            + Duration::microseconds(999_999);
        let names = [
            spool_filename(t0, 0),
            spool_filename(t0, 1),
            spool_filename(t0 + Duration::microseconds(1), 0),
            spool_filename(t0 + Duration::seconds(1), 0),
        ];
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
        assert_eq!(names[0], "20210514T071800.999999-000000.json");
    }

    #[test]
    fn test_writer_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpoolWriter::new(dir.path()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2021, 5, 14, 7, 18, 0).unwrap();
        let product = Product::new(
            ProductType::Metar,
            "KOCQ",
            t0,
            t0 + Duration::hours(2),
        );
        writer.write(&product, t0).unwrap();
        writer.write(&product, t0 + Duration::seconds(1)).unwrap();

        let files = ordered_spool_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        let text = std::fs::read_to_string(&files[0]).unwrap();
        let back: Product = serde_json::from_str(&text).unwrap();
        assert_eq!(back.unique_name, "KOCQ");
    }
}
