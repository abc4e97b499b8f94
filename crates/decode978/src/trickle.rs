use chrono::Utc;
use rs978::decode::{parse_capture_line, ParsedLine};
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/**
 * The replay driver for test runs. An archived capture is paced out on
 * stdout at its original cadence (or a multiple), and the constant
 * offset between archive time and the wall is written to the sync file
 * so the curator's virtual clock replays the same moments the archive
 * saw. All it knows about the capture format is L0's line parser.
 */

pub async fn run(
    input: &Path,
    sync_file: &Path,
    speed: f64,
) -> anyhow::Result<()> {
    let file = fs::File::open(input).await?;
    let mut lines = BufReader::new(file).lines();

    let wall_start = Utc::now().timestamp() as f64
        + Utc::now().timestamp_subsec_micros() as f64 * 1e-6;
    let mut first_archive_time: Option<f64> = None;
    let mut replayed = 0u64;

    while let Some(line) = lines.next_line().await? {
        let archive_time = match parse_capture_line(&line) {
            Ok(ParsedLine::Fisb(capture)) => Some(capture.unix_time),
            _ => None,
        };

        if let Some(t) = archive_time {
            let first = *first_archive_time.get_or_insert_with(|| {
                // virtual_now = wall_now + offset lands on the archive's
                // own timeline
                let offset = t - wall_start;
                if let Err(error) =
                    std::fs::write(sync_file, format!("{offset:.6}\n"))
                {
                    tracing::warn!(%error, "sync file not written");
                } else {
                    info!(offset, sync = %sync_file.display(), "clock offset published");
                }
                t
            });

            let due = wall_start + (t - first) / speed;
            let now = Utc::now().timestamp() as f64
                + Utc::now().timestamp_subsec_micros() as f64 * 1e-6;
            if due > now {
                tokio::time::sleep(std::time::Duration::from_secs_f64(
                    due - now,
                ))
                .await;
            }
        }

        println!("{line}");
        replayed += 1;
    }
    info!(replayed, "archive replay finished");
    Ok(())
}
