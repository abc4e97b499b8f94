use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::{Arc, RwLock};

/**
 * The clock capability every expiration and trigger decision goes through.
 *
 * Production runs on the wall clock. Test replay runs on an offset clock:
 * the Trickle driver writes a sync file holding a signed offset in seconds,
 * and `virtual_now = wall_now + offset`. A manual clock exists for unit
 * tests that need full determinism.
 */
#[derive(Debug, Clone)]
pub struct Clock(Arc<Inner>);

#[derive(Debug)]
enum Inner {
    Wall,
    Offset(RwLock<Duration>),
    Manual(RwLock<DateTime<Utc>>),
}

impl Default for Clock {
    fn default() -> Self {
        Self::wall()
    }
}

impl Clock {
    pub fn wall() -> Self {
        Clock(Arc::new(Inner::Wall))
    }

    pub fn offset(offset: Duration) -> Self {
        Clock(Arc::new(Inner::Offset(RwLock::new(offset))))
    }

    /// A frozen clock advanced explicitly, for tests
    pub fn manual(start: DateTime<Utc>) -> Self {
        Clock(Arc::new(Inner::Manual(RwLock::new(start))))
    }

    /// Build from a Trickle sync file holding the offset in seconds
    /// (fractional allowed). A missing file means production time.
    pub fn from_sync_file(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::wall());
        }
        let raw = std::fs::read_to_string(path)?;
        let seconds: f64 = raw.trim().parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("sync file {}: {e}", path.display()),
            )
        })?;
        Ok(Self::offset(Duration::milliseconds((seconds * 1e3) as i64)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &*self.0 {
            Inner::Wall => Utc::now(),
            Inner::Offset(offset) => {
                Utc::now() + *offset.read().expect("clock lock poisoned")
            }
            Inner::Manual(now) => *now.read().expect("clock lock poisoned"),
        }
    }

    /// Re-synchronize an offset clock (Trickle rewrites the sync file
    /// between test groups); no-op for wall and manual clocks.
    pub fn set_offset(&self, offset: Duration) {
        if let Inner::Offset(lock) = &*self.0 {
            *lock.write().expect("clock lock poisoned") = offset;
        }
    }

    /// Advance a manual clock; no-op otherwise
    pub fn advance(&self, delta: Duration) {
        if let Inner::Manual(lock) = &*self.0 {
            let mut now = lock.write().expect("clock lock poisoned");
            *now += delta;
        }
    }

    /// Sleep until the given instant on this clock. A manual clock never
    /// sleeps: callers drive it with [`Clock::advance`].
    pub async fn sleep_until(&self, instant: DateTime<Utc>) {
        let now = self.now();
        if instant <= now {
            return;
        }
        if matches!(&*self.0, Inner::Manual(_)) {
            return;
        }
        let wait = (instant - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;
    }
}
