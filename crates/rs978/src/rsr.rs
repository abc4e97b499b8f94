use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

use crate::config::Settings;
use crate::model::{Product, ProductType, RsrPayload};
use crate::synthesis::rsr_expiration;

/**
 * Radio Station Reception. L0 keeps a sliding window of packet arrivals
 * per ground station and periodically emits a synthetic product grading
 * how much of the station's declared schedule actually arrived.
 */

#[derive(Debug)]
struct StationState {
    arrivals: VecDeque<DateTime<Utc>>,
    last_heard: DateTime<Utc>,
}

pub struct StationRegistry {
    settings: Settings,
    stations: HashMap<String, StationState>,
    /// Packets per second each station is expected to transmit; stations
    /// not listed fall back to the schedule-derived default of one
    calibration: HashMap<String, f64>,
    last_emit: Option<DateTime<Utc>>,
}

pub const DEFAULT_EXPECTED_PER_SEC: f64 = 1.0;

impl StationRegistry {
    pub fn new(settings: Settings) -> Self {
        StationRegistry {
            settings,
            stations: HashMap::new(),
            calibration: HashMap::new(),
            last_emit: None,
        }
    }

    pub fn with_calibration(mut self, table: HashMap<String, f64>) -> Self {
        self.calibration = table;
        self
    }

    pub fn observe(&mut self, station: &str, rcvd_time: DateTime<Utc>) {
        let window =
            Duration::seconds(self.settings.rsr_window_secs as i64);
        let state = self
            .stations
            .entry(station.to_owned())
            .or_insert_with(|| StationState {
                arrivals: VecDeque::new(),
                last_heard: rcvd_time,
            });
        state.last_heard = rcvd_time;
        state.arrivals.push_back(rcvd_time);
        while let Some(front) = state.arrivals.front() {
            if rcvd_time - *front > window {
                state.arrivals.pop_front();
            } else {
                break;
            }
        }
    }

    /// Emit one RSR product per live station every emit interval
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Product> {
        if !self.settings.rsr_enabled {
            return Vec::new();
        }
        let interval =
            Duration::seconds(self.settings.rsr_interval_secs as i64);
        if let Some(last) = self.last_emit {
            if now - last < interval {
                return Vec::new();
            }
        }
        self.last_emit = Some(now);

        let window_secs = self.settings.rsr_window_secs;
        let window = Duration::seconds(window_secs as i64);
        let mut products = Vec::new();
        self.stations
            .retain(|_, state| now - state.last_heard <= window * 2);
        for (station, state) in &self.stations {
            let received = state
                .arrivals
                .iter()
                .filter(|arrival| now - **arrival <= window)
                .count() as u32;
            let expected_per_sec = self
                .calibration
                .get(station)
                .copied()
                .unwrap_or(DEFAULT_EXPECTED_PER_SEC);
            let percent = ((100.0 * received as f64)
                / (expected_per_sec * window_secs as f64))
                .round()
                .min(100.0) as u8;
            let mut product = Product::new(
                ProductType::Rsr,
                station.clone(),
                now,
                rsr_expiration(now, window_secs),
            );
            product.station = Some(station.clone());
            product.rsr = Some(RsrPayload {
                received,
                expected_per_sec,
                percent,
            });
            products.push(product);
        }
        products
    }
}
