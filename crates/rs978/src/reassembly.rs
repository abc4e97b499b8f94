use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::Settings;
use crate::decode::products::{
    CrlRecord, ImageBlockRecord, PayloadRecord, ServiceStatusRecord,
    TwgoGraphics, TwgoRecord, TwgoText,
};
use crate::decode::time::PartialTime;
use crate::decode::{products, FrameRecord, PacketRecord, SegmentRecord};
use crate::errors::{ErrorSink, FisbError};

/**
 * L1 joins segmented payloads and pairs the two halves of TWGO reports.
 *
 * Segments are keyed by (station, product id, report id); a payload is
 * only re-presented to its product decoder once every fragment 0..N-1 is
 * in hand. Partial buffers die after the segment TTL.
 *
 * TWGO text is emitted immediately and retained for matching; graphics
 * buffer until their text is active, then the pair goes out. A later
 * arrival under the same key replaces the earlier one; report-status 0 in
 * the text clears both halves and emits a cancellation.
 */

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct SegmentKey {
    pub station: String,
    pub product_id: u16,
    pub report_id: u16,
}

#[derive(Debug)]
struct SegmentBuffer {
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    /// Header time of the lowest-index fragment seen
    lowest_index: u8,
    time: PartialTime,
    deadline: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct TwgoKey {
    pub product_id: u16,
    pub report_number: u16,
    pub report_year: u8,
}

#[derive(Debug, Clone)]
struct HeldText {
    record: TwgoText,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct HeldGraphics {
    record: TwgoGraphics,
    station: String,
    deadline: DateTime<Utc>,
}

/// A fully reassembled unit ready for product synthesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assembled {
    pub station: String,
    pub rcvd_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    pub time: PartialTime,
    pub kind: AssembledKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssembledKind {
    Text { reports: Vec<String> },
    TwgoText(TwgoText),
    TwgoPaired { text: TwgoText, graphics: TwgoGraphics },
    TwgoCancel { report_number: u16, report_year: u8 },
    Crl(CrlRecord),
    Image(ImageBlockRecord),
    ServiceStatus(ServiceStatusRecord),
}

pub struct Reassembler {
    settings: Settings,
    segments: HashMap<SegmentKey, SegmentBuffer>,
    texts: HashMap<TwgoKey, HeldText>,
    graphics: HashMap<TwgoKey, HeldGraphics>,
}

impl Reassembler {
    pub fn new(settings: Settings) -> Self {
        Reassembler {
            settings,
            segments: HashMap::new(),
            texts: HashMap::new(),
            graphics: HashMap::new(),
        }
    }

    /// Feed one packet; returns everything that became complete
    pub fn ingest(
        &mut self,
        packet: &PacketRecord,
        sink: &mut ErrorSink,
    ) -> Vec<Assembled> {
        self.sweep(packet.rcvd_time, sink);
        let mut out = Vec::new();
        for frame in &packet.frames {
            match frame {
                FrameRecord::Apdu(apdu) => self.payload(
                    &packet.station,
                    packet.rcvd_time,
                    apdu.product_id,
                    apdu.time,
                    &apdu.payload,
                    &mut out,
                ),
                FrameRecord::Segment(segment) => {
                    if let Some((time, bytes)) = self.fragment(
                        &packet.station,
                        packet.rcvd_time,
                        segment,
                    ) {
                        match products::decode_payload(
                            segment.product_id,
                            &bytes,
                            &self.settings,
                        ) {
                            Ok(payload) => self.payload(
                                &packet.station,
                                packet.rcvd_time,
                                segment.product_id,
                                time,
                                &payload,
                                &mut out,
                            ),
                            Err(error) => {
                                sink.record(&error, &packet.station)
                            }
                        }
                    }
                }
                FrameRecord::ServiceStatus(status) => out.push(Assembled {
                    station: packet.station.clone(),
                    rcvd_time: packet.rcvd_time,
                    product_id: None,
                    time: PartialTime::default(),
                    kind: AssembledKind::ServiceStatus(status.clone()),
                }),
            }
        }
        out
    }

    /// Store one fragment; a complete set comes back concatenated with the
    /// header time of fragment zero
    fn fragment(
        &mut self,
        station: &str,
        rcvd_time: DateTime<Utc>,
        segment: &SegmentRecord,
    ) -> Option<(PartialTime, Vec<u8>)> {
        let key = SegmentKey {
            station: station.to_owned(),
            product_id: segment.product_id,
            report_id: segment.report_id,
        };
        let ttl = Duration::seconds(self.settings.segment_ttl_secs as i64);
        let buffer = self.segments.entry(key.clone()).or_insert_with(|| {
            SegmentBuffer {
                fragments: vec![None; segment.segment_count as usize],
                received: 0,
                lowest_index: u8::MAX,
                time: segment.time,
                deadline: rcvd_time + ttl,
            }
        });
        if buffer.fragments.len() != segment.segment_count as usize {
            // A new transmission with a different shape supersedes
            *buffer = SegmentBuffer {
                fragments: vec![None; segment.segment_count as usize],
                received: 0,
                lowest_index: u8::MAX,
                time: segment.time,
                deadline: rcvd_time + ttl,
            };
        }
        let index = segment.segment_number as usize;
        if buffer.fragments[index].is_none() {
            buffer.fragments[index] = Some(segment.payload.clone());
            buffer.received += 1;
        }
        if segment.segment_number < buffer.lowest_index {
            buffer.lowest_index = segment.segment_number;
            buffer.time = segment.time;
        }
        if buffer.received == buffer.fragments.len() {
            let buffer = self.segments.remove(&key).expect("buffer present");
            let mut bytes = Vec::new();
            for fragment in buffer.fragments.into_iter().flatten() {
                bytes.extend_from_slice(&fragment);
            }
            return Some((buffer.time, bytes));
        }
        if self.segments.len() > self.settings.segment_table_cap {
            self.evict_oldest_segment();
        }
        None
    }

    fn payload(
        &mut self,
        station: &str,
        rcvd_time: DateTime<Utc>,
        product_id: u16,
        time: PartialTime,
        payload: &PayloadRecord,
        out: &mut Vec<Assembled>,
    ) {
        let assembled = |kind| Assembled {
            station: station.to_owned(),
            rcvd_time,
            product_id: Some(product_id),
            time,
            kind,
        };
        match payload {
            PayloadRecord::Text { reports } => {
                out.push(assembled(AssembledKind::Text {
                    reports: reports.clone(),
                }))
            }
            PayloadRecord::Image(block) => {
                out.push(assembled(AssembledKind::Image(block.clone())))
            }
            PayloadRecord::Twgo { records } => {
                self.twgo(station, rcvd_time, product_id, time, records, out)
            }
        }
    }

    /// Register every record of the payload, then emit. A report whose
    /// two halves are both in hand emits exactly one paired record; text
    /// with no graphics anywhere emits alone and stays retained.
    fn twgo(
        &mut self,
        station: &str,
        rcvd_time: DateTime<Utc>,
        product_id: u16,
        time: PartialTime,
        records: &[TwgoRecord],
        out: &mut Vec<Assembled>,
    ) {
        let assembled = |kind| Assembled {
            station: station.to_owned(),
            rcvd_time,
            product_id: Some(product_id),
            time,
            kind,
        };
        let key_for = |number: u16, year: u8| TwgoKey {
            product_id,
            report_number: number,
            report_year: year,
        };
        let mut text_keys: Vec<TwgoKey> = Vec::new();
        let mut graphics_keys: Vec<TwgoKey> = Vec::new();

        for record in records {
            match record {
                TwgoRecord::Crl(crl) => {
                    out.push(assembled(AssembledKind::Crl(crl.clone())))
                }
                TwgoRecord::Text(text) => {
                    let key =
                        key_for(text.report_number, text.report_year);
                    if !text.active {
                        // Cancellation clears both halves
                        self.texts.remove(&key);
                        self.graphics.remove(&key);
                        text_keys.retain(|k| *k != key);
                        graphics_keys.retain(|k| *k != key);
                        out.push(assembled(AssembledKind::TwgoCancel {
                            report_number: text.report_number,
                            report_year: text.report_year,
                        }));
                        continue;
                    }
                    self.texts.insert(
                        key.clone(),
                        HeldText {
                            record: text.clone(),
                            last_seen: rcvd_time,
                        },
                    );
                    if self.texts.len() > self.settings.twgo_table_cap {
                        self.evict_oldest_text();
                    }
                    if !text_keys.contains(&key) {
                        text_keys.push(key);
                    }
                }
                TwgoRecord::Graphics(graphics) => {
                    if !graphics.active {
                        debug!(
                            report_number = graphics.report_number,
                            "inactive graphics record ignored"
                        );
                        continue;
                    }
                    let key = key_for(
                        graphics.report_number,
                        graphics.report_year,
                    );
                    self.graphics.insert(
                        key.clone(),
                        HeldGraphics {
                            record: graphics.clone(),
                            station: station.to_owned(),
                            deadline: rcvd_time
                                + Duration::seconds(
                                    self.settings.twgo_ttl_secs as i64,
                                ),
                        },
                    );
                    if self.graphics.len() > self.settings.twgo_table_cap
                    {
                        self.evict_oldest_graphics();
                    }
                    if !graphics_keys.contains(&key) {
                        graphics_keys.push(key);
                    }
                }
            }
        }

        for key in &graphics_keys {
            let (Some(text), Some(graphics)) =
                (self.texts.get(key), self.graphics.get(key))
            else {
                continue; // buffered until its text shows up
            };
            out.push(assembled(AssembledKind::TwgoPaired {
                text: text.record.clone(),
                graphics: graphics.record.clone(),
            }));
        }
        for key in &text_keys {
            if graphics_keys.contains(key) {
                continue; // already paired above
            }
            let Some(text) = self.texts.get(key) else {
                continue;
            };
            match self.graphics.get(key) {
                Some(graphics) => {
                    out.push(assembled(AssembledKind::TwgoPaired {
                        text: text.record.clone(),
                        graphics: graphics.record.clone(),
                    }))
                }
                None => out.push(assembled(AssembledKind::TwgoText(
                    text.record.clone(),
                ))),
            }
        }
    }

    /// One monotonic pass over both tables; orphaned graphics older than
    /// the TWGO TTL and incomplete segment sets older than the segment TTL
    /// are dropped
    pub fn sweep(&mut self, now: DateTime<Utc>, sink: &mut ErrorSink) {
        let expired: Vec<SegmentKey> = self
            .segments
            .iter()
            .filter(|(_, buffer)| buffer.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.segments.remove(&key);
            sink.record(&FisbError::SegmentTimeout(key.report_id), &key.station);
        }

        let texts = &self.texts;
        let orphans: Vec<TwgoKey> = self
            .graphics
            .iter()
            .filter(|(key, held)| {
                held.deadline <= now && !texts.contains_key(key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in orphans {
            let held = self.graphics.remove(&key).expect("orphan present");
            sink.record(
                &FisbError::TwgoOrphan(format!(
                    "{}-{:02}",
                    key.report_number, key.report_year
                )),
                &held.station,
            );
        }
    }

    /// Input closed: drop what never completed, with counters
    pub fn drain(&mut self, sink: &mut ErrorSink) {
        for key in self.segments.keys() {
            sink.record(
                &FisbError::SegmentTimeout(key.report_id),
                &key.station,
            );
        }
        self.segments.clear();
        self.graphics.clear();
        self.texts.clear();
    }

    fn evict_oldest_segment(&mut self) {
        if let Some(key) = self
            .segments
            .iter()
            .min_by_key(|(_, buffer)| buffer.deadline)
            .map(|(key, _)| key.clone())
        {
            debug!(?key, "segment table pressure, evicting oldest");
            self.segments.remove(&key);
        }
    }

    fn evict_oldest_text(&mut self) {
        if let Some(key) = self
            .texts
            .iter()
            .min_by_key(|(_, held)| held.last_seen)
            .map(|(key, _)| key.clone())
        {
            self.texts.remove(&key);
        }
    }

    fn evict_oldest_graphics(&mut self) {
        if let Some(key) = self
            .graphics
            .iter()
            .min_by_key(|(_, held)| held.deadline)
            .map(|(key, _)| key.clone())
        {
            self.graphics.remove(&key);
        }
    }

    pub fn pending_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn pending_graphics(&self) -> usize {
        self.graphics.len()
    }
}
