use crate::decode::{
    APDU_BYTES, APP_DATA_BYTES, FRAME_TYPE_APDU, FRAME_TYPE_SERVICE_STATUS,
    UPLINK_HEADER_BYTES,
};
use crate::decode::dlac;
use crate::errors::FisbError;

/**
 * Frame packing for the test fixtures and replay tooling: the inverse of
 * the L0 decoders, enough to synthesize well-formed capture payloads.
 * Kept next to the decoders so the two sides of the framing stay in one
 * file pair.
 */

struct BitPacker {
    bits: Vec<bool>,
}

impl BitPacker {
    fn new() -> Self {
        BitPacker { bits: Vec::new() }
    }

    fn push(&mut self, value: u32, width: usize) {
        for i in (0..width).rev() {
            self.bits.push(value >> i & 1 == 1);
        }
    }

    fn push_signed_angle(&mut self, degrees: f64, width: usize) {
        let raw = (degrees / (360.0 / 16_777_216.0)).round() as i64;
        let mask = (1i64 << width) - 1;
        self.push((raw & mask) as u32, width);
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut bytes = vec![0u8; (self.bits.len() + 7) / 8];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (7 - i % 8);
            }
        }
        bytes
    }
}

/// Optional APDU time fields, mirroring the four t_opt layouts
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeFields {
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
}

impl TimeFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn day_hour_minute(day: u32, hour: u32, minute: u32) -> Self {
        TimeFields {
            day: Some(day),
            hour: Some(hour),
            minute: Some(minute),
            ..Default::default()
        }
    }

    pub fn month_day_hour_minute(
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
    ) -> Self {
        TimeFields {
            month: Some(month),
            ..Self::day_hour_minute(day, hour, minute)
        }
    }

    pub fn hour_minute_second(hour: u32, minute: u32, second: u32) -> Self {
        TimeFields {
            hour: Some(hour),
            minute: Some(minute),
            second: Some(second),
            ..Default::default()
        }
    }

    fn t_opt(&self) -> u32 {
        match (self.month, self.day, self.second) {
            (Some(_), _, _) => 1,
            (None, Some(_), _) => 2,
            (None, None, Some(_)) => 3,
            _ => {
                if self.hour.is_some() {
                    3
                } else {
                    0
                }
            }
        }
    }
}

fn apdu_header(
    product_id: u16,
    time: &TimeFields,
    segmented: bool,
) -> Vec<u8> {
    let mut packer = BitPacker::new();
    packer.push(0, 3); // a, g, p flags
    packer.push(segmented as u32, 1);
    packer.push(product_id as u32, 11);
    let t_opt = time.t_opt();
    packer.push(t_opt, 2);
    match t_opt {
        1 => {
            packer.push(time.month.unwrap_or(1), 4);
            packer.push(time.day.unwrap_or(1), 5);
            packer.push(time.hour.unwrap_or(0), 5);
            packer.push(time.minute.unwrap_or(0), 6);
            packer.push(0, 3);
        }
        2 => {
            packer.push(time.day.unwrap_or(1), 5);
            packer.push(time.hour.unwrap_or(0), 5);
            packer.push(time.minute.unwrap_or(0), 6);
            packer.push(0, 7);
        }
        3 => {
            packer.push(time.hour.unwrap_or(0), 5);
            packer.push(time.minute.unwrap_or(0), 6);
            packer.push(time.second.unwrap_or(0), 6);
            packer.push(0, 6);
        }
        _ => packer.push(0, 7),
    }
    packer.into_bytes()
}

fn frame(frame_type: u8, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() + 2);
    let length = data.len() as u16; // 9 bits
    bytes.push((length >> 1) as u8);
    bytes.push(((length as u8 & 1) << 7) | (frame_type & 0x0f));
    bytes.extend_from_slice(data);
    bytes
}

/// A frame-type-0 frame carrying an unsegmented APDU
pub fn apdu_frame(product_id: u16, time: &TimeFields, payload: &[u8]) -> Vec<u8> {
    let mut data = apdu_header(product_id, time, false);
    data.extend_from_slice(payload);
    frame(FRAME_TYPE_APDU, &data)
}

/// One fragment of a segmented APDU
pub fn segment_frame(
    product_id: u16,
    time: &TimeFields,
    report_id: u16,
    segment_number: u8,
    segment_count: u8,
    fragment: &[u8],
) -> Vec<u8> {
    let mut data = apdu_header(product_id, time, true);
    data.extend_from_slice(&report_id.to_be_bytes());
    data.push(segment_number);
    data.push(segment_count);
    data.extend_from_slice(fragment);
    frame(FRAME_TYPE_APDU, &data)
}

pub fn service_status_frame(addresses: &[u32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(addresses.len() * 4);
    for address in addresses {
        data.push(0x01);
        data.extend_from_slice(&address.to_be_bytes()[1..4]);
    }
    frame(FRAME_TYPE_SERVICE_STATUS, &data)
}

/// DLAC-packed generic text payload
pub fn text_payload(text: &str) -> Result<Vec<u8>, FisbError> {
    dlac::encode(text)
}

/// A full 216-byte APDU: uplink header plus frames, zero-filled
pub fn packet(
    latitude: f64,
    longitude: f64,
    slot_id: u8,
    site_id: u8,
    frames: &[Vec<u8>],
) -> Vec<u8> {
    let mut packer = BitPacker::new();
    packer.push_signed_angle(latitude, 23);
    packer.push_signed_angle(longitude, 24);
    packer.push(1, 1); // position valid
    packer.push(1, 1); // utc coupled
    packer.push(1, 1); // app data valid
    packer.push(slot_id as u32, 5);
    packer.push(site_id as u32, 4);
    packer.push(0, 5);
    let mut bytes = packer.into_bytes();
    debug_assert_eq!(bytes.len(), UPLINK_HEADER_BYTES);
    for f in frames {
        bytes.extend_from_slice(f);
    }
    assert!(
        bytes.len() <= APDU_BYTES,
        "frames exceed {APP_DATA_BYTES} bytes of application data"
    );
    bytes.resize(APDU_BYTES, 0);
    bytes
}

/// A complete capture line around the packed APDU
pub fn capture_line(bytes: &[u8], unix_time: f64) -> String {
    format!("+{};rs=0;rssi=-18.2;t={unix_time:.6};", hex::encode(bytes))
}

fn record_header(
    format: u8,
    body_len: usize,
    number: u16,
    year: u8,
    active: bool,
) -> Vec<u8> {
    let mut packer = BitPacker::new();
    packer.push(format as u32, 4);
    packer.push(1, 4); // product version
    packer.push((6 + body_len) as u32, 16);
    packer.push(number as u32, 14);
    packer.push(year as u32, 5);
    packer.push(active as u32, 1);
    packer.push(0, 4);
    packer.into_bytes()
}

/// A TWGO text record around DLAC-packed text
pub fn twgo_text_record(
    number: u16,
    year: u8,
    active: bool,
    text: &str,
) -> Result<Vec<u8>, FisbError> {
    let packed = dlac::encode(text)?;
    let mut record = record_header(2, packed.len(), number, year, active);
    record.extend_from_slice(&packed);
    Ok(record)
}

/// One overlay object of a graphics fixture
#[derive(Debug, Clone)]
pub struct OverlayFixture {
    /// 3 polygon, 7 circle, 9 point, 11 linestring
    pub geometry_type: u8,
    pub msl: bool,
    pub vertices: Vec<(f64, f64)>,
    /// (primary, secondary) in NM; secondary 0 means a true circle
    pub radius_nm: Option<(f64, f64)>,
    /// Raw hundreds of feet; 0xffff is unlimited
    pub altitude: (u16, u16),
    /// start and stop as (month, day, hour, minute)
    pub window: Option<((u32, u32, u32, u32), (u32, u32, u32, u32))>,
}

impl OverlayFixture {
    pub fn circle(
        lon: f64,
        lat: f64,
        radius_nm: f64,
        window: ((u32, u32, u32, u32), (u32, u32, u32, u32)),
    ) -> Self {
        OverlayFixture {
            geometry_type: 7,
            msl: true,
            vertices: vec![(lon, lat)],
            radius_nm: Some((radius_nm, 0.0)),
            altitude: (0, 0xffff),
            window: Some(window),
        }
    }

    pub fn polygon(vertices: Vec<(f64, f64)>) -> Self {
        OverlayFixture {
            geometry_type: 3,
            msl: true,
            vertices,
            radius_nm: None,
            altitude: (0, 0xffff),
            window: None,
        }
    }
}

/// A TWGO graphics record holding the given overlay objects
pub fn twgo_graphics_record(
    number: u16,
    year: u8,
    objects: &[OverlayFixture],
) -> Vec<u8> {
    let mut packer = BitPacker::new();
    for object in objects {
        packer.push(object.geometry_type as u32, 4);
        packer.push(object.msl as u32, 4);
        packer.push(object.window.is_some() as u32, 1);
        packer.push(object.vertices.len() as u32, 7);
        if let Some((start, stop)) = object.window {
            for (month, day, hour, minute) in [start, stop] {
                packer.push(month, 4);
                packer.push(day, 5);
                packer.push(hour, 5);
                packer.push(minute, 6);
                packer.push(0, 12);
            }
        }
        packer.push(object.altitude.0 as u32, 16);
        packer.push(object.altitude.1 as u32, 16);
        for (lon, lat) in &object.vertices {
            packer.push_signed_angle(*lon, 24);
            packer.push_signed_angle(*lat, 24);
        }
        if let Some((primary, secondary)) = object.radius_nm {
            packer.push((primary * 10.0).round() as u32, 16);
            packer.push((secondary * 10.0).round() as u32, 16);
        }
    }
    let body = packer.into_bytes();
    let mut record = record_header(8, body.len(), number, year, true);
    record.extend_from_slice(&body);
    record
}

/// A CRL record: entries are (report number, year, has text, has graphics)
pub fn crl_record(
    product_class: u8,
    overflow: bool,
    entries: &[(u16, u8, bool, bool)],
) -> Vec<u8> {
    let mut packer = BitPacker::new();
    packer.push(product_class as u32, 8);
    packer.push(overflow as u32, 1);
    packer.push(0, 7);
    packer.push(entries.len() as u32, 8);
    for (number, year, text, graphics) in entries {
        packer.push(*year as u32, 5);
        packer.push(*number as u32, 14);
        packer.push(*text as u32, 1);
        packer.push(*graphics as u32, 1);
        packer.push(0, 3);
    }
    let body = packer.into_bytes();
    let mut record = record_header(15, body.len(), 0, 0, true);
    record.extend_from_slice(&body);
    record
}

/// Run-length encode 128 bins into an image block payload
pub fn image_block_rle(block_number: u32, scale: u8, bins: &[u8]) -> Vec<u8> {
    assert_eq!(bins.len(), 128, "a block holds exactly 128 bins");
    let mut packer = BitPacker::new();
    packer.push(1, 1);
    packer.push(block_number, 23);
    packer.push(scale as u32, 2);
    packer.push(0, 6);
    let mut data = packer.into_bytes();
    let mut index = 0;
    while index < bins.len() {
        let value = bins[index] & 0x07;
        let mut run = 1usize;
        while run < 32
            && index + run < bins.len()
            && bins[index + run] & 0x07 == value
        {
            run += 1;
        }
        data.push((((run - 1) as u8) << 3) | value);
        index += run;
    }
    data
}

/// The empty-block form: every listed block is all zero
pub fn image_block_empty(
    block_number: u32,
    scale: u8,
    others: &[u32],
) -> Vec<u8> {
    let mut packer = BitPacker::new();
    packer.push(0, 1);
    packer.push(block_number, 23);
    packer.push(scale as u32, 2);
    packer.push(0, 6);
    for number in others {
        packer.push(*number, 24);
    }
    packer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ApduHeader;
    use deku::prelude::*;

    #[test]
    fn test_header_lengths() {
        assert_eq!(apdu_header(413, &TimeFields::none(), false).len(), 3);
        assert_eq!(
            apdu_header(413, &TimeFields::day_hour_minute(14, 7, 15), false)
                .len(),
            5
        );
        assert_eq!(
            apdu_header(8, &TimeFields::hour_minute_second(7, 15, 30), false)
                .len(),
            5
        );
    }

    #[test]
    fn test_header_roundtrip() {
        let bytes = apdu_header(
            413,
            &TimeFields::month_day_hour_minute(5, 14, 7, 15),
            false,
        );
        let (_, header) = ApduHeader::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(header.product_id, 413);
        assert_eq!(header.t_opt, 1);
        assert_eq!(header.month, Some(5));
        assert_eq!(header.day, Some(14));
        assert_eq!(header.hours, Some(7));
        assert_eq!(header.minutes, Some(15));
        assert_eq!(header.seconds, None);
    }

    #[test]
    fn test_packet_is_full_size() {
        let bytes = packet(39.9, -84.2, 0, 0, &[]);
        assert_eq!(bytes.len(), APDU_BYTES);
    }
}
