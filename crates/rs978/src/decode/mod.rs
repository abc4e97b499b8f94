pub mod bits;
pub mod dlac;
pub mod products;
pub mod time;
pub mod wire;

use chrono::{DateTime, Utc};
use deku::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::errors::{ErrorSink, FisbError};
use products::{PayloadRecord, ServiceStatusRecord};
use time::PartialTime;

/**
 * L0: capture lines in, structured packet records out.
 *
 * A capture line is `+<hex>;rs=<int>;rssi=<float>;t=<unix>;` for FIS-B
 * uplinks; `-` lines are UAT downlinks and are dropped. The hex payload is
 * the 216-byte APDU left after the upstream demodulator strips the FEC:
 * an eight-byte uplink header followed by 208 bytes of application data
 * carrying 1..N frames.
 *
 * Frame decoders are pure (bytes to record) and never take the pipeline
 * down: a malformed frame lands in the stage's error sink and the walk
 * continues with the next frame.
 */

pub const APDU_BYTES: usize = 216;
pub const UPLINK_HEADER_BYTES: usize = 8;
pub const APP_DATA_BYTES: usize = APDU_BYTES - UPLINK_HEADER_BYTES;

pub const FRAME_TYPE_APDU: u8 = 0;
pub const FRAME_TYPE_SERVICE_STATUS: u8 = 15;

static CAPTURE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([+-])([0-9A-Fa-f]+);rs=(-?\d+);rssi=(-?\d+(?:\.\d+)?);t=(\d+(?:\.\d+)?);\s*$",
    )
    .expect("capture line regex")
});

#[derive(Debug, PartialEq, Clone)]
pub struct CaptureLine {
    pub bytes: Vec<u8>,
    pub rs_errors: i32,
    pub rssi: f64,
    pub unix_time: f64,
}

impl CaptureLine {
    pub fn rcvd_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(
            self.unix_time as i64,
            (self.unix_time.fract() * 1e9) as u32,
        )
        .unwrap_or_default()
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum ParsedLine {
    Fisb(CaptureLine),
    /// `-` lines: UAT air-to-air, dropped with a counter bump
    Downlink,
}

pub fn parse_capture_line(line: &str) -> Result<ParsedLine, FisbError> {
    let captures = CAPTURE_LINE
        .captures(line)
        .ok_or_else(|| FisbError::LineFormat(preview(line)))?;
    if &captures[1] == "-" {
        return Ok(ParsedLine::Downlink);
    }
    let bytes = hex::decode(&captures[2])
        .map_err(|e| FisbError::LineFormat(e.to_string()))?;
    Ok(ParsedLine::Fisb(CaptureLine {
        bytes,
        rs_errors: captures[3].parse().unwrap_or(0),
        rssi: captures[4].parse().unwrap_or(0.0),
        unix_time: captures[5].parse().unwrap_or(0.0),
    }))
}

fn preview(line: &str) -> String {
    line.chars().take(40).collect()
}

/// The eight-byte uplink header: where the station is, which slot it
/// transmitted in, and whether the payload is usable
#[derive(Debug, PartialEq, DekuRead, Clone)]
#[deku(endian = "big")]
pub struct UplinkHeader {
    #[deku(bits = "23")]
    lat_raw: u32,
    #[deku(bits = "24")]
    lon_raw: u32,
    #[deku(bits = "1")]
    pub position_valid: u8,
    #[deku(bits = "1")]
    pub utc_coupled: u8,
    #[deku(bits = "1")]
    pub app_data_valid: u8,
    #[deku(bits = "5")]
    pub slot_id: u8,
    #[deku(bits = "4")]
    pub tisb_site_id: u8,
    #[deku(bits = "5")]
    pub reserved: u8,
}

const ANGLE_LSB: f64 = 360.0 / 16_777_216.0; // 2^24

impl UplinkHeader {
    pub fn latitude(&self) -> f64 {
        let signed = if self.lat_raw & 0x40_0000 != 0 {
            self.lat_raw as i32 - (1 << 23)
        } else {
            self.lat_raw as i32
        };
        signed as f64 * ANGLE_LSB
    }

    pub fn longitude(&self) -> f64 {
        let signed = if self.lon_raw & 0x80_0000 != 0 {
            self.lon_raw as i32 - (1 << 24)
        } else {
            self.lon_raw as i32
        };
        signed as f64 * ANGLE_LSB
    }

    /// Stations are identified by their coordinates
    pub fn station_id(&self) -> String {
        format!("{:.5}~{:.5}", self.longitude(), self.latitude())
    }

    /// Message Start Opportunity of the slot
    pub fn mso(&self) -> u32 {
        22 + 32 * self.slot_id as u32
    }

    pub fn data_channel(&self) -> u8 {
        self.slot_id + 1
    }
}

/// FIS-B APDU header: product routing plus the optional partial time.
/// Three bytes without a time, five with one.
#[derive(Debug, PartialEq, DekuRead, Clone)]
#[deku(endian = "big")]
pub struct ApduHeader {
    #[deku(bits = "1")]
    pub a_flag: u8,
    #[deku(bits = "1")]
    pub g_flag: u8,
    #[deku(bits = "1")]
    pub p_flag: u8,
    /// Payload starts with a segmentation header
    #[deku(bits = "1")]
    pub s_flag: u8,
    #[deku(bits = "11")]
    pub product_id: u16,
    /// Which time fields follow: 0 none, 1 month+day+hour+minute,
    /// 2 day+hour+minute, 3 hour+minute+second
    #[deku(bits = "2")]
    pub t_opt: u8,
    #[deku(bits = "4", cond = "*t_opt == 1")]
    pub month: Option<u8>,
    #[deku(bits = "5", cond = "*t_opt == 1 || *t_opt == 2")]
    pub day: Option<u8>,
    #[deku(bits = "5", cond = "*t_opt != 0")]
    pub hours: Option<u8>,
    #[deku(bits = "6", cond = "*t_opt != 0")]
    pub minutes: Option<u8>,
    #[deku(bits = "6", cond = "*t_opt == 3")]
    pub seconds: Option<u8>,
}

impl ApduHeader {
    pub fn header_bytes(&self) -> usize {
        if self.t_opt == 0 {
            3
        } else {
            5
        }
    }

    pub fn partial_time(&self) -> PartialTime {
        PartialTime {
            month: self.month.map(u32::from),
            day: self.day.map(u32::from),
            hour: self.hours.map(u32::from),
            minute: self.minutes.map(u32::from),
            second: self.seconds.map(u32::from),
        }
    }
}

pub const SEGMENT_HEADER_BYTES: usize = 4;

mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ApduRecord {
    pub product_id: u16,
    pub time: PartialTime,
    #[serde(flatten)]
    pub payload: PayloadRecord,
    /// Reserved frame-header bits, kept in detailed mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved: Option<u8>,
}

/// One fragment of a payload too long for a single frame
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub product_id: u16,
    pub time: PartialTime,
    pub report_id: u16,
    pub segment_number: u8,
    pub segment_count: u8,
    #[serde(with = "serde_hex")]
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FrameRecord {
    Apdu(ApduRecord),
    Segment(SegmentRecord),
    ServiceStatus(ServiceStatusRecord),
}

/// One decoded packet: uplink header fields plus every frame that decoded
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    pub rcvd_time: DateTime<Utc>,
    pub station: String,
    pub latitude: f64,
    pub longitude: f64,
    pub position_valid: bool,
    pub utc_coupled: bool,
    pub app_data_valid: bool,
    pub mso: u32,
    pub data_channel: u8,
    pub site_id: u8,
    pub rs_errors: i32,
    pub rssi: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved: Option<u8>,
    pub frames: Vec<FrameRecord>,
}

/// Decode one CRC-verified APDU. Per-frame faults go to the sink; the
/// packet only errors as a whole on FEC failure or a malformed header.
pub fn decode_packet(
    line: &CaptureLine,
    settings: &Settings,
    sink: &mut ErrorSink,
) -> Result<PacketRecord, FisbError> {
    if line.rs_errors < 0 {
        return Err(FisbError::Fec(line.rs_errors));
    }
    if line.bytes.len() != APDU_BYTES {
        return Err(FisbError::Decode(format!(
            "APDU is {} bytes, expected {APDU_BYTES}",
            line.bytes.len()
        )));
    }
    let (_, header) = UplinkHeader::from_bytes((&line.bytes, 0))?;
    let mut record = PacketRecord {
        rcvd_time: line.rcvd_time(),
        station: header.station_id(),
        latitude: header.latitude(),
        longitude: header.longitude(),
        position_valid: header.position_valid == 1,
        utc_coupled: header.utc_coupled == 1,
        app_data_valid: header.app_data_valid == 1,
        mso: header.mso(),
        data_channel: header.data_channel(),
        site_id: header.tisb_site_id,
        rs_errors: line.rs_errors,
        rssi: line.rssi,
        reserved: settings.detailed.then_some(header.reserved),
        frames: Vec::new(),
    };

    let app_data = &line.bytes[UPLINK_HEADER_BYTES..];
    let mut offset = 0;
    while offset + 2 <= app_data.len() {
        let length = ((app_data[offset] as usize) << 1)
            | (app_data[offset + 1] >> 7) as usize;
        let reserved = (app_data[offset + 1] >> 4) & 0x07;
        let frame_type = app_data[offset + 1] & 0x0f;
        if length == 0 {
            break; // zero fill
        }
        let start = offset + 2;
        let end = start + length;
        if end > app_data.len() {
            sink.record(
                &FisbError::Truncated("frame"),
                &record.station,
            );
            break;
        }
        match decode_frame(
            frame_type,
            reserved,
            &app_data[start..end],
            settings,
        ) {
            Ok(Some(frame)) => record.frames.push(frame),
            Ok(None) => sink.bump("reserved_frame"),
            Err(error) => sink.record(&error, &record.station),
        }
        offset = end;
    }
    Ok(record)
}

fn decode_frame(
    frame_type: u8,
    reserved: u8,
    data: &[u8],
    settings: &Settings,
) -> Result<Option<FrameRecord>, FisbError> {
    match frame_type {
        FRAME_TYPE_APDU => {
            let (_, header) = ApduHeader::from_bytes((data, 0))?;
            if data.len() < header.header_bytes() {
                return Err(FisbError::Truncated("APDU header"));
            }
            let payload = &data[header.header_bytes()..];
            let reserved = settings.detailed.then_some(reserved);
            if header.s_flag == 1 {
                if payload.len() < SEGMENT_HEADER_BYTES {
                    return Err(FisbError::Truncated("segment header"));
                }
                let report_id =
                    u16::from_be_bytes([payload[0], payload[1]]);
                let segment_number = payload[2];
                let segment_count = payload[3];
                if segment_count < 2 || segment_number >= segment_count {
                    return Err(FisbError::Decode(format!(
                        "segment {segment_number}/{segment_count}"
                    )));
                }
                return Ok(Some(FrameRecord::Segment(SegmentRecord {
                    product_id: header.product_id,
                    time: header.partial_time(),
                    report_id,
                    segment_number,
                    segment_count,
                    payload: payload[SEGMENT_HEADER_BYTES..].to_vec(),
                })));
            }
            Ok(Some(FrameRecord::Apdu(ApduRecord {
                product_id: header.product_id,
                time: header.partial_time(),
                payload: products::decode_payload(
                    header.product_id,
                    payload,
                    settings,
                )?,
                reserved,
            })))
        }
        FRAME_TYPE_SERVICE_STATUS => Ok(Some(FrameRecord::ServiceStatus(
            products::status::decode_service_status(data)?,
        ))),
        other => {
            if reserved != 0 {
                Err(FisbError::ReservedBits(other))
            } else {
                Ok(None)
            }
        }
    }
}
