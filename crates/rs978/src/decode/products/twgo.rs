use deku::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::decode::bits::BitCursor;
use crate::decode::dlac;
use crate::decode::time::PartialTime;
use crate::errors::FisbError;
use crate::model::{AltitudeReference, CrlEntry, GeometryKind};

/**
 * Text-With-Graphic-Overlay records. A TWGO payload is a walk of records,
 * each led by a six-byte header; the text half and the graphics half of a
 * report travel in independent broadcasts and are joined later by keying
 * on (product id, report number, report year).
 *
 * Record formats: 2 = text (DLAC), 8 = graphic overlay, 15 = current
 * report list. A report_status of 0 cancels the report.
 */

pub const FORMAT_TEXT: u8 = 2;
pub const FORMAT_GRAPHICS: u8 = 8;
pub const FORMAT_CRL: u8 = 15;

#[derive(Debug, PartialEq, DekuRead, Clone)]
#[deku(endian = "big")]
pub struct RecordHeader {
    #[deku(bits = "4")]
    pub record_format: u8,
    #[deku(bits = "4")]
    pub product_version: u8,
    /// Total record bytes, header included
    pub record_length: u16,
    #[deku(bits = "14")]
    pub report_number: u16,
    /// Two low digits of the report year, modulo 32 on the wire
    #[deku(bits = "5")]
    pub report_year: u8,
    /// 0 cancels the report
    #[deku(bits = "1")]
    pub report_status: u8,
    #[deku(bits = "4")]
    pub reserved: u8,
}

pub const RECORD_HEADER_BYTES: usize = 6;

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TwgoRecord {
    Text(TwgoText),
    Graphics(TwgoGraphics),
    Crl(CrlRecord),
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TwgoText {
    pub report_number: u16,
    pub report_year: u8,
    pub active: bool,
    pub text: String,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TwgoGraphics {
    pub report_number: u16,
    pub report_year: u8,
    pub active: bool,
    pub objects: Vec<OverlayObject>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct CrlRecord {
    pub product_class: u16,
    pub overflow: bool,
    pub entries: Vec<CrlEntry>,
}

/// One shape of a graphics record, angles still in degrees but times
/// still partial: L2 resolves them against the packet anchor
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OverlayObject {
    pub kind: GeometryKind,
    pub altitude_reference: AltitudeReference,
    /// (longitude, latitude) pairs; one entry for CIRCLE and POINT
    pub vertices: Vec<(f64, f64)>,
    pub radius_nm: Option<f64>,
    pub secondary_radius_nm: Option<f64>,
    pub altitude_bottom_ft: Option<i32>,
    pub altitude_top_ft: Option<i32>,
    pub start: Option<PartialTime>,
    pub stop: Option<PartialTime>,
}

/// Walk every record of a TWGO payload
pub fn decode_records(
    data: &[u8],
    settings: &Settings,
) -> Result<Vec<TwgoRecord>, FisbError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + RECORD_HEADER_BYTES <= data.len() {
        let (_, header) = RecordHeader::from_bytes((&data[offset..], 0))?;
        let length = header.record_length as usize;
        if length < RECORD_HEADER_BYTES || offset + length > data.len() {
            return Err(FisbError::Decode(format!(
                "record length {length} overruns payload of {} bytes",
                data.len()
            )));
        }
        let body = &data[offset + RECORD_HEADER_BYTES..offset + length];
        let active = header.report_status == 1;
        match header.record_format {
            FORMAT_TEXT => records.push(TwgoRecord::Text(TwgoText {
                report_number: header.report_number,
                report_year: header.report_year,
                active,
                text: dlac::decode(body, settings.legacy_dlac),
            })),
            FORMAT_GRAPHICS => records.push(TwgoRecord::Graphics(TwgoGraphics {
                report_number: header.report_number,
                report_year: header.report_year,
                active,
                objects: decode_overlays(body)?,
            })),
            FORMAT_CRL => records.push(TwgoRecord::Crl(decode_crl(body)?)),
            other => {
                return Err(FisbError::Decode(format!(
                    "record format {other} is not text, graphics or CRL"
                )))
            }
        }
        offset += length;
    }
    Ok(records)
}

const ANGLE_LSB: f64 = 360.0 / 16_777_216.0; // 2^24

fn decode_overlays(body: &[u8]) -> Result<Vec<OverlayObject>, FisbError> {
    let mut cursor = BitCursor::new(body);
    let mut objects = Vec::new();
    while cursor.remaining_bits() >= 16 {
        let geometry_type = cursor.take(4)?;
        let altitude_type = cursor.take(4)?;
        let kind = match geometry_type {
            3 => GeometryKind::Polygon,
            7 => GeometryKind::Circle,
            9 => GeometryKind::Point,
            11 => GeometryKind::Linestring,
            other => {
                return Err(FisbError::Decode(format!(
                    "overlay geometry option {other}"
                )))
            }
        };
        let altitude_reference = if altitude_type == 1 {
            AltitudeReference::Msl
        } else {
            AltitudeReference::Agl
        };
        let has_applicability = cursor.take(1)? == 1;
        let vertex_count = cursor.take(7)? as usize;

        let (start, stop) = if has_applicability {
            (applicability(&mut cursor)?, applicability(&mut cursor)?)
        } else {
            (None, None)
        };

        let bottom = cursor.take(16)? as u16;
        let top = cursor.take(16)? as u16;

        let mut vertices = Vec::with_capacity(vertex_count);
        for _ in 0..vertex_count {
            let lon = cursor.take_signed(24)? as f64 * ANGLE_LSB;
            let lat = cursor.take_signed(24)? as f64 * ANGLE_LSB;
            vertices.push((lon, lat));
        }

        let (radius_nm, secondary_radius_nm) = if kind == GeometryKind::Circle {
            let primary = cursor.take(16)? as f64 / 10.0;
            let secondary = cursor.take(16)? as f64 / 10.0;
            (
                Some(primary),
                (secondary > 0.0).then_some(secondary),
            )
        } else {
            (None, None)
        };

        objects.push(OverlayObject {
            kind,
            altitude_reference,
            vertices,
            radius_nm,
            secondary_radius_nm,
            altitude_bottom_ft: (bottom != 0xffff).then(|| bottom as i32 * 100),
            altitude_top_ft: (top != 0xffff).then(|| top as i32 * 100),
            start,
            stop,
        });
    }
    Ok(objects)
}

/// Four bytes: month(4) day(5) hours(5) minutes(6) + 12 pad bits;
/// all-zero means no window on this end
fn applicability(
    cursor: &mut BitCursor,
) -> Result<Option<PartialTime>, FisbError> {
    let month = cursor.take(4)?;
    let day = cursor.take(5)?;
    let hour = cursor.take(5)?;
    let minute = cursor.take(6)?;
    cursor.take(12)?;
    if month == 0 {
        return Ok(None);
    }
    Ok(Some(PartialTime {
        month: Some(month),
        day: Some(day),
        hour: Some(hour),
        minute: Some(minute),
        second: None,
    }))
}

fn decode_crl(body: &[u8]) -> Result<CrlRecord, FisbError> {
    if body.len() < 3 {
        return Err(FisbError::Truncated("CRL record"));
    }
    let product_class = body[0] as u16;
    let overflow = body[1] & 0x80 != 0;
    let entry_count = body[2] as usize;
    if entry_count > 138 {
        return Err(FisbError::Decode(format!(
            "CRL entry count {entry_count} exceeds 138"
        )));
    }
    if body.len() < 3 + entry_count * 3 {
        return Err(FisbError::Truncated("CRL entries"));
    }
    let mut entries = Vec::with_capacity(entry_count);
    let mut cursor = BitCursor::new(&body[3..]);
    for _ in 0..entry_count {
        let report_year = cursor.take(5)? as u8;
        let report_number = cursor.take(14)? as u16;
        let has_text = cursor.take(1)? == 1;
        let has_graphics = cursor.take(1)? == 1;
        cursor.take(3)?;
        entries.push(CrlEntry {
            report_number,
            report_year,
            has_text,
            has_graphics,
        });
    }
    Ok(CrlRecord {
        product_class,
        overflow,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pack a record header by hand: format/version, length, report
    /// number/year/status
    fn header(format: u8, length: u16, number: u16, year: u8, active: bool) -> Vec<u8> {
        let mut bytes = vec![(format << 4) | 1];
        bytes.extend_from_slice(&length.to_be_bytes());
        // report_number(14) report_year(5) status(1) reserved(4)
        let tail: u32 = ((number as u32) << 10)
            | ((year as u32 & 0x1f) << 5)
            | ((active as u32) << 4);
        bytes.extend_from_slice(&tail.to_be_bytes()[1..4]);
        bytes
    }

    #[test]
    fn test_text_record() {
        let text = dlac::encode("AIRMET TANGO FOR TURB=").unwrap();
        let length = (RECORD_HEADER_BYTES + text.len()) as u16;
        let mut payload = header(FORMAT_TEXT, length, 371, 21, true);
        payload.extend_from_slice(&text);

        let records = decode_records(&payload, &Settings::default()).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            TwgoRecord::Text(text) => {
                assert_eq!(text.report_number, 371);
                assert_eq!(text.report_year, 21);
                assert!(text.active);
                assert_eq!(text.text, "AIRMET TANGO FOR TURB=");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cancellation_status() {
        let text = dlac::encode("CANCELLED=").unwrap();
        let length = (RECORD_HEADER_BYTES + text.len()) as u16;
        let mut payload = header(FORMAT_TEXT, length, 42, 20, false);
        payload.extend_from_slice(&text);
        let records = decode_records(&payload, &Settings::default()).unwrap();
        match &records[0] {
            TwgoRecord::Text(text) => assert!(!text.active),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_circle_overlay() {
        // One circle, MSL, no applicability, surface to 18000 ft,
        // center (-84.218445, 39.90097), radius 30 NM
        let mut body = vec![(7 << 4) | 1, 0x01];
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&180u16.to_be_bytes());
        let lon = (-84.218445 / ANGLE_LSB).round() as i32;
        let lat = (39.90097 / ANGLE_LSB).round() as i32;
        body.extend_from_slice(&lon.to_be_bytes()[1..4]);
        body.extend_from_slice(&lat.to_be_bytes()[1..4]);
        body.extend_from_slice(&300u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());

        let length = (RECORD_HEADER_BYTES + body.len()) as u16;
        let mut payload = header(FORMAT_GRAPHICS, length, 6733, 20, true);
        payload.extend_from_slice(&body);

        let records = decode_records(&payload, &Settings::default()).unwrap();
        match &records[0] {
            TwgoRecord::Graphics(graphics) => {
                assert_eq!(graphics.report_number, 6733);
                assert_eq!(graphics.objects.len(), 1);
                let object = &graphics.objects[0];
                assert_eq!(object.kind, GeometryKind::Circle);
                assert_eq!(object.altitude_reference, AltitudeReference::Msl);
                assert_eq!(object.radius_nm, Some(30.0));
                assert_eq!(object.secondary_radius_nm, None);
                assert_eq!(object.altitude_bottom_ft, Some(0));
                assert_eq!(object.altitude_top_ft, Some(18000));
                let (lon, lat) = object.vertices[0];
                assert!((lon - -84.218445).abs() < 1e-4);
                assert!((lat - 39.90097).abs() < 1e-4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_crl_record() {
        let mut body = vec![8u8, 0x80, 2];
        for (number, year) in [(6733u16, 20u8), (101, 21)] {
            let entry: u32 = ((year as u32) << 19)
                | ((number as u32) << 5)
                | (1 << 4)  // text
                | (1 << 3); // graphics
            body.extend_from_slice(&entry.to_be_bytes()[1..4]);
        }
        let length = (RECORD_HEADER_BYTES + body.len()) as u16;
        let mut payload = header(FORMAT_CRL, length, 0, 0, true);
        payload.extend_from_slice(&body);

        let records = decode_records(&payload, &Settings::default()).unwrap();
        match &records[0] {
            TwgoRecord::Crl(crl) => {
                assert_eq!(crl.product_class, 8);
                assert!(crl.overflow);
                assert_eq!(crl.entries.len(), 2);
                assert_eq!(crl.entries[0].report_number, 6733);
                assert_eq!(crl.entries[0].report_year, 20);
                assert!(crl.entries[0].has_text);
                assert!(crl.entries[0].has_graphics);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_overrun_rejected() {
        let payload = header(FORMAT_TEXT, 40, 1, 21, true);
        assert!(decode_records(&payload, &Settings::default()).is_err());
    }
}
