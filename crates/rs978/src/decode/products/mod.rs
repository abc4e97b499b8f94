pub mod image;
pub mod status;
pub mod twgo;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::decode::dlac;
use crate::errors::FisbError;

pub use image::ImageBlockRecord;
pub use status::ServiceStatusRecord;
pub use twgo::{CrlRecord, OverlayObject, TwgoGraphics, TwgoRecord, TwgoText};

/**
 * The per-product-id decode table. Every frame decoder is pure: payload
 * bytes in, structured record out.
 *
 * | product id | payload |
 * | ---------- | ------------------------------------- |
 * | 2          | FIS-B Unavailable text                |
 * | 8          | NOTAM (D/FDC/TFR), TWGO records       |
 * | 11         | AIRMET, TWGO records                  |
 * | 12         | SIGMET/WST, TWGO records              |
 * | 13         | SUA, TWGO text records                |
 * | 14         | G-AIRMET, TWGO records                |
 * | 15         | CWA, TWGO records                     |
 * | 16, 17     | NOTAM-TRA / NOTAM-TMOA, TWGO records  |
 * | 63, 64     | Regional / CONUS NEXRAD image blocks  |
 * | 70, 71     | Icing low / high image blocks         |
 * | 84         | Cloud tops image blocks               |
 * | 90, 91     | Turbulence low / high image blocks    |
 * | 103        | Lightning image blocks                |
 * | 413        | Generic text (METAR/TAF/WINDS/PIREP)  |
 */
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ProductKind {
    Text,
    Twgo,
    Image,
}

pub fn product_kind(product_id: u16) -> Option<ProductKind> {
    match product_id {
        2 | 413 => Some(ProductKind::Text),
        8 | 11 | 12 | 13 | 14 | 15 | 16 | 17 => Some(ProductKind::Twgo),
        63 | 64 | 70 | 71 | 84 | 90 | 91 | 103 => Some(ProductKind::Image),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
pub enum PayloadRecord {
    /// DLAC text, already split into reports
    Text { reports: Vec<String> },
    Twgo { records: Vec<TwgoRecord> },
    Image(ImageBlockRecord),
}

/// Route payload bytes to the product-specific decoder. Reassembled
/// segments come back through here with their concatenated payload.
pub fn decode_payload(
    product_id: u16,
    data: &[u8],
    settings: &Settings,
) -> Result<PayloadRecord, FisbError> {
    match product_kind(product_id).ok_or(FisbError::UnknownProduct(product_id))? {
        ProductKind::Text => {
            let text = dlac::decode(data, settings.legacy_dlac);
            Ok(PayloadRecord::Text {
                reports: dlac::split_reports(&text),
            })
        }
        ProductKind::Twgo => Ok(PayloadRecord::Twgo {
            records: twgo::decode_records(data, settings)?,
        }),
        ProductKind::Image => Ok(PayloadRecord::Image(image::decode_block(data)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_table() {
        assert_eq!(product_kind(413), Some(ProductKind::Text));
        assert_eq!(product_kind(8), Some(ProductKind::Twgo));
        assert_eq!(product_kind(64), Some(ProductKind::Image));
        assert_eq!(product_kind(999), None);
    }

    #[test]
    fn test_text_payload() {
        let packed =
            dlac::encode("METAR KAAA 140715Z=\x1eMETAR KBBB 140716Z=").unwrap();
        let settings = Settings::default();
        match decode_payload(413, &packed, &settings).unwrap() {
            PayloadRecord::Text { reports } => {
                assert_eq!(reports.len(), 2);
                assert!(reports[0].starts_with("METAR KAAA"));
            }
            _ => unreachable!(),
        }
    }
}
