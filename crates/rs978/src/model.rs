use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/**
 * The tagged-variant product model shared by every stage of the pipeline.
 *
 * A [`Product`] is the unit of exchange between L2, L3 and the curator: one
 * logical report (a single METAR, one NOTAM, one image block...) with fully
 * reconstructed ISO-8601 times and an expiration that is always present.
 * At most one copy per `(product_type, unique_name)` lives in the store at
 * any instant.
 */

#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone, Serialize, Deserialize, PartialOrd, Ord)]
pub enum ProductType {
    #[serde(rename = "METAR")]
    Metar,
    #[serde(rename = "TAF")]
    Taf,
    #[serde(rename = "WINDS_06_HR")]
    Winds06Hr,
    #[serde(rename = "WINDS_12_HR")]
    Winds12Hr,
    #[serde(rename = "WINDS_24_HR")]
    Winds24Hr,
    #[serde(rename = "PIREP")]
    Pirep,
    #[serde(rename = "AIRMET")]
    Airmet,
    #[serde(rename = "G_AIRMET_00_HR")]
    GAirmet00Hr,
    #[serde(rename = "G_AIRMET_03_HR")]
    GAirmet03Hr,
    #[serde(rename = "G_AIRMET_06_HR")]
    GAirmet06Hr,
    #[serde(rename = "SIGMET")]
    Sigmet,
    #[serde(rename = "WST")]
    Wst,
    #[serde(rename = "CWA")]
    Cwa,
    #[serde(rename = "NOTAM_D")]
    NotamD,
    #[serde(rename = "NOTAM_FDC")]
    NotamFdc,
    #[serde(rename = "NOTAM_TFR")]
    NotamTfr,
    #[serde(rename = "SUA")]
    Sua,
    #[serde(rename = "SIGWX")]
    Sigwx,
    #[serde(rename = "FIS_B_UNAVAILABLE")]
    FisBUnavailable,
    #[serde(rename = "SERVICE_STATUS")]
    ServiceStatus,
    #[serde(rename = "RSR")]
    Rsr,
    #[serde(rename = "CRL_8")]
    Crl8,
    #[serde(rename = "CRL_11")]
    Crl11,
    #[serde(rename = "CRL_12")]
    Crl12,
    #[serde(rename = "CRL_14")]
    Crl14,
    #[serde(rename = "CRL_15")]
    Crl15,
    #[serde(rename = "CRL_16")]
    Crl16,
    #[serde(rename = "CRL_17")]
    Crl17,
    #[serde(rename = "NEXRAD_REGIONAL")]
    NexradRegional,
    #[serde(rename = "NEXRAD_CONUS")]
    NexradConus,
    #[serde(rename = "ICING_LOW")]
    IcingLow,
    #[serde(rename = "ICING_HIGH")]
    IcingHigh,
    #[serde(rename = "CLOUD_TOPS")]
    CloudTops,
    #[serde(rename = "TURBULENCE_LOW")]
    TurbulenceLow,
    #[serde(rename = "TURBULENCE_HIGH")]
    TurbulenceHigh,
    #[serde(rename = "LIGHTNING")]
    Lightning,
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The serde rename is the canonical spelling everywhere
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

impl ProductType {
    /// Product classes that pair a text record with a graphics overlay
    pub fn is_twgo(&self) -> bool {
        matches!(
            self,
            Self::Airmet
                | Self::GAirmet00Hr
                | Self::GAirmet03Hr
                | Self::GAirmet06Hr
                | Self::Sigmet
                | Self::Wst
                | Self::Cwa
                | Self::NotamD
                | Self::NotamFdc
                | Self::NotamTfr
                | Self::Sigwx
                | Self::Sua
        )
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            Self::NexradRegional
                | Self::NexradConus
                | Self::IcingLow
                | Self::IcingHigh
                | Self::CloudTops
                | Self::TurbulenceLow
                | Self::TurbulenceHigh
                | Self::Lightning
        )
    }

    /// Radar-like composites accept multiple source times but evict stale
    /// tiles (more than 10 minutes older than the newest).
    pub fn is_radar_like(&self) -> bool {
        matches!(
            self,
            Self::NexradRegional | Self::NexradConus | Self::Lightning
        )
    }

    pub fn is_crl(&self) -> bool {
        matches!(
            self,
            Self::Crl8
                | Self::Crl11
                | Self::Crl12
                | Self::Crl14
                | Self::Crl15
                | Self::Crl16
                | Self::Crl17
        )
    }

    /// The CRL type indexing a given wire product class
    pub fn crl_for(product_id: u16) -> Option<Self> {
        match product_id {
            8 => Some(Self::Crl8),
            11 => Some(Self::Crl11),
            12 => Some(Self::Crl12),
            14 => Some(Self::Crl14),
            15 => Some(Self::Crl15),
            16 => Some(Self::Crl16),
            17 => Some(Self::Crl17),
            _ => None,
        }
    }

    /// The wire product class a CRL type indexes
    pub fn crl_class(&self) -> Option<u16> {
        match self {
            Self::Crl8 => Some(8),
            Self::Crl11 => Some(11),
            Self::Crl12 => Some(12),
            Self::Crl14 => Some(14),
            Self::Crl15 => Some(15),
            Self::Crl16 => Some(16),
            Self::Crl17 => Some(17),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum GeometryKind {
    #[serde(rename = "CIRCLE")]
    Circle,
    #[serde(rename = "POLYGON")]
    Polygon,
    #[serde(rename = "LINESTRING")]
    Linestring,
    #[serde(rename = "POINT")]
    Point,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AltitudeReference {
    Agl,
    Msl,
}

/// One element of a graphics overlay: a shape, an altitude band and an
/// optional per-element validity window.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct GeometryElement {
    pub kind: GeometryKind,
    /// (longitude, latitude) pairs in degrees; a single entry for CIRCLE
    /// and POINT
    pub vertices: Vec<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_nm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_radius_nm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_bottom_ft: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_top_ft: Option<i32>,
    pub altitude_reference: AltitudeReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

/// One entry of a Current Report List
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CrlEntry {
    pub report_number: u16,
    pub report_year: u8,
    pub has_text: bool,
    pub has_graphics: bool,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct CrlPayload {
    /// The wire product class this list indexes (8, 11, 12, 14, 15, 16, 17)
    pub product_class: u16,
    /// True when the station's real list exceeds 138 entries: the list is
    /// then a prefix and can never be annotated `complete`
    pub overflow: bool,
    pub entries: Vec<CrlEntry>,
    /// Annotated by the curator: "complete" or "incomplete"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Bin values are palette indexes 0..=7; two out-of-band sentinels mark
/// bins never covered by a block and bins explicitly encoded as no-data.
pub const BIN_NOT_INCLUDED: u8 = 0xff;
pub const BIN_NO_DATA: u8 = 0xfe;

/// Block tiles are 32 bins wide and 4 bins high
pub const BLOCK_WIDTH: usize = 32;
pub const BLOCK_HEIGHT: usize = 4;
pub const BLOCK_BINS: usize = BLOCK_WIDTH * BLOCK_HEIGHT;

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    pub block_number: u32,
    pub scale: u8,
    pub valid_time: DateTime<Utc>,
    /// Exactly `BLOCK_BINS` palette indexes, row-major from the northwest
    /// corner of the block
    pub bins: Vec<u8>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ServiceStatusPayload {
    /// 24-bit target addresses currently receiving TIS-B service, as hex
    pub addresses: Vec<String>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RsrPayload {
    pub received: u32,
    pub expected_per_sec: f64,
    pub percent: u8,
}

/// A fully synthesized product leaving L2.
///
/// `expiration_time` is always present and never earlier than `rcvd_time`.
/// Optional times are present when the product class defines them.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Product {
    #[serde(rename = "type")]
    pub product_type: ProductType,
    pub unique_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    pub rcvd_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub geometry: Vec<GeometryElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_period_begin_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_period_end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_run_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_of_activity_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_of_validity_time: Option<DateTime<Utc>>,
    pub expiration_time: DateTime<Utc>,
    /// Report identity for TWGO classes, used by CRL reconciliation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_number: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_year: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_text: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_graphics: Option<bool>,
    /// True on the tombstone emitted when a report is cancelled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crl: Option<CrlPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_status: Option<ServiceStatusPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsr: Option<RsrPayload>,
    /// Attached by the curator's location enrichment pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geojson: Option<serde_json::Value>,
}

impl Product {
    pub fn new(
        product_type: ProductType,
        unique_name: impl Into<String>,
        rcvd_time: DateTime<Utc>,
        expiration_time: DateTime<Utc>,
    ) -> Self {
        Product {
            product_type,
            unique_name: unique_name.into(),
            product_id: None,
            station: None,
            rcvd_time,
            contents: None,
            geometry: Vec::new(),
            issued_time: None,
            observation_time: None,
            valid_period_begin_time: None,
            valid_period_end_time: None,
            model_run_time: None,
            start_of_activity_time: None,
            end_of_validity_time: None,
            expiration_time,
            report_number: None,
            report_year: None,
            has_text: None,
            has_graphics: None,
            cancelled: None,
            crl: None,
            image: None,
            service_status: None,
            rsr: None,
            geojson: None,
        }
    }

    /// The latest geometry stop time, driving TWGO expiration
    pub fn last_geometry_stop(&self) -> Option<DateTime<Utc>> {
        self.geometry.iter().filter_map(|g| g.stop_time).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_type_spelling() {
        assert_eq!(ProductType::Winds06Hr.to_string(), "WINDS_06_HR");
        assert_eq!(ProductType::GAirmet03Hr.to_string(), "G_AIRMET_03_HR");
        assert_eq!(ProductType::NexradConus.to_string(), "NEXRAD_CONUS");
        assert_eq!(ProductType::FisBUnavailable.to_string(), "FIS_B_UNAVAILABLE");
    }

    #[test]
    fn test_crl_mapping() {
        for id in [8u16, 11, 12, 14, 15, 16, 17] {
            let crl = ProductType::crl_for(id).unwrap();
            assert!(crl.is_crl());
            assert_eq!(crl.crl_class(), Some(id));
        }
        assert_eq!(ProductType::crl_for(413), None);
    }

    #[test]
    fn test_product_roundtrip() {
        let rcvd = Utc.with_ymd_and_hms(2021, 5, 14, 7, 18, 0).unwrap();
        let mut product = Product::new(
            ProductType::Metar,
            "KOCQ",
            rcvd,
            rcvd + chrono::Duration::hours(2),
        );
        product.contents = Some("METAR KOCQ 140715Z ...=".into());
        let json = serde_json::to_string(&product).unwrap();
        assert!(json.contains("\"type\":\"METAR\""));
        let back: Product = serde_json::from_str(&json).unwrap();
        assert_eq!(back, product);
    }
}
