use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::decode::time::{self, horizons, PartialTime};
use crate::errors::FisbError;
use crate::model::{Product, ProductType};
use crate::reassembly::Assembled;
use crate::synthesis::{METAR_VALIDITY_HOURS, PIREP_VALIDITY_MINUTES};

/**
 * Textual report synthesis. A generic-text payload is a block of reports
 * already split on the record separator; each report's leading keyword
 * selects its decoder.
 */

static METAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(METAR|SPECI)\s+([A-Z][A-Z0-9]{2,3})\s+(\d{2})(\d{2})(\d{2})Z")
        .expect("METAR regex")
});

static TAF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^TAF(?:[ .](?:AMD|COR))?\s+([A-Z][A-Z0-9]{2,3})\s+(\d{2})(\d{2})(\d{2})Z\s+(\d{2})(\d{2})/(\d{2})(\d{2})",
    )
    .expect("TAF regex")
});

static WINDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^WINDS\s+([A-Z][A-Z0-9]{2,3})\s+(06|12|24)HR\s+(\d{2})(\d{2})(\d{2})Z")
        .expect("WINDS regex")
});

static PIREP_OV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/OV\s*([A-Z0-9]+)").expect("PIREP OV regex"));

static PIREP_TM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/TM\s*(\d{2})(\d{2})").expect("PIREP TM regex"));

static UNAVAILABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^UNAVBL\s+([A-Z0-9_-]+)\s+UNTIL\s+(\d{2})(\d{2})(\d{2})")
        .expect("UNAVBL regex")
});

pub fn report(assembled: &Assembled, text: &str) -> Result<Product, FisbError> {
    let keyword = text.split_whitespace().next().unwrap_or_default();
    match keyword {
        "METAR" | "SPECI" => metar(assembled, text),
        "TAF" | "TAF.AMD" | "TAF.COR" => taf(assembled, text),
        "WINDS" => winds(assembled, text),
        "PIREP" => pirep(assembled, text),
        "UNAVBL" => unavailable(assembled, text),
        _ => Err(FisbError::ReportText(format!(
            "unrecognized keyword {keyword:?}"
        ))),
    }
}

fn metar(assembled: &Assembled, text: &str) -> Result<Product, FisbError> {
    let captures = METAR
        .captures(text)
        .ok_or_else(|| FisbError::ReportText("METAR header".into()))?;
    let observation = time::resolve(
        &PartialTime::day_hour_minute(
            captures[3].parse().unwrap_or(0),
            captures[4].parse().unwrap_or(0),
            captures[5].parse().unwrap_or(0),
        ),
        assembled.rcvd_time,
        horizons::METAR_OBSERVATION,
        "METAR",
    )?;
    let mut product = Product::new(
        ProductType::Metar,
        &captures[2],
        assembled.rcvd_time,
        observation + Duration::hours(METAR_VALIDITY_HOURS),
    );
    product.product_id = assembled.product_id;
    product.observation_time = Some(observation);
    product.contents = Some(text.to_owned());
    Ok(product)
}

fn taf(assembled: &Assembled, text: &str) -> Result<Product, FisbError> {
    let captures = TAF
        .captures(text)
        .ok_or_else(|| FisbError::ReportText("TAF header".into()))?;
    let issued = time::resolve(
        &PartialTime::day_hour_minute(
            captures[2].parse().unwrap_or(0),
            captures[3].parse().unwrap_or(0),
            captures[4].parse().unwrap_or(0),
        ),
        assembled.rcvd_time,
        horizons::TAF_ISSUED,
        "TAF",
    )?;
    // The validity period anchors on the issue time, not the receipt
    let begin = taf_time(
        captures[5].parse().unwrap_or(0),
        captures[6].parse().unwrap_or(0),
        issued,
        "TAF valid_begin",
    )?;
    let end = taf_time(
        captures[7].parse().unwrap_or(0),
        captures[8].parse().unwrap_or(0),
        begin,
        "TAF valid_end",
    )?;
    let mut product = Product::new(
        ProductType::Taf,
        &captures[1],
        assembled.rcvd_time,
        end,
    );
    product.product_id = assembled.product_id;
    product.issued_time = Some(issued);
    product.valid_period_begin_time = Some(begin);
    product.valid_period_end_time = Some(end);
    product.contents = Some(text.to_owned());
    Ok(product)
}

/// TAF periods write midnight at the end of a day as hour 24
fn taf_time(
    day: u32,
    hour: u32,
    anchor: chrono::DateTime<chrono::Utc>,
    label: &'static str,
) -> Result<chrono::DateTime<chrono::Utc>, FisbError> {
    let wraps = hour == 24;
    let resolved = time::resolve(
        &PartialTime::day_hour_minute(day, if wraps { 0 } else { hour }, 0),
        anchor,
        horizons::TAF_VALID,
        label,
    )?;
    Ok(if wraps {
        resolved + Duration::days(1)
    } else {
        resolved
    })
}

fn winds(assembled: &Assembled, text: &str) -> Result<Product, FisbError> {
    let captures = WINDS
        .captures(text)
        .ok_or_else(|| FisbError::ReportText("WINDS header".into()))?;
    let period_hours: i64 = captures[2].parse().unwrap_or(6);
    let product_type = match period_hours {
        6 => ProductType::Winds06Hr,
        12 => ProductType::Winds12Hr,
        _ => ProductType::Winds24Hr,
    };
    let valid = time::resolve(
        &PartialTime::day_hour_minute(
            captures[3].parse().unwrap_or(0),
            captures[4].parse().unwrap_or(0),
            captures[5].parse().unwrap_or(0),
        ),
        assembled.rcvd_time,
        horizons::WINDS_VALID,
        "WINDS",
    )?;
    let end = valid + Duration::hours(period_hours);
    let mut product = Product::new(
        product_type,
        &captures[1],
        assembled.rcvd_time,
        end,
    );
    product.product_id = assembled.product_id;
    product.valid_period_begin_time = Some(valid);
    product.valid_period_end_time = Some(end);
    product.contents = Some(text.to_owned());
    Ok(product)
}

fn pirep(assembled: &Assembled, text: &str) -> Result<Product, FisbError> {
    let fix = PIREP_OV
        .captures(text)
        .map(|c| c[1].to_owned())
        .ok_or_else(|| FisbError::ReportText("PIREP without /OV".into()))?;
    let tm = PIREP_TM
        .captures(text)
        .ok_or_else(|| FisbError::ReportText("PIREP without /TM".into()))?;
    let observation = time::resolve(
        &PartialTime::hour_minute(
            tm[1].parse().unwrap_or(0),
            tm[2].parse().unwrap_or(0),
        ),
        assembled.rcvd_time,
        horizons::GENERIC,
        "PIREP",
    )?;
    // PIREPs have no report identity on the wire: the digest keeps two
    // reports over the same fix and minute apart
    let digest = Sha256::digest(text.as_bytes());
    let unique_name =
        format!("{fix}-{}{}-{}", &tm[1], &tm[2], &hex::encode(digest)[..8]);
    let mut product = Product::new(
        ProductType::Pirep,
        unique_name,
        assembled.rcvd_time,
        observation + Duration::minutes(PIREP_VALIDITY_MINUTES),
    );
    product.product_id = assembled.product_id;
    product.observation_time = Some(observation);
    product.contents = Some(text.to_owned());
    Ok(product)
}

fn unavailable(assembled: &Assembled, text: &str) -> Result<Product, FisbError> {
    let captures = UNAVAILABLE
        .captures(text)
        .ok_or_else(|| FisbError::ReportText("UNAVBL header".into()))?;
    let until = time::resolve(
        &PartialTime::day_hour_minute(
            captures[2].parse().unwrap_or(0),
            captures[3].parse().unwrap_or(0),
            captures[4].parse().unwrap_or(0),
        ),
        assembled.rcvd_time,
        horizons::TWGO_BEGIN,
        "FIS-B unavailable",
    )?;
    let mut product = Product::new(
        ProductType::FisBUnavailable,
        &captures[1],
        assembled.rcvd_time,
        until,
    );
    product.product_id = assembled.product_id;
    product.valid_period_end_time = Some(until);
    product.contents = Some(text.to_owned());
    Ok(product)
}

/// SUA text records are pipe-delimited:
/// `sched_id|nfdc_id|name|status|type|start DDHHMM|end DDHHMM|low|high`
pub fn sua(assembled: &Assembled, text: &str) -> Result<Product, FisbError> {
    let fields: Vec<&str> = text.trim_end_matches('=').split('|').collect();
    if fields.len() < 7 {
        return Err(FisbError::ReportText(format!(
            "SUA record has {} fields",
            fields.len()
        )));
    }
    let start = time::resolve(
        &sua_time(fields[5])?,
        assembled.rcvd_time,
        horizons::TWGO_BEGIN,
        "SUA start",
    )?;
    let end = time::resolve(
        &sua_time(fields[6])?,
        start,
        horizons::TAF_VALID,
        "SUA end",
    )?;
    let mut product = Product::new(
        ProductType::Sua,
        fields[0],
        assembled.rcvd_time,
        end,
    );
    product.product_id = assembled.product_id;
    product.start_of_activity_time = Some(start);
    product.end_of_validity_time = Some(end);
    product.contents = Some(text.to_owned());
    Ok(product)
}

fn sua_time(field: &str) -> Result<PartialTime, FisbError> {
    if field.len() != 6 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FisbError::ReportText(format!("SUA time {field:?}")));
    }
    Ok(PartialTime::day_hour_minute(
        field[0..2].parse().unwrap_or(0),
        field[2..4].parse().unwrap_or(0),
        field[4..6].parse().unwrap_or(0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::time::to_iso8601;

    fn assembled(rcvd: &str) -> Assembled {
        Assembled {
            station: "-84.21844~39.90097".into(),
            rcvd_time: rcvd.parse().unwrap(),
            product_id: Some(413),
            time: PartialTime::default(),
            kind: crate::reassembly::AssembledKind::Text { reports: vec![] },
        }
    }

    #[test]
    fn test_metar_synthesis() {
        let text = "METAR KOCQ 140715Z AUTO 00000KT 10SM OVC120 03/02 A3025 RMK AO1 T00310016=";
        let product =
            report(&assembled("2021-05-14T07:18:00Z"), text).unwrap();
        assert_eq!(product.product_type, ProductType::Metar);
        assert_eq!(product.unique_name, "KOCQ");
        assert_eq!(
            to_iso8601(&product.observation_time.unwrap()),
            "2021-05-14T07:15:00Z"
        );
        assert_eq!(
            to_iso8601(&product.expiration_time),
            "2021-05-14T09:15:00Z"
        );
        assert_eq!(product.contents.as_deref(), Some(text));
    }

    #[test]
    fn test_taf_period_spans_midnight() {
        let text = "TAF KOCQ 142320Z 1500/1524 18005KT P6SM SKC=";
        let product =
            report(&assembled("2021-05-14T23:25:00Z"), text).unwrap();
        assert_eq!(
            to_iso8601(&product.issued_time.unwrap()),
            "2021-05-14T23:20:00Z"
        );
        assert_eq!(
            to_iso8601(&product.valid_period_begin_time.unwrap()),
            "2021-05-15T00:00:00Z"
        );
        assert_eq!(
            to_iso8601(&product.valid_period_end_time.unwrap()),
            "2021-05-16T00:00:00Z"
        );
        assert_eq!(product.expiration_time, product.valid_period_end_time.unwrap());
    }

    #[test]
    fn test_winds_periods() {
        let text = "WINDS OCQ 12HR 141800Z 3000 9900 2111+15=";
        let product =
            report(&assembled("2021-05-14T07:18:00Z"), text).unwrap();
        assert_eq!(product.product_type, ProductType::Winds12Hr);
        assert_eq!(
            to_iso8601(&product.valid_period_begin_time.unwrap()),
            "2021-05-14T18:00:00Z"
        );
        assert_eq!(
            to_iso8601(&product.valid_period_end_time.unwrap()),
            "2021-05-15T06:00:00Z"
        );
    }

    #[test]
    fn test_pirep_unique_names_differ() {
        let a = "PIREP CMH UA /OV APE230010/TM 0715/FL350/TP B738/TB LGT=";
        let b = "PIREP CMH UA /OV APE230010/TM 0715/FL370/TP A320/TB MOD=";
        let pa = report(&assembled("2021-05-14T07:18:00Z"), a).unwrap();
        let pb = report(&assembled("2021-05-14T07:18:00Z"), b).unwrap();
        assert_eq!(pa.product_type, ProductType::Pirep);
        assert!(pa.unique_name.starts_with("APE230010-0715-"));
        assert_ne!(pa.unique_name, pb.unique_name);
    }

    #[test]
    fn test_sua_record() {
        let text = "21-0455|R-5503B|BULLDOG B MOA|W|M|150700|151300|050|180=";
        let product = sua(&assembled("2021-05-14T22:00:00Z"), text).unwrap();
        assert_eq!(product.product_type, ProductType::Sua);
        assert_eq!(product.unique_name, "21-0455");
        assert_eq!(
            to_iso8601(&product.start_of_activity_time.unwrap()),
            "2021-05-15T07:00:00Z"
        );
        assert_eq!(
            to_iso8601(&product.end_of_validity_time.unwrap()),
            "2021-05-15T13:00:00Z"
        );
    }

    #[test]
    fn test_unavailable() {
        let text = "UNAVBL NEXRAD_CONUS UNTIL 142200=";
        let product =
            report(&assembled("2021-05-14T07:18:00Z"), text).unwrap();
        assert_eq!(product.product_type, ProductType::FisBUnavailable);
        assert_eq!(product.unique_name, "NEXRAD_CONUS");
        assert_eq!(
            to_iso8601(&product.expiration_time),
            "2021-05-14T22:00:00Z"
        );
    }
}
