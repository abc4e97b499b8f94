use crate::errors::FisbError;

/**
 * DLAC is the 6-bit character encoding used by FIS-B text payloads: three
 * bytes carry four characters. The 64-entry alphabet covers upper-case
 * letters, digits, the usual punctuation, and four control characters:
 * ETX terminates the text, RS (0x1e) separates reports, HT and LF survive
 * verbatim inside reports.
 */
const DLAC_ALPHABET: &[u8; 64] =
    b"\x03ABCDEFGHIJKLMNOPQRSTUVWXYZ\x1a\t\x1e\n| !\"#$%&'()*+,-./0123456789:;<=>?";

pub const ETX: char = '\x03';
pub const RECORD_SEPARATOR: char = '\x1e';

/// Unpack DLAC text from a byte slice. Decoding stops at ETX. When
/// `legacy` is set, a trailing 4-bit remnant (input not a multiple of
/// three bytes) is decoded as the high bits of one final character, a
/// quirk of early encoders; otherwise the remnant is discarded.
pub fn decode(data: &[u8], legacy: bool) -> String {
    let mut text = String::with_capacity(data.len() * 4 / 3);
    let total_bits = data.len() * 8;
    let mut pos = 0;
    while pos + 6 <= total_bits {
        let code = take6(data, pos);
        pos += 6;
        if code == 0 {
            return text;
        }
        text.push(DLAC_ALPHABET[code as usize] as char);
    }
    if legacy && total_bits - pos >= 4 {
        let mut code = 0u8;
        for i in 0..4 {
            let p = pos + i;
            let bit = (data[p / 8] >> (7 - p % 8)) & 1;
            code = (code << 1) | bit;
        }
        let code = code << 2;
        if code != 0 {
            text.push(DLAC_ALPHABET[code as usize] as char);
        }
    }
    text
}

fn take6(data: &[u8], pos: usize) -> u8 {
    let mut code = 0u8;
    for i in 0..6 {
        let p = pos + i;
        let bit = (data[p / 8] >> (7 - p % 8)) & 1;
        code = (code << 1) | bit;
    }
    code
}

/// Pack text into DLAC bytes, zero-padded to a byte boundary. Exercised by
/// the Trickle driver and the test fixtures.
pub fn encode(text: &str) -> Result<Vec<u8>, FisbError> {
    let mut bits: Vec<bool> = Vec::with_capacity(text.len() * 6);
    for ch in text.chars() {
        let code = encode_char(ch)?;
        for i in (0..6).rev() {
            bits.push(code >> i & 1 == 1);
        }
    }
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (7 - i % 8);
        }
    }
    Ok(bytes)
}

fn encode_char(ch: char) -> Result<u8, FisbError> {
    DLAC_ALPHABET
        .iter()
        .position(|&c| c as char == ch)
        .map(|p| p as u8)
        .ok_or_else(|| FisbError::Dlac(format!("character {ch:?} not in alphabet")))
}

/// Split decoded text into reports on the RS character, dropping empties
pub fn split_reports(text: &str) -> Vec<String> {
    text.split(RECORD_SEPARATOR)
        .map(|report| report.trim_matches(|c: char| c == ETX || c.is_whitespace()))
        .filter(|report| !report.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let text = "METAR KOCQ 140715Z AUTO 00000KT 10SM OVC120 03/02 A3025\nRMK AO1 T00310016=";
        let packed = encode(text).unwrap();
        assert_eq!(decode(&packed, false), text);
    }

    #[test]
    fn test_alphabet_identity() {
        // Codes 32..=63 coincide with ASCII
        for code in 32u8..=63 {
            assert_eq!(DLAC_ALPHABET[code as usize], code);
        }
        // Letters sit at 1..=26
        assert_eq!(DLAC_ALPHABET[1], b'A');
        assert_eq!(DLAC_ALPHABET[26], b'Z');
    }

    #[test]
    fn test_etx_terminates() {
        let mut packed = encode("ABC").unwrap();
        // "ABC" is 18 bits; the zero padding of the last byte reads as ETX
        packed.extend_from_slice(&encode("XYZ").unwrap());
        assert_eq!(decode(&packed, false), "ABC");
    }

    #[test]
    fn test_legacy_remnant() {
        // One byte holds one full character plus a 2-bit remnant: too short
        // for legacy mode; two bytes leave a 4-bit remnant which legacy
        // mode decodes
        let data = [0b000001_00, 0b0010_0101];
        assert_eq!(decode(&data, false), "AB");
        // remnant 0101 -> code 010100 = 20 = 'T'
        assert_eq!(decode(&data, true), "ABT");
    }

    #[test]
    fn test_split_reports() {
        let text = "METAR KAAA 140715Z=\x1eMETAR KBBB 140716Z=\x1e\x1e";
        let reports = split_reports(text);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], "METAR KAAA 140715Z=");
        assert_eq!(reports[1], "METAR KBBB 140716Z=");
    }
}
