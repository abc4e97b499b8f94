use deku::prelude::*;
use serde::{Deserialize, Serialize};

use crate::decode::bits::BitCursor;
use crate::errors::FisbError;
use crate::model::BLOCK_BINS;

/**
 * Global block representation. Each image APDU carries one block: a tile
 * of 32 x 4 bins addressed by a 23-bit block number. Rows start at 0N 0E
 * and stack north up to 60N; past the northern numbering the blocks
 * mirror south. At scale 0 a bin is 1.5 arcmin of longitude by 1 arcmin
 * of latitude and a row holds 450 blocks; scales 1 and 2 multiply the
 * bins by 5 and 9 with 90 and 50 blocks per row.
 *
 * A run-length block encodes 128 bins as (run, value) bytes, value 7
 * being the explicit no-data encoding; the alternative form lists block
 * numbers whose bins are all zero.
 */

#[derive(Debug, PartialEq, DekuRead, Clone)]
#[deku(endian = "big")]
pub struct BlockHeader {
    #[deku(bits = "1")]
    pub rle_flag: u8,
    #[deku(bits = "23")]
    pub block_number: u32,
    #[deku(bits = "2")]
    pub scale: u8,
    #[deku(bits = "6")]
    pub reserved: u8,
}

pub const BLOCK_HEADER_BYTES: usize = 4;

/// Rows span 360 degrees at every scale and stop at 60 degrees latitude
pub fn blocks_per_row(scale: u8) -> u32 {
    match scale {
        0 => 450,
        1 => 90,
        _ => 50,
    }
}

/// First block number of the southern mirror at each scale
pub fn south_first_block(scale: u8) -> u32 {
    match scale {
        0 => 405_000, // 900 rows of 450
        1 => 16_200,  // 180 rows of 90
        _ => 5_000,   // 100 rows of 50
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ImageBlockRecord {
    pub block_number: u32,
    pub scale: u8,
    /// 128 bin values 0..=7, row-major from the northwest corner; absent
    /// for the empty-block form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bins: Option<Vec<u8>>,
    /// Block numbers whose bins are all zero
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_blocks: Option<Vec<u32>>,
}

pub fn decode_block(data: &[u8]) -> Result<ImageBlockRecord, FisbError> {
    if data.len() < BLOCK_HEADER_BYTES {
        return Err(FisbError::Truncated("image block header"));
    }
    let (_, header) = BlockHeader::from_bytes((data, 0))?;
    let body = &data[BLOCK_HEADER_BYTES..];
    if header.rle_flag == 1 {
        Ok(ImageBlockRecord {
            block_number: header.block_number,
            scale: header.scale,
            bins: Some(decode_runs(body)?),
            empty_blocks: None,
        })
    } else {
        let mut cursor = BitCursor::new(body);
        let mut empty = vec![header.block_number];
        while cursor.remaining_bits() >= 24 {
            empty.push(cursor.take(24)?);
        }
        Ok(ImageBlockRecord {
            block_number: header.block_number,
            scale: header.scale,
            bins: None,
            empty_blocks: Some(empty),
        })
    }
}

fn decode_runs(body: &[u8]) -> Result<Vec<u8>, FisbError> {
    let mut bins = Vec::with_capacity(BLOCK_BINS);
    for &byte in body {
        let run = (byte >> 3) as usize + 1;
        let value = byte & 0x07;
        if bins.len() + run > BLOCK_BINS {
            return Err(FisbError::ImageBlock(format!(
                "runs overflow {BLOCK_BINS} bins"
            )));
        }
        bins.extend(std::iter::repeat(value).take(run));
        if bins.len() == BLOCK_BINS {
            return Ok(bins);
        }
    }
    Err(FisbError::ImageBlock(format!(
        "runs cover {} of {BLOCK_BINS} bins",
        bins.len()
    )))
}

/// Geographic extent of a block: (west, south) corner in degrees plus the
/// per-bin sizes. North of the equator rows stack up, south rows stack
/// down.
pub fn block_bounds(block_number: u32, scale: u8) -> Result<BlockBounds, FisbError> {
    if scale > 2 {
        return Err(FisbError::ImageBlock(format!("scale {scale}")));
    }
    let factor = match scale {
        0 => 1.0,
        1 => 5.0,
        _ => 9.0,
    };
    let bin_width_deg = 1.5 / 60.0 * factor;
    let bin_height_deg = 1.0 / 60.0 * factor;
    let block_width_deg = bin_width_deg * 32.0;
    let block_height_deg = bin_height_deg * 4.0;

    let per_row = blocks_per_row(scale);
    let south_first = south_first_block(scale);
    let (row, column, south) = if block_number < south_first {
        (block_number / per_row, block_number % per_row, false)
    } else {
        let offset = block_number - south_first;
        (offset / per_row, offset % per_row, true)
    };

    let mut west = column as f64 * block_width_deg;
    if west >= 180.0 {
        west -= 360.0;
    }
    let south_edge = if south {
        -((row + 1) as f64 * block_height_deg)
    } else {
        row as f64 * block_height_deg
    };
    Ok(BlockBounds {
        west,
        south: south_edge,
        bin_width_deg,
        bin_height_deg,
    })
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct BlockBounds {
    pub west: f64,
    pub south: f64,
    pub bin_width_deg: f64,
    pub bin_height_deg: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_header(rle: bool, number: u32, scale: u8) -> [u8; 4] {
        let word: u32 =
            ((rle as u32) << 31) | (number << 8) | ((scale as u32) << 6);
        word.to_be_bytes()
    }

    #[test]
    fn test_rle_block() {
        let mut data = block_header(true, 90_000, 0).to_vec();
        // 128 bins: 32 zeros, 64 threes, 32 sevens
        data.push((31 << 3) | 0);
        data.push((31 << 3) | 3);
        data.push((31 << 3) | 3);
        data.push((31 << 3) | 7);
        let block = decode_block(&data).unwrap();
        assert_eq!(block.block_number, 90_000);
        let bins = block.bins.unwrap();
        assert_eq!(bins.len(), BLOCK_BINS);
        assert_eq!(bins[0], 0);
        assert_eq!(bins[32], 3);
        assert_eq!(bins[127], 7);
    }

    #[test]
    fn test_short_runs_rejected() {
        let mut data = block_header(true, 1, 0).to_vec();
        data.push((31 << 3) | 1);
        assert!(matches!(
            decode_block(&data),
            Err(FisbError::ImageBlock(_))
        ));
    }

    #[test]
    fn test_empty_blocks() {
        let mut data = block_header(false, 1000, 1).to_vec();
        for number in [1001u32, 1002, 1450] {
            data.extend_from_slice(&number.to_be_bytes()[1..4]);
        }
        let block = decode_block(&data).unwrap();
        assert_eq!(
            block.empty_blocks,
            Some(vec![1000, 1001, 1002, 1450])
        );
        assert!(block.bins.is_none());
    }

    #[test]
    fn test_block_bounds() {
        // Block 0 sits at the equator/prime meridian corner
        let bounds = block_bounds(0, 0).unwrap();
        assert_eq!(bounds.west, 0.0);
        assert_eq!(bounds.south, 0.0);

        // One row up is 4 arcmin north
        let bounds = block_bounds(450, 0).unwrap();
        assert!((bounds.south - 4.0 / 60.0).abs() < 1e-9);

        // First southern block reaches down one block height
        let bounds = block_bounds(south_first_block(0), 0).unwrap();
        assert!((bounds.south + 4.0 / 60.0).abs() < 1e-9);

        // Scale 1 blocks are five times as large, 90 per row
        let bounds = block_bounds(91, 1).unwrap();
        assert!((bounds.bin_width_deg - 0.125).abs() < 1e-9);
        assert!((bounds.west - 4.0).abs() < 1e-9);
        assert!((bounds.south - 1.0 / 3.0).abs() < 1e-9);

        assert!(block_bounds(0, 3).is_err());
    }
}
