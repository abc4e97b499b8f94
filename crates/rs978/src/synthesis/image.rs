use chrono::Duration;

use crate::decode::products::ImageBlockRecord;
use crate::decode::time::{self, horizons};
use crate::errors::FisbError;
use crate::model::{ImagePayload, Product, ProductType, BLOCK_BINS};
use crate::reassembly::Assembled;
use crate::synthesis::image_ttl_minutes;

/// Image product classes by wire id
pub fn image_type(product_id: u16) -> Result<ProductType, FisbError> {
    match product_id {
        63 => Ok(ProductType::NexradRegional),
        64 => Ok(ProductType::NexradConus),
        70 => Ok(ProductType::IcingLow),
        71 => Ok(ProductType::IcingHigh),
        84 => Ok(ProductType::CloudTops),
        90 => Ok(ProductType::TurbulenceLow),
        91 => Ok(ProductType::TurbulenceHigh),
        103 => Ok(ProductType::Lightning),
        other => Err(FisbError::UnknownProduct(other)),
    }
}

/// One product per block. The empty-block form fans out into one
/// all-zero-bins product per listed block.
pub fn block_products(
    assembled: &Assembled,
    block: &ImageBlockRecord,
) -> Result<Vec<Product>, FisbError> {
    let product_id = assembled
        .product_id
        .ok_or(FisbError::UnknownProduct(0))?;
    let product_type = image_type(product_id)?;
    let valid_time = if assembled.time.is_empty() {
        assembled.rcvd_time
    } else {
        time::resolve(
            &assembled.time,
            assembled.rcvd_time,
            horizons::GENERIC,
            "image validity",
        )?
    };
    let expiration =
        valid_time + Duration::minutes(image_ttl_minutes(product_id));

    let build = |block_number: u32, bins: Vec<u8>| {
        let mut product = Product::new(
            product_type,
            format!("{product_id}-{}-{block_number}", block.scale),
            assembled.rcvd_time,
            expiration,
        );
        product.product_id = Some(product_id);
        product.observation_time = Some(valid_time);
        product.image = Some(ImagePayload {
            block_number,
            scale: block.scale,
            valid_time,
            bins,
        });
        product
    };

    if let Some(bins) = &block.bins {
        return Ok(vec![build(block.block_number, bins.clone())]);
    }
    let empty = block
        .empty_blocks
        .as_deref()
        .ok_or_else(|| FisbError::ImageBlock("block carries no bins".into()))?;
    Ok(empty
        .iter()
        .map(|&number| build(number, vec![0u8; BLOCK_BINS]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::time::{to_iso8601, PartialTime};
    use crate::reassembly::AssembledKind;

    fn assembled(product_id: u16) -> Assembled {
        Assembled {
            station: "-84.21844~39.90097".into(),
            rcvd_time: "2021-05-14T07:18:00Z".parse().unwrap(),
            product_id: Some(product_id),
            time: PartialTime {
                hour: Some(7),
                minute: Some(10),
                second: Some(0),
                ..Default::default()
            },
            kind: AssembledKind::Text { reports: vec![] },
        }
    }

    #[test]
    fn test_single_block() {
        let block = ImageBlockRecord {
            block_number: 90_000,
            scale: 0,
            bins: Some(vec![2u8; BLOCK_BINS]),
            empty_blocks: None,
        };
        let products = block_products(&assembled(64), &block).unwrap();
        assert_eq!(products.len(), 1);
        let product = &products[0];
        assert_eq!(product.product_type, ProductType::NexradConus);
        assert_eq!(product.unique_name, "64-0-90000");
        let image = product.image.as_ref().unwrap();
        assert_eq!(to_iso8601(&image.valid_time), "2021-05-14T07:10:00Z");
        // Radar TTL is 75 minutes past validity
        assert_eq!(
            product.expiration_time - image.valid_time,
            Duration::minutes(75)
        );
    }

    #[test]
    fn test_empty_blocks_fan_out() {
        let block = ImageBlockRecord {
            block_number: 1000,
            scale: 1,
            bins: None,
            empty_blocks: Some(vec![1000, 1001, 1090]),
        };
        let products = block_products(&assembled(84), &block).unwrap();
        assert_eq!(products.len(), 3);
        assert_eq!(products[0].product_type, ProductType::CloudTops);
        assert_eq!(products[2].unique_name, "84-1-1090");
        assert!(products[1]
            .image
            .as_ref()
            .unwrap()
            .bins
            .iter()
            .all(|&bin| bin == 0));
    }
}
