use serde::{Deserialize, Serialize};

use crate::errors::FisbError;

/// Service Status frames (frame type 15) list the 24-bit target addresses
/// the station is currently providing TIS-B service to, four bytes per
/// entry: one flag byte and the address.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ServiceStatusRecord {
    pub addresses: Vec<String>,
}

pub fn decode_service_status(data: &[u8]) -> Result<ServiceStatusRecord, FisbError> {
    if data.len() % 4 != 0 {
        return Err(FisbError::Truncated("service status entry"));
    }
    let addresses = data
        .chunks_exact(4)
        .map(|chunk| format!("{:02x}{:02x}{:02x}", chunk[1], chunk[2], chunk[3]))
        .collect();
    Ok(ServiceStatusRecord { addresses })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses() {
        let data = [0x01, 0xa7, 0x4b, 0x2c, 0x01, 0x00, 0x01, 0xff];
        let record = decode_service_status(&data).unwrap();
        assert_eq!(record.addresses, vec!["a74b2c", "0001ff"]);
    }

    #[test]
    fn test_ragged_length_rejected() {
        assert!(decode_service_status(&[0x01, 0x02]).is_err());
    }
}
