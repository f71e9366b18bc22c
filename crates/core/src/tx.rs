//! Binary transaction format.
//!
//! Clients submit transactions as base64. The decoded layout, offsets in
//! bytes:
//!
//! ```text
//! 0        1         17              49            57       len-97      len-33
//! | version | id (16) | contract (32) | valid_till8 | payload | sig (64) | key (33) |
//! ```
//!
//! `valid_till` is a big-endian millisecond timestamp, 0 meaning no expiry.
//! The payload is UTF-8 JSON. Only the structure is checked here; signature
//! and contract semantics belong to the processor.

use crate::error::{CoreError, CoreResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Supported format version.
pub const FORMAT_VERSION: u8 = 1;

const ID_LEN: usize = 16;
const CONTRACT_HASH_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const PUBLIC_KEY_LEN: usize = 33;
/// Everything except the payload.
const ENVELOPE_LEN: usize = 1 + ID_LEN + CONTRACT_HASH_LEN + 8 + SIGNATURE_LEN + PUBLIC_KEY_LEN;

/// A structurally valid submitted transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u8,
    pub id: [u8; ID_LEN],
    pub contract_hash: [u8; CONTRACT_HASH_LEN],
    /// Millisecond timestamp after which the processor must reject, 0 = none.
    pub valid_till: u64,
    /// JSON text handed to the contract.
    pub payload: String,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Transaction {
    /// Decode a base64 submission.
    pub fn from_base64(data: &str) -> CoreResult<Self> {
        let bytes = BASE64
            .decode(data)
            .map_err(|e| CoreError::InvalidTransaction(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Decode the binary layout.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < ENVELOPE_LEN {
            return Err(CoreError::InvalidTransaction(format!(
                "{} bytes is below the minimum of {ENVELOPE_LEN}",
                bytes.len()
            )));
        }

        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(CoreError::InvalidTransaction(format!(
                "unsupported version {version}"
            )));
        }

        let mut offset = 1;
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&bytes[offset..offset + ID_LEN]);
        offset += ID_LEN;

        let mut contract_hash = [0u8; CONTRACT_HASH_LEN];
        contract_hash.copy_from_slice(&bytes[offset..offset + CONTRACT_HASH_LEN]);
        offset += CONTRACT_HASH_LEN;

        let valid_till = u64::from_be_bytes(
            bytes[offset..offset + 8]
                .try_into()
                .expect("slice length checked above"),
        );
        offset += 8;

        let payload_end = bytes.len() - SIGNATURE_LEN - PUBLIC_KEY_LEN;
        let payload = std::str::from_utf8(&bytes[offset..payload_end])
            .map_err(|_| CoreError::InvalidTransaction("payload is not valid UTF-8".to_string()))?
            .to_string();
        if serde_json::from_str::<serde_json::Value>(&payload).is_err() {
            return Err(CoreError::InvalidTransaction(
                "payload is not valid JSON".to_string(),
            ));
        }

        let signature = bytes[payload_end..payload_end + SIGNATURE_LEN].to_vec();
        let public_key = bytes[payload_end + SIGNATURE_LEN..].to_vec();

        Ok(Self {
            version,
            id,
            contract_hash,
            valid_till,
            payload,
            signature,
            public_key,
        })
    }

    /// Serialise back to the binary layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENVELOPE_LEN + self.payload.len());
        bytes.push(self.version);
        bytes.extend_from_slice(&self.id);
        bytes.extend_from_slice(&self.contract_hash);
        bytes.extend_from_slice(&self.valid_till.to_be_bytes());
        bytes.extend_from_slice(self.payload.as_bytes());
        bytes.extend_from_slice(&self.signature);
        bytes.extend_from_slice(&self.public_key);
        bytes
    }

    /// The transaction id as lower-case hex.
    pub fn id_hex(&self) -> String {
        hex_encode(&self.id)
    }

    /// The contract hash as lower-case hex.
    pub fn contract_hash_hex(&self) -> String {
        hex_encode(&self.contract_hash)
    }
}

/// Lower-case hex encoding.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse a 16-byte transaction id from hex.
pub fn parse_tx_id(value: &str) -> CoreResult<[u8; ID_LEN]> {
    if value.len() != ID_LEN * 2 {
        return Err(CoreError::InvalidTransaction(format!(
            "transaction id must be {} hex characters, got {}",
            ID_LEN * 2,
            value.len()
        )));
    }
    let mut id = [0u8; ID_LEN];
    for (i, byte) in id.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16).map_err(|_| {
            CoreError::InvalidTransaction(format!("transaction id '{value}' is not hex"))
        })?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction {
            version: FORMAT_VERSION,
            id: [0xab; ID_LEN],
            contract_hash: [0x11; CONTRACT_HASH_LEN],
            valid_till: 1_700_000_000_000,
            payload: r#"{"to":"wallet","amount":5}"#.to_string(),
            signature: vec![7; SIGNATURE_LEN],
            public_key: vec![9; PUBLIC_KEY_LEN],
        }
    }

    #[test]
    fn roundtrip_through_base64() {
        let tx = sample();
        let encoded = BASE64.encode(tx.to_bytes());
        let decoded = Transaction::from_base64(&encoded).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn empty_payload_allowed_if_json() {
        let mut tx = sample();
        tx.payload = "{}".to_string();
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded.payload, "{}");
    }

    #[test]
    fn rejects_truncated_input() {
        let err = Transaction::from_bytes(&[1, 2, 3]).unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 99;
        let err = Transaction::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn rejects_non_json_payload() {
        let mut tx = sample();
        tx.payload = "not json".to_string();
        assert!(Transaction::from_bytes(&tx.to_bytes()).is_err());
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(Transaction::from_base64("!!!not base64!!!").is_err());
    }

    #[test]
    fn id_hex_and_parse_are_inverse() {
        let tx = sample();
        assert_eq!(parse_tx_id(&tx.id_hex()).unwrap(), tx.id);
        assert!(parse_tx_id("zz").is_err());
        assert!(parse_tx_id(&"a".repeat(31)).is_err());
    }
}
