//! Span validators and the system-contract addresses they govern.

use super::PosaError;
use alloy_primitives::{Address, U256};
use alloy_rlp::RlpEncodable;
use serde::{Deserialize, Serialize};

/// Byte length of one encoded validator record in header extra-data:
/// 20 byte address followed by a 20 byte big-endian voting power.
pub const VALIDATOR_RECORD_BYTES: usize = 40;

/// Byte length of the system-contract suffix appended after the validator
/// records on validator-list update blocks.
pub const SYSTEM_CONTRACTS_BYTES: usize = 60;

/// A span validator: an eligible staker sampled into the producer committee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Account the validator seals with.
    #[serde(rename = "signer")]
    pub address: Address,
    /// Staked weight driving the sampling probability.
    #[serde(rename = "power")]
    pub voting_power: u64,
}

impl Validator {
    /// Create a new validator.
    pub fn new(address: Address, voting_power: u64) -> Self {
        Self {
            address,
            voting_power,
        }
    }

    /// The 40 byte header extra-data record for this validator.
    pub fn header_bytes(&self) -> [u8; VALIDATOR_RECORD_BYTES] {
        let mut out = [0u8; VALIDATOR_RECORD_BYTES];
        out[..20].copy_from_slice(self.address.as_slice());
        out[20..].copy_from_slice(&self.power_bytes());
        out
    }

    /// Voting power as a 20 byte big-endian word.
    pub fn power_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[12..].copy_from_slice(&self.voting_power.to_be_bytes());
        out
    }

    /// Minimal wire representation sent to the validator contract.
    pub fn minimal(&self) -> MinimalVal {
        MinimalVal {
            signer: self.address,
            voting_power: self.voting_power,
        }
    }
}

/// Minimal validator representation, RLP-encoded into `commitSpan` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable)]
pub struct MinimalVal {
    pub signer: Address,
    pub voting_power: u64,
}

/// The three consensus-critical contract addresses active for a span,
/// embedded in validator-list update blocks so a syncing node can recover
/// them without contract access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemContracts {
    /// Receives and books block rewards.
    pub stake_manager: Address,
    /// Records slashes of absent in-turn signers.
    pub slash_manager: Address,
    /// Reserved fallback producer operated by the network.
    pub official_node: Address,
}

impl SystemContracts {
    /// Encode as the 60 byte extra-data suffix.
    pub fn to_bytes(&self) -> [u8; SYSTEM_CONTRACTS_BYTES] {
        let mut out = [0u8; SYSTEM_CONTRACTS_BYTES];
        out[..20].copy_from_slice(self.stake_manager.as_slice());
        out[20..40].copy_from_slice(self.slash_manager.as_slice());
        out[40..].copy_from_slice(self.official_node.as_slice());
        out
    }

    /// Decode from the 60 byte extra-data suffix.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PosaError> {
        if bytes.len() != SYSTEM_CONTRACTS_BYTES {
            return Err(PosaError::InvalidCheckpointSigners);
        }
        Ok(Self {
            stake_manager: Address::from_slice(&bytes[..20]),
            slash_manager: Address::from_slice(&bytes[20..40]),
            official_node: Address::from_slice(&bytes[40..]),
        })
    }
}

/// Parse concatenated 40 byte validator records.
pub fn parse_validators(bytes: &[u8]) -> Result<Vec<Validator>, PosaError> {
    if bytes.len() % VALIDATOR_RECORD_BYTES != 0 {
        return Err(PosaError::InvalidCheckpointSigners);
    }
    Ok(bytes
        .chunks_exact(VALIDATOR_RECORD_BYTES)
        .map(|record| {
            let power = U256::from_be_slice(&record[20..]);
            Validator::new(Address::from_slice(&record[..20]), power.to::<u64>())
        })
        .collect())
}

/// Concatenate validator records into the header payload form.
pub fn encode_validators(validators: &[Validator]) -> Vec<u8> {
    let mut out = Vec::with_capacity(validators.len() * VALIDATOR_RECORD_BYTES);
    for validator in validators {
        out.extend_from_slice(&validator.header_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_record_round_trip() {
        let validators = vec![
            Validator::new(Address::repeat_byte(0x0a), 10),
            Validator::new(Address::repeat_byte(0x0b), 1 << 40),
        ];
        let bytes = encode_validators(&validators);
        assert_eq!(bytes.len(), 80);
        assert_eq!(parse_validators(&bytes).unwrap(), validators);
    }

    #[test]
    fn truncated_record_rejected() {
        let bytes = vec![0u8; 41];
        assert_eq!(
            parse_validators(&bytes),
            Err(PosaError::InvalidCheckpointSigners)
        );
    }

    #[test]
    fn system_contracts_round_trip() {
        let contracts = SystemContracts {
            stake_manager: Address::repeat_byte(0x01),
            slash_manager: Address::repeat_byte(0x02),
            official_node: Address::repeat_byte(0x03),
        };
        let bytes = contracts.to_bytes();
        assert_eq!(SystemContracts::from_bytes(&bytes).unwrap(), contracts);
    }

    #[test]
    fn power_bytes_are_big_endian() {
        let validator = Validator::new(Address::repeat_byte(0x0a), 0x0102);
        let power = validator.power_bytes();
        assert_eq!(&power[18..], &[0x01, 0x02]);
        assert!(power[..18].iter().all(|b| *b == 0));
    }
}
