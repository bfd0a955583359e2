//! Header extra-data codec and seal hashing.
//!
//! Extra-data layout: a fixed 32 byte vanity prefix, an optional middle
//! payload (sorted signer addresses on authority-mode epoch checkpoints, the
//! span validator payload on validator-list update blocks) and a fixed
//! 65 byte secp256k1 seal suffix.

use super::{
    config::ChainConfig,
    validator::{parse_validators, SystemContracts, SYSTEM_CONTRACTS_BYTES, VALIDATOR_RECORD_BYTES},
    PosaError, Validator, EXTRA_SEAL, EXTRA_VANITY,
};
use alloy_consensus::Header;
use alloy_primitives::{keccak256, Address, B256};
use alloy_rlp::Encodable;

/// RLP bytes signed for authority sealing: the entire header apart from the
/// 65 byte seal at the end of the extra-data.
///
/// Headers shorter than the seal suffix hash with an empty extra field; such
/// headers can never carry a valid seal in the first place.
pub fn seal_message(header: &Header) -> Vec<u8> {
    let extra = header.extra_data.as_ref();
    let unsealed_extra = &extra[..extra.len().saturating_sub(EXTRA_SEAL)];

    let mut payload = Vec::with_capacity(512);
    header.parent_hash.encode(&mut payload);
    header.ommers_hash.encode(&mut payload);
    header.beneficiary.encode(&mut payload);
    header.state_root.encode(&mut payload);
    header.transactions_root.encode(&mut payload);
    header.receipts_root.encode(&mut payload);
    header.logs_bloom.encode(&mut payload);
    header.difficulty.encode(&mut payload);
    header.number.encode(&mut payload);
    header.gas_limit.encode(&mut payload);
    header.gas_used.encode(&mut payload);
    header.timestamp.encode(&mut payload);
    unsealed_extra.encode(&mut payload);
    header.mix_hash.encode(&mut payload);
    header.nonce.encode(&mut payload);
    if let Some(base_fee) = header.base_fee_per_gas {
        base_fee.encode(&mut payload);
    }

    let mut out = Vec::with_capacity(payload.len() + 3);
    alloy_rlp::Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Hash of a header prior to sealing.
pub fn seal_hash(header: &Header) -> B256 {
    keccak256(seal_message(header))
}

/// The 65 byte seal signature at the end of the extra-data.
pub fn seal_signature(header: &Header) -> Result<&[u8], PosaError> {
    let extra = header.extra_data.as_ref();
    if extra.len() < EXTRA_SEAL {
        return Err(PosaError::MissingSignature);
    }
    Ok(&extra[extra.len() - EXTRA_SEAL..])
}

/// The middle payload between vanity and seal.
pub fn extra_payload(header: &Header) -> Result<&[u8], PosaError> {
    let extra = header.extra_data.as_ref();
    if extra.len() < EXTRA_VANITY {
        return Err(PosaError::MissingVanity);
    }
    if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
        return Err(PosaError::MissingSignature);
    }
    Ok(&extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL])
}

/// Signer list embedded in an authority-mode epoch checkpoint.
pub fn checkpoint_signers(header: &Header) -> Result<Vec<Address>, PosaError> {
    let payload = extra_payload(header)?;
    if payload.len() % Address::len_bytes() != 0 {
        return Err(PosaError::InvalidCheckpointSigners);
    }
    Ok(payload
        .chunks_exact(Address::len_bytes())
        .map(Address::from_slice)
        .collect())
}

/// Validator payload embedded in a validator-list update block: the next
/// span's producers followed by the three system-contract addresses.
pub fn span_payload(header: &Header) -> Result<(Vec<Validator>, SystemContracts), PosaError> {
    let payload = extra_payload(header)?;
    if payload.len() < SYSTEM_CONTRACTS_BYTES
        || (payload.len() - SYSTEM_CONTRACTS_BYTES) % VALIDATOR_RECORD_BYTES != 0
    {
        return Err(PosaError::InvalidCheckpointSigners);
    }
    let split = payload.len() - SYSTEM_CONTRACTS_BYTES;
    let validators = parse_validators(&payload[..split])?;
    let contracts = SystemContracts::from_bytes(&payload[split..])?;
    Ok((validators, contracts))
}

/// Account a header votes on, or the zero address when no vote is cast.
///
/// Once Erawan is active the vote rides in the last 20 bytes of the mix
/// digest (with a zero tag byte in front); before that it occupies the
/// coinbase field.
pub fn vote_address(config: &ChainConfig, header: &Header) -> Address {
    if config.is_erawan(header.number) {
        if header.mix_hash[11] == 0 {
            Address::from_slice(&header.mix_hash[12..])
        } else {
            Address::ZERO
        }
    } else {
        header.beneficiary
    }
}

/// Pack a voted address into the mix-digest form used after Erawan.
pub fn vote_to_mix_digest(address: Address) -> B256 {
    let mut digest = B256::ZERO;
    digest[12..].copy_from_slice(address.as_slice());
    digest
}
