//! Hand-rolled ABI packing and unpacking for the three system contracts.
//!
//! The engine only ever touches a handful of fixed signatures, so call data
//! is assembled from selectors and 32 byte words directly instead of pulling
//! in a full ABI machinery.

use super::PosaError;
use alloy_primitives::{keccak256, Address, Bytes, U256};

const WORD: usize = 32;

/// First four bytes of `keccak256(signature)`.
pub(crate) fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&hash[..4]);
    selector
}

/// ABI word for an address (left padded).
pub(crate) fn address_word(address: Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(address.as_slice());
    word
}

/// ABI word for an unsigned integer.
pub(crate) fn u256_word(value: U256) -> [u8; WORD] {
    value.to_be_bytes()
}

/// Selector plus static words.
pub(crate) fn pack(signature: &str, args: &[[u8; WORD]]) -> Bytes {
    let mut data = Vec::with_capacity(4 + args.len() * WORD);
    data.extend_from_slice(&function_selector(signature));
    for arg in args {
        data.extend_from_slice(arg);
    }
    Bytes::from(data)
}

/// Selector plus a single dynamic `bytes` argument.
pub(crate) fn pack_bytes(signature: &str, payload: &[u8]) -> Bytes {
    let padded_len = payload.len().div_ceil(WORD) * WORD;
    let mut data = Vec::with_capacity(4 + 2 * WORD + padded_len);
    data.extend_from_slice(&function_selector(signature));
    data.extend_from_slice(&u256_word(U256::from(WORD)));
    data.extend_from_slice(&u256_word(U256::from(payload.len())));
    data.extend_from_slice(payload);
    data.resize(4 + 2 * WORD + padded_len, 0);
    Bytes::from(data)
}

fn malformed(message: &str) -> PosaError {
    PosaError::ContractDecode {
        message: message.to_string(),
    }
}

/// The `index`-th 32 byte word of return data.
pub(crate) fn word(data: &[u8], index: usize) -> Result<&[u8], PosaError> {
    let start = index * WORD;
    data.get(start..start + WORD)
        .ok_or_else(|| malformed("return data too short"))
}

/// Decode a `uint256` return word.
pub(crate) fn decode_u256(data: &[u8], index: usize) -> Result<U256, PosaError> {
    Ok(U256::from_be_slice(word(data, index)?))
}

/// Decode a `bool` return word.
pub(crate) fn decode_bool(data: &[u8], index: usize) -> Result<bool, PosaError> {
    Ok(word(data, index)?[WORD - 1] != 0)
}

/// Decode an `address` return word.
pub(crate) fn decode_address(data: &[u8], index: usize) -> Result<Address, PosaError> {
    Ok(Address::from_slice(&word(data, index)?[12..]))
}

fn checked_offset(data: &[u8], index: usize) -> Result<usize, PosaError> {
    let offset = decode_u256(data, index)?;
    let offset = usize::try_from(offset).map_err(|_| malformed("offset out of range"))?;
    if offset % WORD != 0 || offset >= data.len() {
        return Err(malformed("misaligned dynamic offset"));
    }
    Ok(offset / WORD)
}

fn array_len(data: &[u8], word_index: usize) -> Result<usize, PosaError> {
    let len = decode_u256(data, word_index)?;
    usize::try_from(len).map_err(|_| malformed("array length out of range"))
}

/// Decode `(address[], uint256[], address[3])`, the return shape of
/// `getValidators(uint256)`.
#[allow(clippy::type_complexity)]
pub(crate) fn decode_validator_set(
    data: &[u8],
) -> Result<(Vec<Address>, Vec<U256>, [Address; 3]), PosaError> {
    let addresses_at = checked_offset(data, 0)?;
    let powers_at = checked_offset(data, 1)?;

    let len = array_len(data, addresses_at)?;
    let mut addresses = Vec::with_capacity(len);
    for i in 0..len {
        addresses.push(decode_address(data, addresses_at + 1 + i)?);
    }

    let len = array_len(data, powers_at)?;
    let mut powers = Vec::with_capacity(len);
    for i in 0..len {
        powers.push(decode_u256(data, powers_at + 1 + i)?);
    }

    let contracts = [
        decode_address(data, 2)?,
        decode_address(data, 3)?,
        decode_address(data, 4)?,
    ];
    Ok((addresses, powers, contracts))
}

/// Decode `(address,uint256)[]`, the return shape of
/// `getEligibleValidators()`.
pub(crate) fn decode_staker_set(data: &[u8]) -> Result<Vec<(Address, U256)>, PosaError> {
    let tuples_at = checked_offset(data, 0)?;
    let len = array_len(data, tuples_at)?;
    let mut stakers = Vec::with_capacity(len);
    for i in 0..len {
        let base = tuples_at + 1 + 2 * i;
        stakers.push((decode_address(data, base)?, decode_u256(data, base + 1)?));
    }
    Ok(stakers)
}
