//! Consensus engine errors.

use alloy_primitives::{Address, B256, U256};
use thiserror::Error;

/// Errors produced while verifying, preparing, finalizing or sealing blocks.
///
/// Verification errors are surfaced to the caller unchanged; the engine never
/// retries locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PosaError {
    /// Operation referenced a block unknown to the local chain.
    #[error("unknown block")]
    UnknownBlock,

    /// Block timestamp is ahead of wall-clock time.
    #[error("block in the future: block time {block_time}, current time {current_time}")]
    FutureBlock {
        block_time: u64,
        current_time: u64,
    },

    /// Parent of the verified header is missing or does not chain.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Checkpoint block carries a non-zero beneficiary / vote address.
    #[error("beneficiary in checkpoint block non-zero")]
    InvalidCheckpointBeneficiary,

    /// Vote nonce is neither the auth nor the drop magic value.
    #[error("vote nonce not 0x00..0 or 0xff..f")]
    InvalidVote,

    /// Checkpoint block carries a non-zero vote nonce.
    #[error("vote nonce in checkpoint block non-zero")]
    InvalidCheckpointVote,

    /// Extra-data is shorter than the 32 byte vanity prefix.
    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    /// Extra-data is shorter than vanity plus the 65 byte seal.
    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,

    /// Non-checkpoint block carries a signer or validator payload.
    #[error("non-checkpoint block contains extra signer list")]
    ExtraSigners,

    /// Checkpoint payload has an invalid shape.
    #[error("invalid signer list on checkpoint block")]
    InvalidCheckpointSigners,

    /// Checkpoint signer list differs from the locally computed one.
    #[error("mismatching signer list on checkpoint block")]
    MismatchingCheckpointSigners,

    /// Embedded span validator payload differs from the contract report.
    #[error("mismatching validator list on span transition block")]
    MismatchingSpanValidators,

    /// Non-zero mix digest before the Erawan activation.
    #[error("non-zero mix digest")]
    InvalidMixDigest,

    /// Block declares uncles.
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// Difficulty is outside the {1, 2} domain, or a difficulty-1 block was
    /// produced by someone other than the official node after Chaophraya.
    #[error("invalid difficulty: {difficulty}")]
    InvalidDifficulty { difficulty: U256 },

    /// Declared difficulty does not match the signer's turn.
    #[error("wrong difficulty for signer {signer} at block {block}")]
    WrongDifficulty { signer: Address, block: u64 },

    /// Timestamp too close to the parent block.
    #[error("invalid timestamp: parent {parent_time} + period {period} > block {block_time}")]
    InvalidTimestamp {
        parent_time: u64,
        period: u64,
        block_time: u64,
    },

    /// Snapshot application attempted on out-of-range or non-contiguous headers.
    #[error("invalid voting chain")]
    InvalidVotingChain,

    /// Header sealed by a non-authorized account.
    #[error("unauthorized signer {signer}")]
    UnauthorizedSigner { signer: Address },

    /// Signer sealed again inside its exclusion window.
    #[error("signer {signer} recently signed at block {recent_block}")]
    RecentlySigned { signer: Address, recent_block: u64 },

    /// Snapshot could not be retrieved for the requested block.
    #[error("failed to retrieve voting snapshot")]
    GetSnapshotFailed,

    /// Span state reported by the contracts is unusable.
    #[error("invalid span")]
    InvalidSpan,

    /// Gas limit above the protocol maximum.
    #[error("invalid gasLimit: have {gas_limit}, max {max_gas_limit}")]
    GasLimitExceeded { gas_limit: u64, max_gas_limit: u64 },

    /// Gas limit drifted too far from the parent block.
    #[error("invalid gasLimit: have {gas_limit}, parent {parent_gas_limit}")]
    InvalidGasLimit {
        gas_limit: u64,
        parent_gas_limit: u64,
    },

    /// Gas used exceeds the declared gas limit.
    #[error("invalid gasUsed: have {gas_used}, gasLimit {gas_limit}")]
    GasUsedExceeded { gas_used: u64, gas_limit: u64 },

    /// Base fee present before London, absent after, or miscomputed.
    #[error("invalid baseFee: have {have:?}, want {want:?}")]
    InvalidBaseFee { have: Option<u64>, want: Option<u64> },

    /// Block declares uncles, which are meaningless under authority sealing.
    #[error("uncles not allowed")]
    UnclesNotAllowed,

    /// The seal signature could not be recovered to a signer address.
    #[error("signature recovery failed: {message}")]
    SignatureRecoveryFailed { message: String },

    /// Sealing refused because the chain is period-0 and the block is empty.
    #[error("sealing paused while waiting for transactions")]
    WaitingForTransactions,

    /// Snapshot store access failed.
    #[error("snapshot store error: {message}")]
    Store { message: String },

    /// A read-only contract call failed.
    #[error("contract call failed: {message}")]
    ContractCall { message: String },

    /// Returned contract data could not be decoded.
    #[error("contract returned malformed data: {message}")]
    ContractDecode { message: String },

    /// System transaction execution failed in the EVM host.
    #[error("system transaction execution failed: {message}")]
    Evm { message: String },

    /// A block did not carry the system transaction the engine synthesized.
    #[error("expected system tx hash {expected}, got {got}")]
    SystemTxMismatch { expected: B256, got: B256 },

    /// The received transaction stream ran out before all mandated system
    /// transactions were matched.
    #[error("supposed to get an actual system transaction, but got none")]
    MissingSystemTx,

    /// Signing credentials missing or the signer callback failed.
    #[error("signing failed: {message}")]
    SigningFailed { message: String },
}
