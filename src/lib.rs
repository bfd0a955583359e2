//! Siam node consensus library.
//!
//! Implements the hybrid proof-of-authority / proof-of-staked-authority
//! engine of a permissioned Ethereum-compatible chain. In its authority phase
//! the engine runs epoch-checkpointed signer voting; past the Chaophraya
//! activation it samples staked validators into fixed-length spans, lets the
//! official node stand in for absent producers, and settles slashing and
//! rewards through synthetic system transactions.
//!
//! The engine is host-agnostic: chain access, state mutation, contract calls
//! and snapshot persistence are all traits the embedding node implements.
//!
//! # Modules
//!
//! - [`consensus::posa`]: the engine, its snapshot state machine, validator
//!   selection, contract client and system-transaction plumbing.

pub mod consensus;

// Re-export the engine surface.
pub use consensus::posa::{
    ChainConfig, ChainHeaderReader, ContractClient, EvmState, KeyValueStore,
    MemoryKeyValueStore, Posa, PosaApi, PosaBlock, PosaConfig, PosaError, SignerFn, SignerTxFn,
    Snapshot, SystemContracts, Validator,
};
