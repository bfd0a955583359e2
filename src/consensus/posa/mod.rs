//! Hybrid PoA / PoSA consensus engine.
//!
//! A modified Clique: blocks are sealed by a rotating set of authorized
//! signers, and signer-set changes are voted on through header fields. After
//! the Chaophraya activation height the engine switches to proof-of-staked
//! authority: validator committees are sampled from the staking contracts
//! into fixed-length spans, an official fallback node may stand in for absent
//! producers, and slashing / reward distribution run as synthetic system
//! transactions injected at block finalization.
//!
//! Storage and contract access are abstracted behind traits so the engine can
//! be driven by an in-memory harness in tests.

mod abi;
mod api;
mod config;
mod contract;
mod database;
mod engine;
mod error;
mod header;
mod selection;
mod snapshot;
mod state;
mod system_tx;
mod validator;


pub use api::PosaApi;
pub use config::{ChainConfig, PosaConfig};
pub use contract::{AbiContractClient, ContractClient, EthCall, SignerFn, SignerTxFn};
pub use database::{
    load_snapshot, store_snapshot, KeyValueStore, MemoryKeyValueStore, SNAPSHOT_KEY_PREFIX,
};
pub use engine::{ChainHeaderReader, Posa, PosaBlock};
pub use error::PosaError;
pub use header::{seal_hash, seal_message, vote_address};
pub use selection::select_next_validator_set;
pub use snapshot::{Snapshot, Tally, Vote};
pub use state::{EvmState, SystemCallOutcome};
pub use system_tx::{is_system_transaction, FinalizeContext, SystemMessage};
pub use validator::{MinimalVal, SystemContracts, Validator};

use alloy_primitives::{address, Address, B64, U256};
use std::time::Duration;

/// Fixed number of extra-data prefix bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for the seal (65 byte
/// secp256k1 signature).
pub const EXTRA_SEAL: usize = 65;

/// Default number of blocks after which to checkpoint and reset the pending votes.
pub const EPOCH_LENGTH: u64 = 30000;

/// Number of blocks after which to save the vote snapshot to the database.
pub const CHECKPOINT_INTERVAL: u64 = 1024;

/// Number of recent vote snapshots to keep in memory.
pub const INMEMORY_SNAPSHOTS: usize = 128;

/// Number of recent block signatures to keep in memory.
pub const INMEMORY_SIGNATURES: usize = 4096;

/// Block difficulty for in-turn signatures.
pub const DIFF_IN_TURN: U256 = U256::from_limbs([2, 0, 0, 0]);

/// Block difficulty for out-of-turn signatures.
pub const DIFF_NO_TURN: U256 = U256::from_limbs([1, 0, 0, 0]);

/// Magic nonce number to vote on adding a new signer.
pub const NONCE_AUTH_VOTE: B64 = B64::new([0xff; 8]);

/// Magic nonce number to vote on removing a signer.
pub const NONCE_DROP_VOTE: B64 = B64::new([0x00; 8]);

/// Random delay (per signer) to allow concurrent out-of-turn signers.
pub const WIGGLE_TIME: Duration = Duration::from_millis(500);

/// Extra delay before the official node seals a fallback block, giving the
/// in-turn producer a last chance unless it has already been slashed.
pub const FALLBACK_DELAY: Duration = Duration::from_secs(2);

/// Account that accumulates transaction fees during block execution; drained
/// into the coinbase and forwarded to the stake manager at finalization.
pub const SYSTEM_ADDRESS: Address = address!("ffffFFFfFFffffffffffffffFfFFFfffFFFfFFfE");

/// Gas allowance for synthetic system transactions.
pub const SYSTEM_TX_GAS: u64 = u64::MAX / 2;

/// Maximum header gas limit (2^63 - 1).
pub const MAX_GAS_LIMIT: u64 = 0x7fffffffffffffff;

/// Minimum header gas limit enforced on drift checks.
pub const MIN_GAS_LIMIT: u64 = 5000;

/// Maximum relative gas-limit adjustment between consecutive blocks (1/1024).
pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;
