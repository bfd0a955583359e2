//! User-facing voting control and snapshot inspection.
//!
//! This is the transport-free service object behind the host's RPC namespace:
//! the host wires these methods to whatever surface it exposes.

use super::{
    database::KeyValueStore,
    engine::{ChainHeaderReader, Posa},
    snapshot::Snapshot,
    PosaError,
};
use alloy_primitives::{Address, B256};
use std::collections::HashMap;
use std::sync::Arc;

/// Handle over the engine for signer-voting control.
pub struct PosaApi<DB> {
    engine: Arc<Posa<DB>>,
}

impl<DB: KeyValueStore> PosaApi<DB> {
    pub(crate) fn new(engine: Arc<Posa<DB>>) -> Self {
        Self { engine }
    }

    /// Snapshot at the given block number, or at the chain head when `None`.
    pub fn get_snapshot<C: ChainHeaderReader>(
        &self,
        chain: &C,
        number: Option<u64>,
    ) -> Result<Snapshot, PosaError> {
        let header = match number {
            Some(number) => chain.get_header_by_number(number),
            None => chain.current_header(),
        }
        .ok_or(PosaError::UnknownBlock)?;

        self.engine
            .snapshot(chain, header.number, header.hash_slow(), None)
    }

    /// Snapshot at the given block hash.
    pub fn get_snapshot_at_hash<C: ChainHeaderReader>(
        &self,
        chain: &C,
        hash: B256,
    ) -> Result<Snapshot, PosaError> {
        let header = chain
            .get_header_by_hash(hash)
            .ok_or(PosaError::UnknownBlock)?;
        self.engine.snapshot(chain, header.number, hash, None)
    }

    /// Authorized signers at the given block number, or at the head.
    pub fn get_signers<C: ChainHeaderReader>(
        &self,
        chain: &C,
        number: Option<u64>,
    ) -> Result<Vec<Address>, PosaError> {
        Ok(self.get_snapshot(chain, number)?.signers_list())
    }

    /// Proposals this node currently votes on.
    pub fn proposals(&self) -> HashMap<Address, bool> {
        self.engine.proposals()
    }

    /// Start voting to authorize or deauthorize an address.
    pub fn propose(&self, address: Address, authorize: bool) {
        self.engine.propose(address, authorize);
    }

    /// Stop voting on an address.
    pub fn discard(&self, address: Address) {
        self.engine.discard(address);
    }
}
