//! State/EVM host abstraction.
//!
//! The engine mutates account balances and nonces directly for reward
//! plumbing, and hands fully-formed system messages to the host for EVM
//! execution. The host owns the actual state database and interpreter.

use super::{system_tx::SystemMessage, PosaError};
use alloy_consensus::Header;
use alloy_primitives::{Address, Log, B256, U256};

/// Result of executing a system message in the host EVM.
#[derive(Debug, Clone, Default)]
pub struct SystemCallOutcome {
    /// Gas consumed by the call.
    pub gas_used: u64,
    /// Logs emitted by the call, attributed to the enclosing transaction.
    pub logs: Vec<Log>,
}

/// Mutable view of the execution state during block processing.
pub trait EvmState {
    /// Current balance of an account.
    fn balance(&self, address: Address) -> U256;

    /// Overwrite the balance of an account.
    fn set_balance(&mut self, address: Address, balance: U256);

    /// Credit an account.
    fn add_balance(&mut self, address: Address, amount: U256);

    /// Current nonce of an account.
    fn nonce(&self, address: Address) -> u64;

    /// Overwrite the nonce of an account.
    fn set_nonce(&mut self, address: Address, nonce: u64);

    /// Execute a system message against the current state in the context of
    /// the given header.
    fn execute(
        &mut self,
        message: &SystemMessage,
        header: &Header,
    ) -> Result<SystemCallOutcome, PosaError>;

    /// Intermediate state root after the mutations applied so far.
    fn state_root(&mut self) -> B256;
}
