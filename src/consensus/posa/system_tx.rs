//! Synthetic system transactions.
//!
//! Consensus-mandated state mutations (span commitment, slashing, reward
//! distribution) ride the regular transaction-apply path as zero-gas-price
//! transactions from the block coinbase. While mining, the engine signs them
//! with the local key; while verifying, it reconstructs the expected
//! transaction and matches its EIP-155 signing hash against the next entry of
//! the block's received system-transaction stream. Any mismatch rejects the
//! block: the hashes are consensus-critical.

use super::{state::EvmState, PosaError, SignerTxFn, SYSTEM_TX_GAS};
use alloy_consensus::{transaction::SignableTransaction, Header, Receipt, Signed, TxLegacy};
use alloy_primitives::{Address, Bytes, TxKind, U256};
use tracing::warn;

/// A consensus-crafted call message: zero gas price, half-max gas, sent by
/// the block coinbase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMessage {
    /// Sender, always the block coinbase.
    pub from: Address,
    /// Target system contract.
    pub to: Address,
    /// Gas allowance.
    pub gas: u64,
    /// Value transferred with the call.
    pub value: U256,
    /// ABI-encoded call data.
    pub data: Bytes,
}

impl SystemMessage {
    /// Build a system message for the given contract call.
    pub fn new(from: Address, to: Address, data: Bytes, value: U256) -> Self {
        Self {
            from,
            to,
            gas: SYSTEM_TX_GAS,
            value,
            data,
        }
    }
}

/// Everything a system-transaction apply needs from the finalization site:
/// the mutable state, the header being finalized, the transaction/receipt
/// accumulators, the received system transactions (verification only) and the
/// running gas counter.
pub struct FinalizeContext<'a> {
    /// Execution state for the block.
    pub state: &'a mut dyn EvmState,
    /// Header being finalized.
    pub header: &'a Header,
    /// Transactions accumulated into the block, system transactions appended
    /// in consensus order.
    pub txs: &'a mut Vec<Signed<TxLegacy>>,
    /// Receipts accumulated alongside.
    pub receipts: &'a mut Vec<Receipt>,
    /// System transactions received with the block, consumed front to back
    /// while verifying. `None` while mining.
    pub received: Option<&'a mut Vec<Signed<TxLegacy>>>,
    /// Running total of gas used by the block.
    pub used_gas: &'a mut u64,
    /// Whether the engine is producing (signs) or verifying (matches).
    pub mining: bool,
}

/// The transaction a system message deterministically maps to.
pub fn expected_transaction(chain_id: u64, nonce: u64, message: &SystemMessage) -> TxLegacy {
    TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price: 0,
        gas_limit: message.gas,
        to: TxKind::Call(message.to),
        value: message.value,
        input: message.data.clone(),
    }
}

/// Apply a system message as a transaction: sign or match it, execute it in
/// the host EVM, and book the transaction, receipt, gas and sender nonce.
pub fn apply_system_transaction(
    chain_id: u64,
    val: Address,
    sign_tx_fn: Option<&SignerTxFn>,
    message: &SystemMessage,
    ctx: &mut FinalizeContext<'_>,
) -> Result<(), PosaError> {
    let nonce = ctx.state.nonce(message.from);
    let expected = expected_transaction(chain_id, nonce, message);
    let expected_hash = expected.signature_hash();

    let tx = if ctx.mining && message.from == val {
        let sign_tx = sign_tx_fn.ok_or_else(|| PosaError::SigningFailed {
            message: "transaction signer not injected".to_string(),
        })?;
        sign_tx(val, expected, chain_id)?
    } else {
        let received = ctx.received.as_deref_mut().ok_or(PosaError::MissingSystemTx)?;
        if received.is_empty() {
            return Err(PosaError::MissingSystemTx);
        }
        let actual = received.remove(0);
        let actual_hash = actual.tx().signature_hash();
        if actual_hash != expected_hash {
            warn!(
                expected = %expected_hash,
                got = %actual_hash,
                to = %message.to,
                "received system transaction does not match the synthesized one"
            );
            return Err(PosaError::SystemTxMismatch {
                expected: expected_hash,
                got: actual_hash,
            });
        }
        actual
    };

    let outcome = ctx.state.execute(message, ctx.header)?;
    *ctx.used_gas += outcome.gas_used;

    ctx.txs.push(tx);
    ctx.receipts.push(Receipt {
        status: true.into(),
        cumulative_gas_used: *ctx.used_gas,
        logs: outcome.logs,
    });
    ctx.state.set_nonce(message.from, nonce + 1);
    Ok(())
}

/// Whether a transaction is a system transaction for the given header:
/// sent by the coinbase to a system contract at gas price zero.
pub fn is_system_transaction(
    tx: &Signed<TxLegacy>,
    sender: Address,
    header: &Header,
    system_contracts: &[Address],
) -> bool {
    let TxKind::Call(to) = tx.tx().to else {
        return false;
    };
    sender == header.beneficiary && system_contracts.contains(&to) && tx.tx().gas_price == 0
}
