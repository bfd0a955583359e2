//! Typed access to the validator, stake and slash contracts.
//!
//! Read paths go through an `eth_call`-style host interface against the
//! parent block's state; write paths are synthetic system transactions
//! applied through the shared machinery in [`super::system_tx`].

use super::{
    abi,
    config::ChainConfig,
    system_tx::{apply_system_transaction, FinalizeContext, SystemMessage},
    validator::SystemContracts,
    PosaError, Validator,
};
use alloy_consensus::{Header, Signed, TxLegacy};
use alloy_primitives::{Address, Bytes, B256, U256};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Hashes and signs seal data with the backing account.
pub type SignerFn =
    Arc<dyn Fn(Address, &[u8]) -> Result<[u8; 65], PosaError> + Send + Sync>;

/// Signs a synthetic system transaction with the backing account under the
/// given EIP-155 chain id.
pub type SignerTxFn =
    Arc<dyn Fn(Address, TxLegacy, u64) -> Result<Signed<TxLegacy>, PosaError> + Send + Sync>;

/// Contract access the engine consumes.
pub trait ContractClient: Send + Sync {
    /// Set the EIP-155 chain id used to hash system transactions. Called once
    /// during engine construction.
    fn set_signer(&self, chain_id: u64);

    /// Inject the local sealing identity and transaction signer. Called when
    /// the engine is authorized.
    fn inject(&self, val: Address, sign_tx_fn: SignerTxFn);

    /// Current span number, read against the header's parent state.
    fn get_current_span(&self, header: &Header) -> Result<U256, PosaError>;

    /// Committed validator set and system contracts for the given height.
    fn get_current_validators(
        &self,
        header_hash: B256,
        block_number: u64,
    ) -> Result<(Vec<Validator>, SystemContracts), PosaError>;

    /// Stakers eligible for sampling into the next span.
    fn get_eligible_validators(
        &self,
        header_hash: B256,
        block_number: u64,
    ) -> Result<Vec<Validator>, PosaError>;

    /// Whether a signer has already been slashed within the given span.
    fn is_slashed(
        &self,
        contract: Address,
        signer: Address,
        span: U256,
        header: &Header,
    ) -> Result<bool, PosaError>;

    /// Emit the `slash` system transaction against the slash manager.
    fn slash(
        &self,
        contract: Address,
        spoiled: Address,
        span: U256,
        ctx: &mut FinalizeContext<'_>,
    ) -> Result<(), PosaError>;

    /// Emit the `distributeReward` system transaction carrying the reward
    /// balance to the stake manager.
    fn distribute_to_validator(
        &self,
        contract: Address,
        amount: U256,
        validator: Address,
        ctx: &mut FinalizeContext<'_>,
    ) -> Result<(), PosaError>;

    /// Emit the `commitSpan` system transaction recording the next span's
    /// producer list into the validator contract.
    fn commit_span(
        &self,
        val: Address,
        validator_bytes: Bytes,
        ctx: &mut FinalizeContext<'_>,
    ) -> Result<(), PosaError>;
}

/// Read-only contract execution the host exposes to the client: an EVM call
/// against the state at the given block hash.
pub trait EthCall: Send + Sync {
    /// Execute `data` against `to` at the state of `block_hash`, returning
    /// the raw ABI return data.
    fn call(&self, to: Address, data: Bytes, block_hash: B256) -> Result<Bytes, PosaError>;
}

#[derive(Default)]
struct ClientIdentity {
    chain_id: u64,
    val: Address,
    sign_tx_fn: Option<SignerTxFn>,
}

/// Production [`ContractClient`] speaking raw ABI over an [`EthCall`] host.
pub struct AbiContractClient<E> {
    config: ChainConfig,
    eth: E,
    identity: RwLock<ClientIdentity>,
}

impl<E: EthCall> AbiContractClient<E> {
    /// Create a client for the given chain over the host call interface.
    pub fn new(config: ChainConfig, eth: E) -> Self {
        let chain_id = config.chain_id;
        Self {
            config,
            eth,
            identity: RwLock::new(ClientIdentity {
                chain_id,
                ..Default::default()
            }),
        }
    }

    fn identity(&self) -> (u64, Address, Option<SignerTxFn>) {
        let identity = self.identity.read();
        (identity.chain_id, identity.val, identity.sign_tx_fn.clone())
    }

    fn apply(&self, message: &SystemMessage, ctx: &mut FinalizeContext<'_>) -> Result<(), PosaError> {
        let (chain_id, val, sign_tx_fn) = self.identity();
        apply_system_transaction(chain_id, val, sign_tx_fn.as_ref(), message, ctx)
    }
}

impl<E: EthCall> ContractClient for AbiContractClient<E> {
    fn set_signer(&self, chain_id: u64) {
        self.identity.write().chain_id = chain_id;
    }

    fn inject(&self, val: Address, sign_tx_fn: SignerTxFn) {
        let mut identity = self.identity.write();
        identity.val = val;
        identity.sign_tx_fn = Some(sign_tx_fn);
    }

    fn get_current_span(&self, header: &Header) -> Result<U256, PosaError> {
        let data = abi::pack("currentSpanNumber()", &[]);
        let contract = self.config.validator_contract(header.number);
        let ret = self.eth.call(contract, data, header.parent_hash)?;
        abi::decode_u256(&ret, 0)
    }

    fn get_current_validators(
        &self,
        header_hash: B256,
        block_number: u64,
    ) -> Result<(Vec<Validator>, SystemContracts), PosaError> {
        let data = abi::pack(
            "getValidators(uint256)",
            &[abi::u256_word(U256::from(block_number))],
        );
        let contract = self.config.validator_contract(block_number);
        let ret = self.eth.call(contract, data, header_hash)?;

        let (addresses, powers, contracts) = abi::decode_validator_set(&ret)?;
        if addresses.len() != powers.len() {
            return Err(PosaError::ContractDecode {
                message: "validator and power arrays differ in length".to_string(),
            });
        }
        let validators = addresses
            .into_iter()
            .zip(powers)
            .map(|(address, power)| Validator::new(address, power.saturating_to::<u64>()))
            .collect();
        let contracts = SystemContracts {
            stake_manager: contracts[0],
            slash_manager: contracts[1],
            official_node: contracts[2],
        };
        Ok((validators, contracts))
    }

    fn get_eligible_validators(
        &self,
        header_hash: B256,
        block_number: u64,
    ) -> Result<Vec<Validator>, PosaError> {
        let data = abi::pack("getEligibleValidators()", &[]);
        let contract = self.config.validator_contract(block_number);
        let ret = self.eth.call(contract, data, header_hash)?;

        // The contract reports stakes in wei; sampling weights work on whole
        // tokens.
        let scale = U256::from(10u64).pow(U256::from(18u64));
        Ok(abi::decode_staker_set(&ret)?
            .into_iter()
            .map(|(address, power)| Validator::new(address, (power / scale).saturating_to::<u64>()))
            .collect())
    }

    fn is_slashed(
        &self,
        contract: Address,
        signer: Address,
        span: U256,
        header: &Header,
    ) -> Result<bool, PosaError> {
        let data = abi::pack(
            "isSignerSlashed(address,uint256)",
            &[abi::address_word(signer), abi::u256_word(span)],
        );
        let ret = self.eth.call(contract, data, header.parent_hash)?;
        abi::decode_bool(&ret, 0)
    }

    fn slash(
        &self,
        contract: Address,
        spoiled: Address,
        span: U256,
        ctx: &mut FinalizeContext<'_>,
    ) -> Result<(), PosaError> {
        debug!(%spoiled, %span, "slashing absent in-turn signer");
        let data = abi::pack(
            "slash(address,uint256)",
            &[abi::address_word(spoiled), abi::u256_word(span)],
        );
        let message = SystemMessage::new(ctx.header.beneficiary, contract, data, U256::ZERO);
        self.apply(&message, ctx)
    }

    fn distribute_to_validator(
        &self,
        contract: Address,
        amount: U256,
        validator: Address,
        ctx: &mut FinalizeContext<'_>,
    ) -> Result<(), PosaError> {
        let data = abi::pack("distributeReward(address)", &[abi::address_word(validator)]);
        let message = SystemMessage::new(ctx.header.beneficiary, contract, data, amount);
        self.apply(&message, ctx)
    }

    fn commit_span(
        &self,
        _val: Address,
        validator_bytes: Bytes,
        ctx: &mut FinalizeContext<'_>,
    ) -> Result<(), PosaError> {
        let data = abi::pack_bytes("commitSpan(bytes)", &validator_bytes);
        let contract = self.config.validator_contract(ctx.header.number);
        let message = SystemMessage::new(ctx.header.beneficiary, contract, data, U256::ZERO);
        self.apply(&message, ctx)
    }
}
