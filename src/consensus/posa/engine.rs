//! The consensus engine: header verification, snapshot derivation, block
//! preparation, finalization and sealing.

use super::{
    api::PosaApi,
    config::ChainConfig,
    contract::{ContractClient, SignerFn, SignerTxFn},
    database::{load_snapshot, store_snapshot, KeyValueStore},
    header::{self, checkpoint_signers, seal_message, span_payload, vote_address, vote_to_mix_digest},
    selection::select_next_validator_set,
    snapshot::Snapshot,
    system_tx::FinalizeContext,
    validator::MinimalVal,
    PosaError, CHECKPOINT_INTERVAL, DIFF_IN_TURN, DIFF_NO_TURN, EPOCH_LENGTH, EXTRA_SEAL,
    EXTRA_VANITY, FALLBACK_DELAY, GAS_LIMIT_BOUND_DIVISOR, INMEMORY_SIGNATURES,
    INMEMORY_SNAPSHOTS, MAX_GAS_LIMIT, MIN_GAS_LIMIT, NONCE_AUTH_VOTE, NONCE_DROP_VOTE,
    SYSTEM_ADDRESS, WIGGLE_TIME,
};
use super::state::EvmState;
use alloy_consensus::{
    constants::EMPTY_OMMER_ROOT_HASH, Block, BlockBody, Header, Receipt, Signed, TxLegacy,
};
use alloy_eips::eip1559::{calc_next_block_base_fee, BaseFeeParams, INITIAL_BASE_FEE};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::Encodable;
use lru::LruCache;
use parking_lot::RwLock;
use rand::Rng;
use secp256k1::{ecdsa::RecoverableSignature, All, Message, Secp256k1};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Number of piled-up headers beyond which an epoch checkpoint is trusted
/// without replaying back to genesis.
const FULL_IMMUTABILITY_THRESHOLD: usize = 90000;

/// Block shape produced and sealed by the engine.
pub type PosaBlock = Block<Signed<TxLegacy>>;

/// Chain access the engine needs while verifying and producing blocks.
pub trait ChainHeaderReader: Send + Sync {
    /// Current canonical head header.
    fn current_header(&self) -> Option<Header>;

    /// Header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<Header>;

    /// Canonical header by number.
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    /// Header by hash.
    fn get_header_by_hash(&self, hash: B256) -> Option<Header>;
}

/// Signing identity and vote proposals, guarded by a single lock.
#[derive(Default)]
struct Identity {
    val: Address,
    sign_fn: Option<SignerFn>,
    sign_tx_fn: Option<SignerTxFn>,
    proposals: HashMap<Address, bool>,
}

/// The hybrid authority / staked-authority consensus engine.
pub struct Posa<DB> {
    /// Chain configuration (forks and engine parameters).
    config: ChainConfig,

    /// Store for persisted snapshot checkpoints.
    db: Arc<DB>,

    /// Snapshots for recent blocks to speed up reorgs.
    recents: RwLock<LruCache<B256, Snapshot>>,

    /// Recovered signers of recent blocks to speed up verification.
    signatures: RwLock<LruCache<B256, Address>>,

    /// Signing identity plus the proposals this node pushes.
    identity: RwLock<Identity>,

    /// Typed access to the validator, stake and slash contracts.
    contract: Arc<dyn ContractClient>,

    /// secp256k1 context for signature recovery.
    secp: Secp256k1<All>,

    /// Skip difficulty verification, test harnesses only.
    fake_diff: bool,
}

impl<DB: KeyValueStore> Posa<DB> {
    /// Create a new engine. Missing consensus parameters fall back to their
    /// defaults.
    pub fn new(mut config: ChainConfig, db: Arc<DB>, contract: Arc<dyn ContractClient>) -> Self {
        if config.posa.epoch == 0 {
            config.posa.epoch = EPOCH_LENGTH;
        }
        contract.set_signer(config.chain_id);

        Self {
            config,
            db,
            recents: RwLock::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SNAPSHOTS).expect("cache size is non-zero"),
            )),
            signatures: RwLock::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SIGNATURES).expect("cache size is non-zero"),
            )),
            identity: RwLock::new(Identity::default()),
            contract,
            secp: Secp256k1::new(),
            fake_diff: false,
        }
    }

    /// Create an engine that skips difficulty checks, for test harnesses
    /// exercising other rules in isolation.
    pub fn new_fake_diff(
        config: ChainConfig,
        db: Arc<DB>,
        contract: Arc<dyn ContractClient>,
    ) -> Self {
        let mut engine = Self::new(config, db, contract);
        engine.fake_diff = true;
        engine
    }

    /// The engine's chain configuration.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Inject the signing credentials used to seal blocks and sign system
    /// transactions.
    pub fn authorize(&self, val: Address, sign_fn: SignerFn, sign_tx_fn: SignerTxFn) {
        let mut identity = self.identity.write();
        identity.val = val;
        identity.sign_fn = Some(sign_fn);
        identity.sign_tx_fn = Some(sign_tx_fn.clone());
        drop(identity);

        self.contract.inject(val, sign_tx_fn);
    }

    /// The currently authorized sealing address.
    pub fn val(&self) -> Address {
        self.identity.read().val
    }

    /// Push a proposal to authorize or deauthorize an address.
    pub fn propose(&self, address: Address, authorize: bool) {
        self.identity.write().proposals.insert(address, authorize);
    }

    /// Drop a previously pushed proposal.
    pub fn discard(&self, address: Address) {
        self.identity.write().proposals.remove(&address);
    }

    /// The proposals this node is currently pushing.
    pub fn proposals(&self) -> HashMap<Address, bool> {
        self.identity.read().proposals.clone()
    }

    /// User-facing voting and snapshot inspection API.
    pub fn apis(self: Arc<Self>) -> PosaApi<DB> {
        PosaApi::new(self)
    }

    /// Address that sealed the given header.
    pub fn author(&self, header: &Header) -> Result<Address, PosaError> {
        self.ecrecover(header)
    }

    /// Hash of a header prior to sealing.
    pub fn seal_hash(&self, header: &Header) -> B256 {
        header::seal_hash(header)
    }

    /// Release engine resources. The engine keeps no background threads of
    /// its own, so this is a no-op.
    pub fn close(&self) -> Result<(), PosaError> {
        Ok(())
    }

    /// Recover the sealing address from a header's seal signature, caching by
    /// block hash.
    pub fn ecrecover(&self, header: &Header) -> Result<Address, PosaError> {
        let hash = header.hash_slow();
        if let Some(address) = self.signatures.write().get(&hash) {
            return Ok(*address);
        }

        let signature = header::seal_signature(header)?;
        let seal_hash = header::seal_hash(header);
        let address = self.recover_address(&seal_hash, signature)?;

        self.signatures.write().put(hash, address);
        Ok(address)
    }

    fn recover_address(&self, hash: &B256, signature: &[u8]) -> Result<Address, PosaError> {
        if signature.len() != EXTRA_SEAL {
            return Err(PosaError::MissingSignature);
        }

        // Accept both the 0/1 and 27/28 recovery id conventions.
        let v = signature[64];
        let recovery_id_value = if v >= 27 { v - 27 } else { v } as i32;
        let recovery_id =
            secp256k1::ecdsa::RecoveryId::from_i32(recovery_id_value).map_err(|err| {
                PosaError::SignatureRecoveryFailed {
                    message: format!("invalid recovery id {recovery_id_value}: {err}"),
                }
            })?;

        let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id).map_err(
            |err| PosaError::SignatureRecoveryFailed {
                message: err.to_string(),
            },
        )?;
        let message = Message::from_digest_slice(hash.as_slice()).map_err(|err| {
            PosaError::SignatureRecoveryFailed {
                message: err.to_string(),
            }
        })?;
        let pubkey = self.secp.recover_ecdsa(&message, &sig).map_err(|err| {
            PosaError::SignatureRecoveryFailed {
                message: err.to_string(),
            }
        })?;

        let pubkey_bytes = pubkey.serialize_uncompressed();
        let hash = keccak256(&pubkey_bytes[1..]);
        Ok(Address::from_slice(&hash[12..]))
    }

    /// Verify a single header against the consensus rules.
    pub fn verify_header<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &Header,
        _seal: bool,
    ) -> Result<(), PosaError> {
        self.verify_header_with_parents(chain, header, &[])
    }

    /// Verify a batch of headers concurrently with the caller. Returns an
    /// abort handle and a channel yielding one result per header, in input
    /// order.
    pub fn verify_headers<C>(
        self: Arc<Self>,
        chain: Arc<C>,
        headers: Vec<Header>,
    ) -> (oneshot::Sender<()>, mpsc::Receiver<Result<(), PosaError>>)
    where
        C: ChainHeaderReader + 'static,
        DB: 'static,
    {
        let (abort_tx, mut abort_rx) = oneshot::channel::<()>();
        let (results_tx, results_rx) = mpsc::channel(headers.len().max(1));
        let engine = self;

        tokio::spawn(async move {
            for index in 0..headers.len() {
                let result =
                    engine.verify_header_with_parents(chain.as_ref(), &headers[index], &headers[..index]);
                tokio::select! {
                    _ = &mut abort_rx => return,
                    sent = results_tx.send(result) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (abort_tx, results_rx)
    }

    /// Uncles are meaningless under authority sealing: reject any.
    pub fn verify_uncles(&self, block: &PosaBlock) -> Result<(), PosaError> {
        if !block.body.ommers.is_empty() {
            return Err(PosaError::UnclesNotAllowed);
        }
        Ok(())
    }

    /// Standalone header checks, then the cascading ones. `parents` is an
    /// optional ascending batch preceding the header, used when verifying
    /// header runs that are not yet part of the local chain.
    pub fn verify_header_with_parents<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &Header,
        parents: &[Header],
    ) -> Result<(), PosaError> {
        let number = header.number;

        // Don't waste time on blocks from the future.
        let now = unix_now();
        if header.timestamp > now {
            return Err(PosaError::FutureBlock {
                block_time: header.timestamp,
                current_time: now,
            });
        }

        // Checkpoints must not carry votes; vote location depends on Erawan.
        let checkpoint = self.config.is_checkpoint(number);
        if self.config.is_erawan(number) {
            if checkpoint && vote_address(&self.config, header) != Address::ZERO {
                return Err(PosaError::InvalidCheckpointBeneficiary);
            }
        } else {
            if checkpoint && header.beneficiary != Address::ZERO {
                return Err(PosaError::InvalidCheckpointBeneficiary);
            }
            if header.mix_hash != B256::ZERO {
                return Err(PosaError::InvalidMixDigest);
            }
        }

        // Nonces must be one of the two vote magics, zero on checkpoints.
        if header.nonce != NONCE_AUTH_VOTE && header.nonce != NONCE_DROP_VOTE {
            return Err(PosaError::InvalidVote);
        }
        if checkpoint && header.nonce != NONCE_DROP_VOTE {
            return Err(PosaError::InvalidCheckpointVote);
        }

        // Extra-data geometry: vanity, seal, and a payload only where the
        // mode calls for one.
        let extra_len = header.extra_data.len();
        if extra_len < EXTRA_VANITY {
            return Err(PosaError::MissingVanity);
        }
        if extra_len < EXTRA_VANITY + EXTRA_SEAL {
            return Err(PosaError::MissingSignature);
        }
        let payload_len = extra_len - EXTRA_VANITY - EXTRA_SEAL;
        if !checkpoint && payload_len != 0 {
            return Err(PosaError::ExtraSigners);
        }
        if checkpoint && payload_len % Address::len_bytes() != 0 {
            return Err(PosaError::InvalidCheckpointSigners);
        }

        if header.ommers_hash != EMPTY_OMMER_ROOT_HASH {
            return Err(PosaError::InvalidUncleHash);
        }

        // Difficulty lives in {1, 2}; once span rotation is active the
        // turn-ness rules are enforced against the snapshot instead.
        if number > 0
            && !self.config.is_chaophraya(number)
            && header.difficulty != DIFF_IN_TURN
            && header.difficulty != DIFF_NO_TURN
        {
            return Err(PosaError::InvalidDifficulty {
                difficulty: header.difficulty,
            });
        }

        if header.gas_limit > MAX_GAS_LIMIT {
            return Err(PosaError::GasLimitExceeded {
                gas_limit: header.gas_limit,
                max_gas_limit: MAX_GAS_LIMIT,
            });
        }

        self.verify_cascading_fields(chain, header, parents)
    }

    fn verify_cascading_fields<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &Header,
        parents: &[Header],
    ) -> Result<(), PosaError> {
        let number = header.number;
        if number == 0 {
            return Ok(());
        }

        let parent = if let Some(parent) = parents.last() {
            parent.clone()
        } else {
            chain
                .get_header(header.parent_hash, number - 1)
                .ok_or(PosaError::UnknownAncestor)?
        };
        if parent.number != number - 1 || parent.hash_slow() != header.parent_hash {
            return Err(PosaError::UnknownAncestor);
        }

        if parent.timestamp + self.config.posa.period > header.timestamp {
            return Err(PosaError::InvalidTimestamp {
                parent_time: parent.timestamp,
                period: self.config.posa.period,
                block_time: header.timestamp,
            });
        }
        if header.gas_used > header.gas_limit {
            return Err(PosaError::GasUsedExceeded {
                gas_used: header.gas_used,
                gas_limit: header.gas_limit,
            });
        }

        if !self.config.is_london(number) {
            if header.base_fee_per_gas.is_some() {
                return Err(PosaError::InvalidBaseFee {
                    have: header.base_fee_per_gas,
                    want: None,
                });
            }
            verify_gas_limit(parent.gas_limit, header.gas_limit)?;
        } else {
            self.verify_eip1559_header(&parent, header)?;
        }

        let snap = self.snapshot(chain, number - 1, header.parent_hash, Some(parents))?;

        // Epoch checkpoints must embed the snapshot's sorted signer list.
        if self.config.is_epoch_checkpoint(number) {
            let embedded = checkpoint_signers(header)?;
            if embedded != snap.signers_list() {
                return Err(PosaError::MismatchingCheckpointSigners);
            }
        }

        // Update blocks must embed exactly the payload the contracts report.
        if self.config.is_span_update(number) {
            let (embedded_validators, embedded_contracts) = span_payload(header)?;
            let (expected_validators, expected_contracts) = self
                .contract
                .get_current_validators(header.parent_hash, number + 1)?;
            if embedded_validators != expected_validators
                || embedded_contracts != expected_contracts
            {
                return Err(PosaError::MismatchingSpanValidators);
            }
        }

        if self.config.is_chaophraya(number) {
            self.verify_seal_posa(&snap, header)
        } else {
            self.verify_seal(&snap, header)
        }
    }

    fn verify_eip1559_header(&self, parent: &Header, header: &Header) -> Result<(), PosaError> {
        // The transition block inherits an elasticity-scaled target.
        let params = BaseFeeParams::ethereum();
        let parent_gas_limit = if !self.config.is_london(parent.number) {
            parent.gas_limit * params.elasticity_multiplier as u64
        } else {
            parent.gas_limit
        };
        verify_gas_limit(parent_gas_limit, header.gas_limit)?;

        let expected = if !self.config.is_london(parent.number) {
            INITIAL_BASE_FEE
        } else {
            calc_next_block_base_fee(
                parent.gas_used,
                parent.gas_limit,
                parent.base_fee_per_gas.unwrap_or(INITIAL_BASE_FEE),
                params,
            )
        };
        if header.base_fee_per_gas != Some(expected) {
            return Err(PosaError::InvalidBaseFee {
                have: header.base_fee_per_gas,
                want: Some(expected),
            });
        }
        Ok(())
    }

    fn verify_seal(&self, snap: &Snapshot, header: &Header) -> Result<(), PosaError> {
        let number = header.number;
        if number == 0 {
            return Err(PosaError::UnknownBlock);
        }

        let signer = self.ecrecover(header)?;
        if !snap.is_signer(&signer) {
            return Err(PosaError::UnauthorizedSigner { signer });
        }

        // A recent signer may only seal once the window shifts it out.
        let limit = snap.signer_limit();
        for (&seen, &recent) in &snap.recents {
            if recent == signer && seen > number.saturating_sub(limit) {
                return Err(PosaError::RecentlySigned {
                    signer,
                    recent_block: seen,
                });
            }
        }

        if !self.fake_diff {
            let inturn = snap.inturn(number, signer);
            if (inturn && header.difficulty != DIFF_IN_TURN)
                || (!inturn && header.difficulty != DIFF_NO_TURN)
            {
                return Err(PosaError::WrongDifficulty {
                    signer,
                    block: number,
                });
            }
        }
        Ok(())
    }

    fn verify_seal_posa(&self, snap: &Snapshot, header: &Header) -> Result<(), PosaError> {
        let number = header.number;
        if number == 0 {
            return Err(PosaError::UnknownBlock);
        }

        let signer = self.ecrecover(header)?;
        let official = snap.system_contracts.official_node;
        if !snap.is_signer(&signer) && signer != official {
            return Err(PosaError::UnauthorizedSigner { signer });
        }

        if !self.fake_diff {
            let inturn = snap.inturn(number, signer);
            if (inturn && header.difficulty != DIFF_IN_TURN)
                || (!inturn && header.difficulty != DIFF_NO_TURN)
            {
                return Err(PosaError::WrongDifficulty {
                    signer,
                    block: number,
                });
            }
            // Fallback blocks are the official node's privilege.
            if header.difficulty == DIFF_NO_TURN && signer != official {
                return Err(PosaError::InvalidDifficulty {
                    difficulty: header.difficulty,
                });
            }
        }
        Ok(())
    }

    /// Retrieve the authorization snapshot at the given block, deriving it
    /// from the nearest cached, persisted or genesis ancestor if necessary.
    pub fn snapshot<C: ChainHeaderReader>(
        &self,
        chain: &C,
        mut number: u64,
        mut hash: B256,
        parents: Option<&[Header]>,
    ) -> Result<Snapshot, PosaError> {
        let mut headers: Vec<Header> = Vec::new();
        let mut parents: Vec<Header> = parents.map(<[Header]>::to_vec).unwrap_or_default();
        let mut snap: Option<Snapshot> = None;

        while snap.is_none() {
            // In-memory snapshots win.
            if let Some(cached) = self.recents.write().get(&hash) {
                snap = Some(cached.clone());
                break;
            }

            // Then persisted checkpoints; a failed read degrades to a miss.
            if number % CHECKPOINT_INTERVAL == 0 {
                match load_snapshot(&self.config, self.db.as_ref(), hash) {
                    Ok(Some(stored)) => {
                        trace!(number, %hash, "loaded voting snapshot from disk");
                        snap = Some(stored);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(number, %hash, %err, "snapshot store read failed");
                    }
                }
            }

            // At genesis, or at an epoch checkpoint too deep to replay,
            // bootstrap the snapshot from the header's embedded signer list.
            let epoch = self.config.posa.epoch;
            if number == 0
                || (number % epoch == 0
                    && (headers.len() > FULL_IMMUTABILITY_THRESHOLD
                        || chain.get_header_by_number(number - 1).is_none()))
            {
                if let Some(checkpoint) = chain.get_header_by_number(number) {
                    let checkpoint_hash = checkpoint.hash_slow();
                    let signers = checkpoint_signers(&checkpoint)?;
                    let fresh =
                        Snapshot::new(self.config.clone(), number, checkpoint_hash, signers);
                    store_snapshot(&fresh, self.db.as_ref())?;
                    info!(number, hash = %checkpoint_hash, "stored checkpoint snapshot to disk");
                    snap = Some(fresh);
                    break;
                }
            }
            if number == 0 {
                return Err(PosaError::UnknownAncestor);
            }

            // No snapshot yet: remember this header and walk backward.
            let header = if let Some(candidate) = parents.pop() {
                if candidate.hash_slow() != hash || candidate.number != number {
                    return Err(PosaError::UnknownAncestor);
                }
                candidate
            } else {
                chain
                    .get_header(hash, number)
                    .ok_or(PosaError::UnknownAncestor)?
            };
            hash = header.parent_hash;
            number -= 1;
            headers.push(header);
        }

        let mut snap = snap.ok_or(PosaError::GetSnapshotFailed)?;

        // Replay the gathered headers, oldest first, on top of the snapshot.
        headers.reverse();
        let replayed = !headers.is_empty();
        if replayed {
            snap = snap.apply(&headers, |header| self.ecrecover(header))?;
        }
        self.recents.write().put(snap.hash, snap.clone());

        let activation = self.config.chaophraya_block == Some(snap.number);
        if replayed && (snap.number % CHECKPOINT_INTERVAL == 0 || activation) {
            store_snapshot(&snap, self.db.as_ref())?;
            trace!(number = snap.number, hash = %snap.hash, "stored voting snapshot to disk");
        }

        Ok(snap)
    }

    /// Populate the consensus fields of a candidate header.
    pub fn prepare<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &mut Header,
    ) -> Result<(), PosaError> {
        let number = header.number;
        let val = self.val();
        let posa = self.config.is_chaophraya(number);

        header.beneficiary = if posa { val } else { Address::ZERO };
        header.nonce = NONCE_DROP_VOTE;
        header.mix_hash = B256::ZERO;

        let snap = self.snapshot(chain, number - 1, header.parent_hash, None)?;

        // Cast a random vote out of the pending proposals that still make
        // sense; checkpoints carry none.
        if !self.config.is_checkpoint(number) {
            let candidates: Vec<(Address, bool)> = {
                let identity = self.identity.read();
                identity
                    .proposals
                    .iter()
                    .filter(|&(address, authorize)| snap.valid_vote(address, *authorize))
                    .map(|(address, authorize)| (*address, *authorize))
                    .collect()
            };
            if !candidates.is_empty() {
                let (address, authorize) =
                    candidates[rand::thread_rng().gen_range(0..candidates.len())];
                if self.config.is_erawan(number) {
                    header.mix_hash = vote_to_mix_digest(address);
                } else {
                    header.beneficiary = address;
                }
                header.nonce = if authorize {
                    NONCE_AUTH_VOTE
                } else {
                    NONCE_DROP_VOTE
                };
            }
        }

        header.difficulty = snap.calc_difficulty(number, val);

        // Assemble the extra-data: vanity, the mode's checkpoint payload, and
        // room for the seal.
        let mut extra = header.extra_data.to_vec();
        if extra.len() < EXTRA_VANITY {
            extra.resize(EXTRA_VANITY, 0);
        }
        extra.truncate(EXTRA_VANITY);

        if self.config.is_epoch_checkpoint(number) {
            for signer in snap.signers_list() {
                extra.extend_from_slice(signer.as_slice());
            }
        }
        if self.config.is_span_update(number) {
            let (validators, contracts) = self
                .contract
                .get_current_validators(header.parent_hash, number + 1)?;
            for validator in &validators {
                extra.extend_from_slice(&validator.header_bytes());
            }
            extra.extend_from_slice(&contracts.to_bytes());
        }
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
        header.extra_data = Bytes::from(extra);

        let parent = chain
            .get_header(header.parent_hash, number - 1)
            .ok_or(PosaError::UnknownAncestor)?;
        header.timestamp = (parent.timestamp + self.config.posa.period).max(unix_now());
        Ok(())
    }

    /// Finalize a received block: inject the mandated system transactions and
    /// match them against the block's received system-transaction stream.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &mut Header,
        state: &mut dyn EvmState,
        txs: &mut Vec<Signed<TxLegacy>>,
        receipts: &mut Vec<Receipt>,
        received: &mut Vec<Signed<TxLegacy>>,
        used_gas: &mut u64,
    ) -> Result<(), PosaError> {
        self.finalize_inner(
            chain,
            header,
            state,
            txs,
            receipts,
            Some(received),
            used_gas,
            false,
        )?;
        header.state_root = state.state_root();
        header.ommers_hash = EMPTY_OMMER_ROOT_HASH;
        Ok(())
    }

    /// Finalize a block being produced: inject and sign the mandated system
    /// transactions, then assemble the final block for sealing.
    pub fn finalize_and_assemble<C: ChainHeaderReader>(
        &self,
        chain: &C,
        mut header: Header,
        state: &mut dyn EvmState,
        mut txs: Vec<Signed<TxLegacy>>,
        mut receipts: Vec<Receipt>,
    ) -> Result<(PosaBlock, Vec<Receipt>), PosaError> {
        let mut used_gas = header.gas_used;
        self.finalize_inner(
            chain,
            &header,
            state,
            &mut txs,
            &mut receipts,
            None,
            &mut used_gas,
            true,
        )?;
        header.gas_used = used_gas;
        header.state_root = state.state_root();
        header.ommers_hash = EMPTY_OMMER_ROOT_HASH;

        let block = Block::new(
            header,
            BlockBody {
                transactions: txs,
                ommers: Vec::new(),
                withdrawals: None,
            },
        );
        Ok((block, receipts))
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize_inner<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &Header,
        state: &mut dyn EvmState,
        txs: &mut Vec<Signed<TxLegacy>>,
        receipts: &mut Vec<Receipt>,
        mut received: Option<&mut Vec<Signed<TxLegacy>>>,
        used_gas: &mut u64,
        mining: bool,
    ) -> Result<(), PosaError> {
        let number = header.number;
        if !self.config.is_chaophraya(number) {
            return Ok(());
        }
        let snap = self.snapshot(chain, number - 1, header.parent_hash, None)?;
        let val = self.val();

        // Mid-span: record the next span's producer list into the contract.
        if self.config.is_span_commitment(number) {
            let validator_bytes = self.select_span_payload(chain, header)?;
            let mut ctx = FinalizeContext {
                state,
                header,
                txs,
                receipts,
                received: received.as_deref_mut(),
                used_gas,
                mining,
            };
            self.contract.commit_span(val, validator_bytes, &mut ctx)?;
        }

        // A fallback block marks the producer it stood in for as slashed.
        if header.difficulty == DIFF_NO_TURN {
            if header.beneficiary != snap.system_contracts.official_node {
                return Err(PosaError::InvalidDifficulty {
                    difficulty: header.difficulty,
                });
            }
            let spoiled = snap.in_turn_signer(number);
            let span_id = self.current_span(header)?;
            let slashed = self.contract.is_slashed(
                snap.system_contracts.slash_manager,
                spoiled,
                span_id,
                header,
            )?;
            if !slashed {
                let mut ctx = FinalizeContext {
                    state,
                    header,
                    txs,
                    receipts,
                    received: received.as_deref_mut(),
                    used_gas,
                    mining,
                };
                self.contract.slash(
                    snap.system_contracts.slash_manager,
                    spoiled,
                    span_id,
                    &mut ctx,
                )?;
            }
        }

        // Forward everything the system-reward account accumulated.
        let balance = state.balance(SYSTEM_ADDRESS);
        if !balance.is_zero() {
            state.set_balance(SYSTEM_ADDRESS, U256::ZERO);
            state.add_balance(header.beneficiary, balance);
            info!(block = number, amount = %balance, "distributing incoming rewards");

            let validator = if mining { val } else { header.beneficiary };
            let mut ctx = FinalizeContext {
                state,
                header,
                txs,
                receipts,
                received,
                used_gas,
                mining,
            };
            self.contract.distribute_to_validator(
                snap.system_contracts.stake_manager,
                balance,
                validator,
                &mut ctx,
            )?;
        }

        Ok(())
    }

    /// Sample the next span's producers and RLP-encode them for `commitSpan`.
    fn select_span_payload<C: ChainHeaderReader>(
        &self,
        chain: &C,
        header: &Header,
    ) -> Result<Bytes, PosaError> {
        let parent = chain
            .get_header(header.parent_hash, header.number - 1)
            .ok_or(PosaError::UnknownAncestor)?;
        let seed_number = parent.number.checked_sub(5).ok_or(PosaError::InvalidSpan)?;
        let seed_header = chain
            .get_header_by_number(seed_number)
            .ok_or(PosaError::InvalidSpan)?;
        debug!(seed = %seed_header.hash_slow(), "selecting validator set for the next span");

        let eligible = self
            .contract
            .get_eligible_validators(header.parent_hash, parent.number)?;
        let producers =
            select_next_validator_set(&seed_header, &eligible, self.config.posa.span)?;

        let minimal: Vec<MinimalVal> = producers.iter().map(|producer| producer.minimal()).collect();
        let mut encoded = Vec::new();
        minimal.encode(&mut encoded);
        Ok(Bytes::from(encoded))
    }

    /// Span number governing the given header, disambiguated on span-first
    /// blocks where contract reads still see the previous span.
    fn current_span(&self, header: &Header) -> Result<U256, PosaError> {
        let span_number = self.contract.get_current_span(header)?;
        let span = self.config.posa.span;
        if span > 0 && header.number % span == 0 {
            Ok(span_number + U256::from(1u64))
        } else {
            Ok(span_number)
        }
    }

    /// Difficulty a new block on top of `parent` should declare for the local
    /// signer.
    pub fn calc_difficulty<C: ChainHeaderReader>(
        &self,
        chain: &C,
        _time: u64,
        parent: &Header,
    ) -> Result<U256, PosaError> {
        let snap = self.snapshot(chain, parent.number, parent.hash_slow(), None)?;
        Ok(snap.calc_difficulty(snap.number + 1, self.val()))
    }

    /// Seal a prepared block: sign it immediately, then emit it on `results`
    /// after the turn-dependent delay, unless `stop` fires first (or its
    /// sender is dropped).
    pub fn seal<C: ChainHeaderReader>(
        &self,
        chain: &C,
        block: PosaBlock,
        results: mpsc::Sender<PosaBlock>,
        stop: oneshot::Receiver<()>,
    ) -> Result<(), PosaError> {
        let mut header = block.header.clone();
        let number = header.number;
        if number == 0 {
            return Err(PosaError::UnknownBlock);
        }
        // For 0-period chains, refuse to seal empty blocks: no reward, but it
        // would spin sealing.
        if self.config.posa.period == 0 && block.body.transactions.is_empty() {
            return Err(PosaError::WaitingForTransactions);
        }

        let (val, sign_fn) = {
            let identity = self.identity.read();
            (identity.val, identity.sign_fn.clone())
        };
        let sign_fn = sign_fn.ok_or_else(|| PosaError::SigningFailed {
            message: "sealing key not authorized".to_string(),
        })?;

        let snap = self.snapshot(chain, number - 1, header.parent_hash, None)?;
        let posa = self.config.is_chaophraya(number);
        if !snap.is_authorized(&val, number) {
            return Err(PosaError::UnauthorizedSigner { signer: val });
        }

        // Among the recent signers: wait for the window to shift us out.
        if !posa {
            let limit = snap.signer_limit();
            for (&seen, &recent) in &snap.recents {
                if recent == val && (number < limit || seen > number - limit) {
                    return Err(PosaError::RecentlySigned {
                        signer: val,
                        recent_block: seen,
                    });
                }
            }
        }

        // Sign up front: cancellation aborts the wait, never the signing.
        let signature = sign_fn(val, &seal_message(&header))?;
        let mut extra = header.extra_data.to_vec();
        if extra.len() < EXTRA_SEAL {
            return Err(PosaError::MissingSignature);
        }
        let seal_at = extra.len() - EXTRA_SEAL;
        extra[seal_at..].copy_from_slice(&signature);
        header.extra_data = Bytes::from(extra);

        let mut delay = Duration::from_secs(header.timestamp.saturating_sub(unix_now()));

        if !posa {
            if header.difficulty == DIFF_NO_TURN {
                // Not our turn explicitly: delay a bit to favour the in-turn
                // signer.
                let wiggle = WIGGLE_TIME * (snap.signers.len() as u32 / 2 + 1);
                delay += random_wiggle(wiggle);
                trace!(?wiggle, "out-of-turn signing requested");
            }
        } else {
            let official = snap.system_contracts.official_node;
            let spoiled = snap.in_turn_signer(number);
            let span_id = self.current_span(&header)?;
            let slashed = self.contract.is_slashed(
                snap.system_contracts.slash_manager,
                spoiled,
                span_id,
                &header,
            )?;

            if header.difficulty == DIFF_NO_TURN || slashed {
                // Fallback production is the official node's privilege:
                // everyone else parks here until the caller aborts.
                if val != official {
                    debug!(block = number, "fallback slot reserved for the official node");
                    tokio::spawn(async move {
                        let _ = stop.await;
                    });
                    return Ok(());
                }
                delay += random_wiggle(WIGGLE_TIME);
                if !slashed {
                    delay += FALLBACK_DELAY;
                }
            }
        }

        let sealed = Block::new(header, block.body);
        let seal_hash = header::seal_hash(&sealed.header);
        trace!(?delay, "waiting for slot to sign and propagate");

        tokio::spawn(async move {
            tokio::select! {
                _ = stop => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if results.try_send(sealed).is_err() {
                warn!(%seal_hash, "sealing result is not read by miner");
            }
        });
        Ok(())
    }
}

/// Gas limit may drift at most 1/1024 per block and never below the floor.
fn verify_gas_limit(parent_gas_limit: u64, gas_limit: u64) -> Result<(), PosaError> {
    let diff = parent_gas_limit.abs_diff(gas_limit);
    let limit = parent_gas_limit / GAS_LIMIT_BOUND_DIVISOR;
    if diff >= limit || gas_limit < MIN_GAS_LIMIT {
        return Err(PosaError::InvalidGasLimit {
            gas_limit,
            parent_gas_limit,
        });
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn random_wiggle(max: Duration) -> Duration {
    let millis = max.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::posa::tests::NoopContractClient;
    use crate::consensus::posa::{MemoryKeyValueStore, PosaConfig};

    fn test_engine() -> Posa<MemoryKeyValueStore> {
        let config = ChainConfig {
            chain_id: 96,
            posa: PosaConfig {
                period: 15,
                epoch: 30000,
                span: 50,
                ..Default::default()
            },
            ..Default::default()
        };
        Posa::new(
            config,
            MemoryKeyValueStore::new_arc(),
            Arc::new(NoopContractClient::default()),
        )
    }

    #[test]
    fn engine_defaults_epoch_when_unset() {
        let engine = Posa::new(
            ChainConfig::default(),
            MemoryKeyValueStore::new_arc(),
            Arc::new(NoopContractClient::default()),
        );
        assert_eq!(engine.config().posa.epoch, EPOCH_LENGTH);
    }

    #[test]
    fn proposals_are_tracked_until_discarded() {
        let engine = test_engine();
        let address = Address::repeat_byte(0x01);

        engine.propose(address, true);
        assert_eq!(engine.proposals().get(&address), Some(&true));

        engine.discard(address);
        assert!(engine.proposals().is_empty());
    }

    #[test]
    fn gas_limit_drift_bounds() {
        assert!(verify_gas_limit(30_000_000, 30_000_000).is_ok());
        assert!(verify_gas_limit(30_000_000, 30_000_000 + 29_295).is_ok());
        assert!(verify_gas_limit(30_000_000, 30_000_000 + 29_297).is_err());
        assert!(verify_gas_limit(30_000_000, 4_000).is_err());
    }
}
