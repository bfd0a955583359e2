//! Authorization snapshot: the voting state of the chain at a given block.

use super::{
    config::ChainConfig,
    header::{span_payload, vote_address},
    validator::SystemContracts,
    PosaError, Validator, DIFF_IN_TURN, DIFF_NO_TURN, NONCE_AUTH_VOTE, NONCE_DROP_VOTE,
};
use alloy_consensus::Header;
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single vote an authorized signer cast to modify the list of authorizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Authorized signer that cast this vote.
    pub signer: Address,
    /// Block number the vote was cast in.
    pub block: u64,
    /// Account being voted on to change its authorization.
    pub address: Address,
    /// Whether to authorize or deauthorize the voted account.
    pub authorize: bool,
}

/// Vote tally to avoid recounting the open vote list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tally {
    /// Whether the proposal is about authorizing or kicking someone.
    pub authorize: bool,
    /// Number of open votes backing the proposal.
    pub votes: usize,
}

/// Snapshot is the authorization state at a given block: the signer set, the
/// recent-signer exclusion window, open votes, and (once span rotation is
/// active) the committed validator set and its system contracts.
///
/// Snapshots are value-semantic: [`Snapshot::apply`] clones the receiver
/// before folding headers, so cached copies are never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Chain configuration, carried for fork and interval rules.
    #[serde(skip)]
    pub config: ChainConfig,

    /// Block number this snapshot describes.
    pub number: u64,

    /// Block hash this snapshot describes.
    pub hash: B256,

    /// Set of authorized signers at this moment.
    pub signers: BTreeSet<Address>,

    /// Recent signers for spam protection (block number -> signer).
    pub recents: BTreeMap<u64, Address>,

    /// Open votes, in chronological order.
    pub votes: Vec<Vote>,

    /// Current vote tally per target.
    pub tally: BTreeMap<Address, Tally>,

    /// Committed producer list for the current span, in sampled order.
    #[serde(default)]
    pub validators: Vec<Validator>,

    /// System-contract addresses active for the current span.
    #[serde(default)]
    pub system_contracts: SystemContracts,
}

impl Snapshot {
    /// Create a fresh snapshot with the given startup signers.
    ///
    /// Does not initialize the recent-signer window, so only use it for the
    /// genesis block or a trusted checkpoint.
    pub fn new(config: ChainConfig, number: u64, hash: B256, signers: Vec<Address>) -> Self {
        Self {
            config,
            number,
            hash,
            signers: signers.into_iter().collect(),
            recents: BTreeMap::new(),
            votes: Vec::new(),
            tally: BTreeMap::new(),
            validators: Vec::new(),
            system_contracts: SystemContracts::default(),
        }
    }

    /// Authorized signers in ascending order.
    pub fn signers_list(&self) -> Vec<Address> {
        self.signers.iter().copied().collect()
    }

    /// Whether an address may seal under plain authority rules.
    pub fn is_signer(&self, address: &Address) -> bool {
        self.signers.contains(address)
    }

    /// Whether an address may seal at the given height, including the
    /// official fallback node once span rotation is active.
    pub fn is_authorized(&self, address: &Address, number: u64) -> bool {
        self.signers.contains(address)
            || (self.config.is_chaophraya(number) && *address == self.system_contracts.official_node)
    }

    /// Number of blocks a signer must wait between two of its own seals.
    pub fn signer_limit(&self) -> u64 {
        self.signers.len() as u64 / 2 + 1
    }

    /// The signer scheduled to seal the given height.
    pub fn in_turn_signer(&self, number: u64) -> Address {
        let signers = self.signers_list();
        signers[(number % signers.len() as u64) as usize]
    }

    /// Whether a signer is in-turn at the given height.
    pub fn inturn(&self, number: u64, signer: Address) -> bool {
        let signers = self.signers_list();
        if signers.is_empty() {
            return false;
        }
        let offset = signers.iter().position(|s| *s == signer).unwrap_or(0);
        number % signers.len() as u64 == offset as u64
    }

    /// Difficulty a signer should declare at the given height.
    pub fn calc_difficulty(&self, number: u64, signer: Address) -> U256 {
        if self.inturn(number, signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        }
    }

    /// Whether casting the given vote makes sense: authorizing a non-signer
    /// or deauthorizing a current signer.
    pub fn valid_vote(&self, address: &Address, authorize: bool) -> bool {
        let is_signer = self.signers.contains(address);
        (is_signer && !authorize) || (!is_signer && authorize)
    }

    /// Add a vote into the tally. Returns whether it was counted.
    fn cast(&mut self, address: Address, authorize: bool) -> bool {
        if !self.valid_vote(&address, authorize) {
            return false;
        }
        let tally = self.tally.entry(address).or_insert(Tally {
            authorize,
            votes: 0,
        });
        tally.votes += 1;
        true
    }

    /// Remove a previously counted vote from the tally. Returns whether it
    /// was removed.
    fn uncast(&mut self, address: Address, authorize: bool) -> bool {
        let Some(tally) = self.tally.get_mut(&address) else {
            return false;
        };
        if tally.authorize != authorize {
            return false;
        }
        if tally.votes > 1 {
            tally.votes -= 1;
        } else {
            self.tally.remove(&address);
        }
        true
    }

    /// Fold a contiguous run of headers on top of this snapshot, producing
    /// the snapshot at the last header. The receiver is never mutated.
    ///
    /// `recover_signer` extracts the sealing address from a header; the
    /// engine passes its cached ecrecover.
    pub fn apply<F>(&self, headers: &[Header], recover_signer: F) -> Result<Snapshot, PosaError>
    where
        F: Fn(&Header) -> Result<Address, PosaError>,
    {
        if headers.is_empty() {
            return Ok(self.clone());
        }

        // Sanity check the headers are contiguous and start where we left off.
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(PosaError::InvalidVotingChain);
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(PosaError::InvalidVotingChain);
        }

        let mut snap = self.clone();
        for header in headers {
            snap.apply_header(header, &recover_signer)?;
        }
        snap.number += headers.len() as u64;
        snap.hash = headers
            .last()
            .map(|header| header.hash_slow())
            .unwrap_or(snap.hash);

        Ok(snap)
    }

    fn apply_header<F>(&mut self, header: &Header, recover_signer: &F) -> Result<(), PosaError>
    where
        F: Fn(&Header) -> Result<Address, PosaError>,
    {
        let number = header.number;
        let epoch = self.config.posa.epoch;
        let checkpoint = epoch > 0 && number % epoch == 0;

        // Votes reset at every epoch boundary.
        if checkpoint {
            self.votes.clear();
            self.tally.clear();
        }

        // Slide the recent-signer window forward.
        let limit = self.signer_limit();
        if number >= limit {
            self.recents.remove(&(number - limit));
        }

        // Resolve the sealing key and check it against the authorized set.
        let signer = recover_signer(header)?;
        if !self.is_authorized(&signer, number) {
            return Err(PosaError::UnauthorizedSigner { signer });
        }
        if let Some((&recent_block, _)) = self.recents.iter().find(|(_, s)| **s == signer) {
            return Err(PosaError::RecentlySigned {
                signer,
                recent_block,
            });
        }
        self.recents.insert(number, signer);

        // Tally the header's vote, unless this is a checkpoint (no votes) or
        // the header casts none.
        if !checkpoint {
            self.apply_vote(header, signer)?;
        }

        // A validator-list update block installs the next span's committee.
        if self.config.is_span_update(number) {
            let (validators, contracts) = span_payload(header)?;
            self.install_span(number, validators, contracts);
        }

        Ok(())
    }

    fn apply_vote(&mut self, header: &Header, signer: Address) -> Result<(), PosaError> {
        let number = header.number;
        let voted = vote_address(&self.config, header);
        if voted == Address::ZERO {
            return Ok(());
        }

        let authorize = if header.nonce == NONCE_AUTH_VOTE {
            true
        } else if header.nonce == NONCE_DROP_VOTE {
            false
        } else {
            return Err(PosaError::InvalidVote);
        };

        // A signer holds at most one open vote per target: discard any
        // previous one before counting the new vote.
        if let Some(pos) = self
            .votes
            .iter()
            .position(|vote| vote.signer == signer && vote.address == voted)
        {
            let previous = self.votes.remove(pos);
            self.uncast(previous.address, previous.authorize);
        }

        if self.cast(voted, authorize) {
            self.votes.push(Vote {
                signer,
                block: number,
                address: voted,
                authorize,
            });
        }

        // Apply the transition once a strict majority backs it.
        if let Some(tally) = self.tally.get(&voted).copied() {
            if tally.votes > self.signers.len() / 2 {
                if tally.authorize {
                    self.signers.insert(voted);
                } else {
                    self.signers.remove(&voted);

                    // The window shrank with the signer set.
                    let limit = self.signer_limit();
                    if number >= limit {
                        self.recents.remove(&(number - limit));
                    }

                    // Discard every open vote the deauthorized signer cast.
                    let dropped: Vec<(Address, bool)> = self
                        .votes
                        .iter()
                        .filter(|vote| vote.signer == voted)
                        .map(|vote| (vote.address, vote.authorize))
                        .collect();
                    for (address, authorize) in dropped {
                        self.uncast(address, authorize);
                    }
                    self.votes.retain(|vote| vote.signer != voted);
                }

                // Discard open votes around the just-changed account.
                self.votes.retain(|vote| vote.address != voted);
                self.tally.remove(&voted);
            }
        }

        Ok(())
    }

    fn install_span(
        &mut self,
        number: u64,
        validators: Vec<Validator>,
        contracts: SystemContracts,
    ) {
        self.signers = validators
            .iter()
            .map(|validator| validator.address)
            .collect();
        self.validators = validators;
        self.system_contracts = contracts;

        // Drop recents that fell outside the window of the new, possibly
        // smaller signer set.
        let limit = self.signer_limit();
        self.recents.retain(|&block, _| block + limit > number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::posa::PosaConfig;

    fn test_config() -> ChainConfig {
        ChainConfig {
            chain_id: 96,
            posa: PosaConfig {
                period: 1,
                epoch: 30000,
                span: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn inturn_rotates_over_sorted_signers() {
        let signers = vec![
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
        ];
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, signers.clone());

        assert!(snap.inturn(0, signers[0]));
        assert!(!snap.inturn(0, signers[1]));
        assert!(snap.inturn(1, signers[1]));
        assert!(snap.inturn(2, signers[2]));
        assert!(snap.inturn(3, signers[0]));
        assert_eq!(snap.in_turn_signer(2), signers[2]);
    }

    #[test]
    fn difficulty_follows_turn() {
        let signers = vec![Address::repeat_byte(0x01), Address::repeat_byte(0x02)];
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, signers.clone());

        assert_eq!(snap.calc_difficulty(0, signers[0]), DIFF_IN_TURN);
        assert_eq!(snap.calc_difficulty(0, signers[1]), DIFF_NO_TURN);
        assert_eq!(snap.calc_difficulty(1, signers[1]), DIFF_IN_TURN);
    }

    #[test]
    fn cast_and_uncast_keep_tally_consistent() {
        let signers = vec![
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
        ];
        let mut snap = Snapshot::new(test_config(), 0, B256::ZERO, signers);
        let candidate = Address::repeat_byte(0x04);

        assert!(snap.valid_vote(&candidate, true));
        assert!(snap.cast(candidate, true));
        assert!(snap.cast(candidate, true));
        assert_eq!(snap.tally.get(&candidate).unwrap().votes, 2);

        assert!(snap.uncast(candidate, true));
        assert_eq!(snap.tally.get(&candidate).unwrap().votes, 1);

        // Dropping a non-signer makes no sense.
        assert!(!snap.valid_vote(&candidate, false));
        assert!(!snap.uncast(candidate, false));
    }

    #[test]
    fn official_node_is_authorized_after_activation() {
        let mut config = test_config();
        config.chaophraya_block = Some(100);
        let official = Address::repeat_byte(0xaa);

        let mut snap = Snapshot::new(config, 0, B256::ZERO, vec![Address::repeat_byte(0x01)]);
        snap.system_contracts.official_node = official;

        assert!(!snap.is_authorized(&official, 99));
        assert!(snap.is_authorized(&official, 100));
    }

    #[test]
    fn json_round_trip_is_lossless_and_deterministic() {
        let mut snap = Snapshot::new(
            test_config(),
            1024,
            B256::repeat_byte(0x7f),
            vec![Address::repeat_byte(0x01), Address::repeat_byte(0x02)],
        );
        snap.recents.insert(1023, Address::repeat_byte(0x01));
        snap.votes.push(Vote {
            signer: Address::repeat_byte(0x01),
            block: 1000,
            address: Address::repeat_byte(0x05),
            authorize: true,
        });
        snap.tally.insert(
            Address::repeat_byte(0x05),
            Tally {
                authorize: true,
                votes: 1,
            },
        );
        snap.validators = vec![Validator::new(Address::repeat_byte(0x02), 10)];
        snap.system_contracts.official_node = Address::repeat_byte(0xaa);

        let encoded = serde_json::to_vec(&snap).unwrap();
        let mut decoded: Snapshot = serde_json::from_slice(&encoded).unwrap();
        decoded.config = snap.config.clone();
        assert_eq!(decoded, snap);

        // Re-encoding yields identical bytes: collections are ordered.
        assert_eq!(serde_json::to_vec(&decoded).unwrap(), encoded);
    }
}
