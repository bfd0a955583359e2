//! Chain and engine configuration.

use super::EPOCH_LENGTH;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// Engine parameters embedded in the chain configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosaConfig {
    /// Minimum number of seconds between blocks.
    pub period: u64,
    /// Epoch length to reset votes and checkpoint the signer list.
    pub epoch: u64,
    /// Number of blocks in a staked-authority span.
    pub span: u64,
    /// Address of the validator-set contract.
    pub validator_contract: Address,
    /// Address of the second-generation validator-set contract, used once the
    /// corresponding fork activates.
    pub validator_contract_v2: Address,
}

impl Default for PosaConfig {
    fn default() -> Self {
        Self {
            period: 15,
            epoch: EPOCH_LENGTH,
            span: 50,
            validator_contract: Address::ZERO,
            validator_contract_v2: Address::ZERO,
        }
    }
}

/// Chain configuration recognized by the engine: EIP-155 chain id, fork
/// activation heights and the engine parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// EIP-155 signing chain id.
    pub chain_id: u64,
    /// London (EIP-1559) activation height.
    pub london_block: Option<u64>,
    /// Height at which votes move from the coinbase into the mix digest.
    pub erawan_block: Option<u64>,
    /// Height at which staked-authority span rotation activates.
    pub chaophraya_block: Option<u64>,
    /// Height at which the v2 validator contract takes over.
    pub chaophraya_v2_block: Option<u64>,
    /// Engine parameters.
    pub posa: PosaConfig,
}

impl ChainConfig {
    fn is_forked(fork: Option<u64>, number: u64) -> bool {
        fork.is_some_and(|activation| activation <= number)
    }

    /// Whether London rules are active at the given height.
    pub fn is_london(&self, number: u64) -> bool {
        Self::is_forked(self.london_block, number)
    }

    /// Whether the Erawan vote-in-mix-digest rule is active at the given height.
    pub fn is_erawan(&self, number: u64) -> bool {
        Self::is_forked(self.erawan_block, number)
    }

    /// Whether staked-authority rules are active at the given height.
    pub fn is_chaophraya(&self, number: u64) -> bool {
        Self::is_forked(self.chaophraya_block, number)
    }

    /// Whether the v2 validator contract is active at the given height.
    pub fn is_chaophraya_v2(&self, number: u64) -> bool {
        Self::is_forked(self.chaophraya_v2_block, number)
    }

    /// Validator-set contract to consult for the given height.
    pub fn validator_contract(&self, number: u64) -> Address {
        if self.is_chaophraya_v2(number) {
            self.posa.validator_contract_v2
        } else {
            self.posa.validator_contract
        }
    }

    /// Whether the given height is an authority-mode epoch checkpoint, i.e. a
    /// block embedding the sorted signer list. Epoch blocks stop being
    /// checkpoints once span rotation takes over.
    pub fn is_epoch_checkpoint(&self, number: u64) -> bool {
        self.posa.epoch > 0 && number % self.posa.epoch == 0 && !self.is_chaophraya(number)
    }

    /// Whether the given height is a validator-list update block: the block
    /// immediately preceding a span-first block, which embeds the next span's
    /// validator payload.
    pub fn is_span_update(&self, number: u64) -> bool {
        self.posa.span > 0
            && (number + 1) % self.posa.span == 0
            && self.is_chaophraya(number + 1)
    }

    /// Whether the given height is a span-commitment block, where the engine
    /// emits the `commitSpan` system transaction.
    pub fn is_span_commitment(&self, number: u64) -> bool {
        self.posa.span > 0
            && self.is_chaophraya(number)
            && number % self.posa.span == self.posa.span / 2 + 1
    }

    /// Whether the given height carries the authoritative checkpoint payload
    /// of its mode (signer list or span validator payload).
    pub fn is_checkpoint(&self, number: u64) -> bool {
        self.is_epoch_checkpoint(number) || self.is_span_update(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chaophraya: Option<u64>) -> ChainConfig {
        ChainConfig {
            chain_id: 96,
            chaophraya_block: chaophraya,
            posa: PosaConfig {
                period: 1,
                epoch: 300,
                span: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn epoch_checkpoints_stop_at_chaophraya() {
        let cfg = config(Some(600));
        assert!(cfg.is_epoch_checkpoint(300));
        assert!(!cfg.is_epoch_checkpoint(600));
        assert!(!cfg.is_epoch_checkpoint(900));
    }

    #[test]
    fn span_update_covers_activation_boundary() {
        let cfg = config(Some(50));
        // Block 49 precedes the first staked-authority block and must embed
        // the validator payload even though 49 itself is still authority-mode.
        assert!(cfg.is_span_update(49));
        assert!(cfg.is_span_update(99));
        assert!(!cfg.is_span_update(50));
        assert!(!cfg.is_span_update(48));
    }

    #[test]
    fn span_commitment_is_mid_span() {
        let cfg = config(Some(50));
        assert!(cfg.is_span_commitment(76)); // 76 % 50 == 26 == 50/2 + 1
        assert!(!cfg.is_span_commitment(75));
        assert!(!cfg.is_span_commitment(26)); // before activation
    }

    #[test]
    fn validator_contract_switches_on_v2_fork() {
        let mut cfg = config(Some(50));
        cfg.posa.validator_contract = Address::repeat_byte(0x11);
        cfg.posa.validator_contract_v2 = Address::repeat_byte(0x22);
        cfg.chaophraya_v2_block = Some(1000);

        assert_eq!(cfg.validator_contract(999), Address::repeat_byte(0x11));
        assert_eq!(cfg.validator_contract(1000), Address::repeat_byte(0x22));
    }
}
