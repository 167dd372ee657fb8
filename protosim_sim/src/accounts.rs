//! Deterministic account provider for simulation.

use protosim_env::AccountAddress;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Provides deterministic account addresses derived from seeds.
///
/// In simulation, we need reproducible addresses for each actor account.
/// This provider generates addresses that are:
/// - Deterministic: Same seed always produces same addresses
/// - Unique: Each account index gets a different address
/// - Isolated: Changing the roster size doesn't affect other accounts
pub struct DeterministicAccountProvider {
    /// Master seed
    master_seed: u64,

    /// Cache of generated addresses by account index
    cache: HashMap<u64, AccountAddress>,
}

impl DeterministicAccountProvider {
    /// Creates a new account provider with the given master seed.
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            cache: HashMap::new(),
        }
    }

    /// Generates or retrieves the address for an account index.
    ///
    /// The address is derived deterministically from:
    /// `master_seed * golden + index * prime`
    pub fn account(&mut self, index: u64) -> AccountAddress {
        if let Some(address) = self.cache.get(&index) {
            return address.clone();
        }

        let account_seed = self
            .master_seed
            .wrapping_mul(0x9e3779b97f4a7c15) // Golden ratio prime
            .wrapping_add(index.wrapping_mul(0x517cc1b727220a95));

        let mut rng = ChaCha8Rng::seed_from_u64(account_seed);
        let mut bytes = [0u8; 20];
        rng.fill_bytes(&mut bytes);
        let address = AccountAddress::from_bytes(bytes);

        self.cache.insert(index, address.clone());
        address
    }

    /// Generates a batch of consecutive accounts starting at `first`.
    pub fn accounts(&mut self, first: u64, count: usize) -> Vec<AccountAddress> {
        (first..first + count as u64).map(|i| self.account(i)).collect()
    }
}
