use std::collections::BTreeMap;
use std::sync::Arc;

use curve25519_dalek::Scalar;
use tracing::debug;

use super::GarbledTable;
use crate::party::error::{MpcError, MpcResult};
use crate::share::keys::{inverse, KeyPair};

pub type Epoch = u64;

/// Number of installed epochs kept alive after a successful recompute.
pub const RETAINED_EPOCHS: Epoch = 3;

#[derive(Clone, Copy, Debug)]
pub struct EpochKeys {
    pub key: KeyPair,
    pub inv_next_hop: Scalar,
}

/// Epoch-indexed key material and garbled tables of one party.
///
/// Written only by preprocessing. Queries only see epochs up to `current`, which moves
/// forward once an installation is confirmed everywhere.
#[derive(Debug, Default)]
pub struct EpochStore {
    current: Option<Epoch>,
    latest: Epoch,
    keys: BTreeMap<Epoch, EpochKeys>,
    tables: BTreeMap<Epoch, Arc<GarbledTable>>,
}

impl EpochStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Epoch> {
        self.current
    }

    /// Allocates a fresh epoch number, never reusing a failed one.
    pub fn next_epoch(&mut self) -> Epoch {
        let epoch = Epoch::max(self.current.unwrap_or(0), self.latest) + 1;
        self.latest = epoch;
        epoch
    }

    /// Records that preprocessing for `epoch` started.
    pub fn observe(&mut self, epoch: Epoch) {
        self.latest = Epoch::max(self.latest, epoch);
    }

    pub fn insert_keys(&mut self, epoch: Epoch, key: KeyPair) -> MpcResult<EpochKeys> {
        let keys = EpochKeys { key, inv_next_hop: inverse(&key.next_hop)? };
        self.keys.insert(epoch, keys);
        Ok(keys)
    }

    /// Keys of `epoch`, installed or not.
    pub fn keys(&self, epoch: Epoch) -> MpcResult<EpochKeys> {
        self.keys.get(&epoch).copied().ok_or(MpcError::EpochNotFound(epoch))
    }

    pub fn install(&mut self, epoch: Epoch, table: GarbledTable) {
        self.tables.insert(epoch, Arc::new(table));
    }

    /// The epoch a query runs against: the requested one, or the current one.
    ///
    /// Epochs newer than `current` are invisible even if their keys already exist.
    pub fn resolve(&self, requested: Option<Epoch>) -> MpcResult<Epoch> {
        let current = self.current.ok_or(MpcError::EpochNotFound(requested.unwrap_or(0)))?;
        let epoch = requested.unwrap_or(current);
        if epoch > current || !self.keys.contains_key(&epoch) {
            return Err(MpcError::EpochNotFound(epoch));
        }
        Ok(epoch)
    }

    pub fn table(&self, epoch: Epoch) -> MpcResult<Arc<GarbledTable>> {
        self.tables.get(&epoch).cloned().ok_or(MpcError::EpochNotFound(epoch))
    }

    /// Applies the network-wide outcome of preprocessing `epoch`.
    pub fn finish(&mut self, epoch: Epoch, success: bool) {
        self.observe(epoch);
        if success {
            if self.current.map_or(true, |c| epoch > c) {
                self.current = Some(epoch);
            }
            if epoch >= RETAINED_EPOCHS {
                let oldest_kept = epoch - RETAINED_EPOCHS + 1;
                self.keys.retain(|e, _| *e >= oldest_kept);
                self.tables.retain(|e, _| *e >= oldest_kept);
            }
            debug!("epoch {} installed, current {:?}", epoch, self.current);
        } else {
            self.keys.remove(&epoch);
            self.tables.remove(&epoch);
            debug!("epoch {} discarded", epoch);
        }
    }

    pub fn retained_epochs(&self) -> Vec<Epoch> {
        self.keys.keys().copied().collect()
    }
}
