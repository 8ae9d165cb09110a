//! Persistence of per-epoch schedules.
//!
//! Two trees in the embedded store: `schedule` maps an epoch number (in
//! decimal string form) to the JSON serialised list of leader assignments,
//! `schedule-epoch-keys` maps an epoch to the base64 encoded 32-byte key
//! under which that epoch's schedule is encrypted when it is forwarded to
//! the external tip service. The key is only minted and persisted here;
//! encryption itself happens in that external collaborator.

use crate::api::LeaderAssignment;
use crate::blockcfg::Epoch;

use rand::RngCore;
use sled::{Db, Tree};
use thiserror::Error;

const SCHEDULE_TREE: &str = "schedule";
const EPOCH_KEY_TREE: &str = "schedule-epoch-keys";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schedule storage failure")]
    Storage(#[from] sled::Error),
    #[error("stored schedule cannot be decoded")]
    Codec(#[from] serde_json::Error),
    #[error("stored epoch key is corrupt")]
    CorruptKey,
}

pub struct ScheduleStore {
    schedules: Tree,
    epoch_keys: Tree,
}

impl ScheduleStore {
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        Ok(ScheduleStore {
            schedules: db.open_tree(SCHEDULE_TREE)?,
            epoch_keys: db.open_tree(EPOCH_KEY_TREE)?,
        })
    }

    pub fn store(&self, epoch: Epoch, schedule: &[LeaderAssignment]) -> Result<(), StoreError> {
        let data = serde_json::to_vec(schedule)?;
        self.schedules
            .insert(epoch.to_string().as_bytes(), data)?;
        Ok(())
    }

    pub fn load(&self, epoch: Epoch) -> Result<Option<Vec<LeaderAssignment>>, StoreError> {
        match self.schedules.get(epoch.to_string().as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// The encryption key of the given epoch; generated and persisted on
    /// first request.
    pub fn epoch_key(&self, epoch: Epoch) -> Result<String, StoreError> {
        if let Some(stored) = self.epoch_keys.get(epoch.to_string().as_bytes())? {
            return String::from_utf8(stored.to_vec()).map_err(|_| StoreError::CorruptKey);
        }
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let encoded = base64::encode(key);
        self.epoch_keys
            .insert(epoch.to_string().as_bytes(), encoded.as_bytes())?;
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::tests::assignment_at;
    use std::time::{Duration, UNIX_EPOCH};

    fn open_store() -> (tempfile::TempDir, ScheduleStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = ScheduleStore::open(&db).unwrap();
        (dir, store)
    }

    #[test]
    fn schedule_round_trips_through_the_store() {
        let (_dir, store) = open_store();
        let schedule = vec![
            assignment_at(4, 10, UNIX_EPOCH + Duration::from_secs(100)),
            assignment_at(4, 20, UNIX_EPOCH + Duration::from_secs(200)),
        ];
        store.store(Epoch(4), &schedule).unwrap();
        let reloaded = store.load(Epoch(4)).unwrap().unwrap();
        assert_eq!(schedule, reloaded);
    }

    #[test]
    fn loading_an_unknown_epoch_yields_nothing() {
        let (_dir, store) = open_store();
        assert!(store.load(Epoch(7)).unwrap().is_none());
    }

    #[test]
    fn epoch_key_is_minted_once_and_decodes_to_32_bytes() {
        let (_dir, store) = open_store();
        let first = store.epoch_key(Epoch(9)).unwrap();
        let second = store.epoch_key(Epoch(9)).unwrap();
        assert_eq!(first, second);
        assert_eq!(base64::decode(&first).unwrap().len(), 32);
        let other = store.epoch_key(Epoch(10)).unwrap();
        assert_ne!(first, other);
    }
}
