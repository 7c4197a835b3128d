//! A naive in-memory implementation of [`Storage`](super::Storage), primarily for testing.

use std::collections::BTreeMap;

use prost::Message;

use crate::InstanceId;

use super::{AcceptorStateData, Storage, WriteOptions};

/// A naive in-memory implementation of [`Storage`](super::Storage), primarily for testing.
///
/// Records are kept encoded, the way they would be written to disk, and decoded again on load.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: BTreeMap<InstanceId, Vec<u8>>,
    writes: u64,
    synced_writes: u64,
    fail_writes: bool,
}

/// An error returned by [`InMemoryStorage`].
#[derive(Debug, thiserror::Error)]
pub enum MemoryStorageError {
    #[error("write of instance {0} failed")]
    WriteFailed(InstanceId),
    #[error("corrupt record: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("checksum chain broken at instance {instance_id}: stored {stored:#010x}, given {given:#010x}")]
    ChecksumMismatch {
        instance_id: InstanceId,
        stored: u32,
        given: u32,
    },
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following [`persist`](Storage::persist) fail while `fail` is set.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Returns the number of successful writes.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Returns the number of successful writes which requested a sync.
    pub fn synced_writes(&self) -> u64 {
        self.synced_writes
    }

    fn stored_checksum(&self, instance_id: InstanceId) -> Result<Option<u32>, MemoryStorageError> {
        match self.records.get(&instance_id) {
            Some(encoded) => Ok(Some(AcceptorStateData::decode(encoded.as_slice())?.checksum)),
            None => Ok(None),
        }
    }
}

impl Storage for InMemoryStorage {
    type Error = MemoryStorageError;

    fn persist(
        &mut self,
        instance_id: InstanceId,
        prior_checksum: u32,
        state: &AcceptorStateData,
        options: WriteOptions,
    ) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(MemoryStorageError::WriteFailed(instance_id));
        }

        if let Some(prev_instance_id) = instance_id.checked_sub(1) {
            match self.stored_checksum(prev_instance_id)? {
                Some(stored) if stored != 0 && prior_checksum != 0 && stored != prior_checksum => {
                    return Err(MemoryStorageError::ChecksumMismatch {
                        instance_id,
                        stored,
                        given: prior_checksum,
                    });
                }
                _ => (),
            }
        }

        self.records.insert(instance_id, state.encode_to_vec());
        self.writes += 1;
        if options.sync {
            self.synced_writes += 1;
        }
        Ok(())
    }

    fn load(&mut self, instance_id: InstanceId) -> Result<Option<AcceptorStateData>, Self::Error> {
        match self.records.get(&instance_id) {
            Some(encoded) => Ok(Some(AcceptorStateData::decode(encoded.as_slice())?)),
            None => Ok(None),
        }
    }

    fn max_instance_id(&mut self) -> Result<Option<InstanceId>, Self::Error> {
        Ok(self.records.keys().next_back().copied())
    }
}
