use std::collections::BTreeMap;

use crate::store::{StoreError, StoreTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolRecordKind {
    Session,
    Identity,
    PreKey,
    SignedPreKey,
    KyberPreKey,
    SenderKey,
}

impl ProtocolRecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Identity => "identity",
            Self::PreKey => "pre_key",
            Self::SignedPreKey => "signed_pre_key",
            Self::KyberPreKey => "kyber_pre_key",
            Self::SenderKey => "sender_key",
        }
    }
}

type RecordKey = (ProtocolRecordKind, String);

/// Write-back cache of protocol state for one batch of envelopes.
///
/// Decryption reads and writes session/identity/pre-key records here; nothing
/// reaches disk until [`BufferedProtocolStore::flush`] runs inside the same
/// transaction as the message writes for that envelope.
#[derive(Debug, Default)]
pub struct BufferedProtocolStore {
    cache: BTreeMap<RecordKey, Option<Vec<u8>>>,
    dirty: BTreeMap<RecordKey, Option<Vec<u8>>>,
}

impl BufferedProtocolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(
        &mut self,
        tx: &mut dyn StoreTx,
        kind: ProtocolRecordKind,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let record_key = (kind, key.to_string());
        if let Some(v) = self.cache.get(&record_key) {
            return Ok(v.clone());
        }
        let loaded = tx.load_protocol_record(kind, key)?;
        self.cache.insert(record_key, loaded.clone());
        Ok(loaded)
    }

    pub fn store(&mut self, kind: ProtocolRecordKind, key: &str, value: Vec<u8>) {
        let record_key = (kind, key.to_string());
        self.cache.insert(record_key.clone(), Some(value.clone()));
        self.dirty.insert(record_key, Some(value));
    }

    pub fn remove(&mut self, kind: ProtocolRecordKind, key: &str) {
        let record_key = (kind, key.to_string());
        self.cache.insert(record_key.clone(), None);
        self.dirty.insert(record_key, None);
    }

    pub fn pending_writes(&self) -> usize {
        self.dirty.len()
    }

    /// Writes every pending change through `tx`. Returns how many were written.
    pub fn flush(&mut self, tx: &mut dyn StoreTx) -> Result<usize, StoreError> {
        let dirty = std::mem::take(&mut self.dirty);
        let count = dirty.len();
        for ((kind, key), value) in dirty {
            tx.write_protocol_record(kind, &key, value.as_deref())?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MessageStore, SqliteMessageStore};

    #[test]
    fn writes_are_invisible_until_flushed() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let mut buffered = BufferedProtocolStore::new();

        store
            .run_in_transaction(&mut |tx| {
                assert_eq!(buffered.load(tx, ProtocolRecordKind::Session, "bob.1")?, None);
                buffered.store(ProtocolRecordKind::Session, "bob.1", b"s1".to_vec());
                assert_eq!(
                    buffered.load(tx, ProtocolRecordKind::Session, "bob.1")?,
                    Some(b"s1".to_vec())
                );
                assert_eq!(tx.load_protocol_record(ProtocolRecordKind::Session, "bob.1")?, None);
                assert_eq!(buffered.flush(tx)?, 1);
                Ok(())
            })
            .unwrap();

        assert_eq!(buffered.pending_writes(), 0);
        assert_eq!(
            store
                .protocol_record(ProtocolRecordKind::Session, "bob.1")
                .unwrap(),
            Some(b"s1".to_vec())
        );
    }

    #[test]
    fn remove_flushes_a_delete() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let mut buffered = BufferedProtocolStore::new();
        store
            .run_in_transaction(&mut |tx| {
                tx.write_protocol_record(ProtocolRecordKind::PreKey, "9", Some(b"pk"))?;
                buffered.remove(ProtocolRecordKind::PreKey, "9");
                assert_eq!(buffered.load(tx, ProtocolRecordKind::PreKey, "9")?, None);
                buffered.flush(tx)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            store.protocol_record(ProtocolRecordKind::PreKey, "9").unwrap(),
            None
        );
    }
}
