use std::{path::Path, sync::Arc};

use rocksdb::{prelude::*, DBCompressionType, WriteBatch, DB};
use serde::Serialize;

use super::schema::*;
use crate::{
    channel::ChannelState,
    dispatcher::LoggedEvent,
    types::{Address, B256, BlockNumber, Secret},
};

/// The node's single database: event log, snapshots, channel records and
/// the secret store all live here, under `<base_dir>/log.db`.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<DB>,
}

impl Store {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let db = Self::open_db(path.as_ref())?;
        Self::check_version(&db)?;
        Ok(Self { db })
    }

    fn open_db(path: &Path) -> Result<Arc<DB>, String> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_compression_type(DBCompressionType::Lz4);
        let db = Arc::new(DB::open(&options, path).map_err(|e| e.to_string())?);
        Ok(db)
    }

    /// The on-disk format is internal and versioned; a mismatch means the
    /// log was written by an incompatible build and must not be touched.
    fn check_version(db: &DB) -> Result<(), String> {
        match db.get(DB_VERSION_KEY).map_err(|e| e.to_string())? {
            Some(version) if version.as_ref() == [DB_VERSION] => Ok(()),
            Some(version) => Err(format!(
                "database version {:?} is incompatible with supported version {}",
                version.as_ref(),
                DB_VERSION
            )),
            None => db
                .put(DB_VERSION_KEY, [DB_VERSION])
                .map_err(|e| e.to_string()),
        }
    }

    fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Vec<u8>> {
        self.db
            .get(key.as_ref())
            .map(|v| v.map(|vi| vi.to_vec()))
            .expect("get should be OK")
    }

    fn batch(&self) -> Batch {
        Batch {
            db: Arc::clone(&self.db),
            wb: WriteBatch::default(),
        }
    }

    fn prefix_iterator<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a {
        self.db
            .prefix_iterator(prefix)
            .take_while(move |(col_key, _)| col_key.starts_with(prefix))
    }
}

pub struct Batch {
    db: Arc<DB>,
    wb: WriteBatch,
}

impl Batch {
    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.wb.put(key, value).expect("batch put should be OK")
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.wb.delete(key.as_ref()).expect("batch delete should be OK")
    }

    fn commit(self) {
        self.db.write(&self.wb).expect("batch commit should be OK")
    }
}

pub(crate) fn serialize_to_vec<T: ?Sized + Serialize>(value: &T, field_name: &str) -> Vec<u8> {
    bincode::serialize(value)
        .unwrap_or_else(|e| panic!("serialization of {} should be OK: {}", field_name, e))
}

pub(crate) fn deserialize_from_slice<'a, T: serde::Deserialize<'a>>(
    slice: &'a [u8],
    field_name: &str,
) -> T {
    bincode::deserialize(slice)
        .unwrap_or_else(|e| panic!("deserialization of {} should be OK: {}", field_name, e))
}

pub trait ChannelStateStore {
    fn get_channel_state(&self, channel: &Address) -> Option<ChannelState>;
    fn insert_channel_state(&self, state: &ChannelState);
    fn list_channel_states(&self) -> Vec<ChannelState>;
    fn delete_channel_state(&self, channel: &Address);
}

/// Write-ahead event log plus per-entity snapshots. Sequence numbers are
/// allocated by the single-writer dispatcher, so plain read-then-write is
/// race-free here.
pub trait EventLogStore {
    fn append_event(&self, event: &LoggedEvent) -> u64;
    fn events_from(&self, seq_exclusive: u64) -> Vec<(u64, LoggedEvent)>;
    fn last_seq(&self) -> u64;
    fn put_snapshot(&self, entity: &[u8], seq: u64, state: Vec<u8>);
    fn get_snapshot(&self, entity: &[u8]) -> Option<(u64, Vec<u8>)>;
    fn list_snapshots(&self) -> Vec<(Vec<u8>, u64, Vec<u8>)>;
    fn delete_snapshot(&self, entity: &[u8]);
}

pub trait SecretStore {
    fn insert_secret(&self, secret: Secret);
    fn get_secret(&self, hashlock: &B256) -> Option<Secret>;
}

pub trait ChainCursorStore {
    fn get_chain_cursor(&self) -> Option<(BlockNumber, B256)>;
    fn set_chain_cursor(&self, number: BlockNumber, hash: B256);
}

fn channel_state_key(channel: &Address) -> Vec<u8> {
    [&[CHANNEL_STATE_PREFIX], channel.as_slice()].concat()
}

fn event_key(seq: u64) -> Vec<u8> {
    [&[EVENT_LOG_PREFIX][..], &seq.to_be_bytes()].concat()
}

fn snapshot_key(entity: &[u8]) -> Vec<u8> {
    [&[SNAPSHOT_PREFIX], entity].concat()
}

fn secret_key(hashlock: &B256) -> Vec<u8> {
    [&[SECRET_PREFIX], hashlock.as_slice()].concat()
}

impl ChannelStateStore for Store {
    fn get_channel_state(&self, channel: &Address) -> Option<ChannelState> {
        self.get(channel_state_key(channel))
            .map(|v| deserialize_from_slice(v.as_ref(), "ChannelState"))
    }

    fn insert_channel_state(&self, state: &ChannelState) {
        let mut batch = self.batch();
        batch.put(
            channel_state_key(&state.channel),
            serialize_to_vec(state, "ChannelState"),
        );
        batch.commit();
    }

    fn list_channel_states(&self) -> Vec<ChannelState> {
        self.prefix_iterator(&[CHANNEL_STATE_PREFIX])
            .map(|(_, value)| deserialize_from_slice(value.as_ref(), "ChannelState"))
            .collect()
    }

    fn delete_channel_state(&self, channel: &Address) {
        let mut batch = self.batch();
        batch.delete(channel_state_key(channel));
        batch.commit();
    }
}

impl EventLogStore for Store {
    fn append_event(&self, event: &LoggedEvent) -> u64 {
        let seq = self.last_seq() + 1;
        let mut batch = self.batch();
        batch.put(event_key(seq), serialize_to_vec(event, "LoggedEvent"));
        batch.put(EVENT_LOG_LAST_SEQ_KEY, seq.to_be_bytes());
        batch.commit();
        seq
    }

    fn events_from(&self, seq_exclusive: u64) -> Vec<(u64, LoggedEvent)> {
        self.prefix_iterator(&[EVENT_LOG_PREFIX])
            .filter_map(|(key, value)| {
                let seq = u64::from_be_bytes(
                    key[1..9].try_into().expect("event key holds a u64 seq"),
                );
                (seq > seq_exclusive)
                    .then(|| (seq, deserialize_from_slice(value.as_ref(), "LoggedEvent")))
            })
            .collect()
    }

    fn last_seq(&self) -> u64 {
        self.get(EVENT_LOG_LAST_SEQ_KEY)
            .map(|v| u64::from_be_bytes(v.try_into().expect("last seq holds a u64")))
            .unwrap_or(0)
    }

    fn put_snapshot(&self, entity: &[u8], seq: u64, state: Vec<u8>) {
        let mut batch = self.batch();
        batch.put(
            snapshot_key(entity),
            serialize_to_vec(&(seq, state), "Snapshot"),
        );
        batch.commit();
    }

    fn get_snapshot(&self, entity: &[u8]) -> Option<(u64, Vec<u8>)> {
        self.get(snapshot_key(entity))
            .map(|v| deserialize_from_slice(v.as_ref(), "Snapshot"))
    }

    fn list_snapshots(&self) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
        self.prefix_iterator(&[SNAPSHOT_PREFIX])
            .map(|(key, value)| {
                let (seq, state): (u64, Vec<u8>) =
                    deserialize_from_slice(value.as_ref(), "Snapshot");
                (key[1..].to_vec(), seq, state)
            })
            .collect()
    }

    fn delete_snapshot(&self, entity: &[u8]) {
        let mut batch = self.batch();
        batch.delete(snapshot_key(entity));
        batch.commit();
    }
}

impl SecretStore for Store {
    fn insert_secret(&self, secret: Secret) {
        let mut batch = self.batch();
        batch.put(
            secret_key(&secret.hashlock()),
            serialize_to_vec(&secret, "Secret"),
        );
        batch.commit();
    }

    fn get_secret(&self, hashlock: &B256) -> Option<Secret> {
        self.get(secret_key(hashlock))
            .map(|v| deserialize_from_slice(v.as_ref(), "Secret"))
    }
}

impl ChainCursorStore for Store {
    fn get_chain_cursor(&self) -> Option<(BlockNumber, B256)> {
        self.get(CHAIN_CURSOR_KEY)
            .map(|v| deserialize_from_slice(v.as_ref(), "ChainCursor"))
    }

    fn set_chain_cursor(&self, number: BlockNumber, hash: B256) {
        let mut batch = self.batch();
        batch.put(
            CHAIN_CURSOR_KEY,
            serialize_to_vec(&(number, hash), "ChainCursor"),
        );
        batch.commit();
    }
}
