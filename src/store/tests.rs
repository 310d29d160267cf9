use tempfile::tempdir;

use crate::channel::ChannelState;
use crate::dispatcher::LoggedEvent;
use crate::store::{
    ChainCursorStore, ChannelStateStore, EventLogStore, SecretStore, Store,
};
use crate::types::{keccak256, Address, Secret};

fn sample_channel() -> ChannelState {
    ChannelState::new(
        Address::repeat_byte(0xcc),
        Address::repeat_byte(0xee),
        Address::repeat_byte(0x01),
        Address::repeat_byte(0x02),
        40,
        10,
    )
}

#[test]
fn test_channel_state_round_trip() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path().join("log.db")).unwrap();
    let mut channel = sample_channel();
    channel.on_opened(5).unwrap();

    assert!(store.get_channel_state(&channel.channel).is_none());
    store.insert_channel_state(&channel);
    assert_eq!(store.get_channel_state(&channel.channel), Some(channel.clone()));
    assert_eq!(store.list_channel_states(), vec![channel.clone()]);
    store.delete_channel_state(&channel.channel);
    assert!(store.get_channel_state(&channel.channel).is_none());
}

#[test]
fn test_event_log_is_append_only_and_ordered() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path().join("log.db")).unwrap();
    assert_eq!(store.last_seq(), 0);
    assert!(store.events_from(0).is_empty());

    for number in 1..=5u64 {
        let seq = store.append_event(&LoggedEvent::BlockMined(number));
        assert_eq!(seq, number);
    }
    assert_eq!(store.last_seq(), 5);

    let tail = store.events_from(2);
    assert_eq!(tail.len(), 3);
    assert_eq!(tail[0], (3, LoggedEvent::BlockMined(3)));
    assert_eq!(tail[2], (5, LoggedEvent::BlockMined(5)));
}

#[test]
fn test_event_log_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("log.db");
    {
        let store = Store::new(&path).unwrap();
        store.append_event(&LoggedEvent::BlockMined(9));
    }
    let store = Store::new(&path).unwrap();
    assert_eq!(store.last_seq(), 1);
    assert_eq!(store.events_from(0), vec![(1, LoggedEvent::BlockMined(9))]);
}

#[test]
fn test_snapshots() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path().join("log.db")).unwrap();
    assert!(store.get_snapshot(b"node").is_none());

    store.put_snapshot(b"node", 7, vec![1, 2, 3]);
    store.put_snapshot(b"other", 7, vec![4]);
    assert_eq!(store.get_snapshot(b"node"), Some((7, vec![1, 2, 3])));
    assert_eq!(store.list_snapshots().len(), 2);

    // A newer snapshot replaces the prior one.
    store.put_snapshot(b"node", 12, vec![9]);
    assert_eq!(store.get_snapshot(b"node"), Some((12, vec![9])));

    store.delete_snapshot(b"other");
    assert_eq!(store.list_snapshots().len(), 1);
}

#[test]
fn test_secret_store() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path().join("log.db")).unwrap();
    let secret = Secret::new([3u8; 32]);
    assert!(store.get_secret(&secret.hashlock()).is_none());
    store.insert_secret(secret);
    assert_eq!(store.get_secret(&secret.hashlock()), Some(secret));
    assert!(store.get_secret(&keccak256(b"unrelated")).is_none());
}

#[test]
fn test_chain_cursor() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path().join("log.db")).unwrap();
    assert!(store.get_chain_cursor().is_none());
    store.set_chain_cursor(42, keccak256(b"block42"));
    assert_eq!(store.get_chain_cursor(), Some((42, keccak256(b"block42"))));
    store.set_chain_cursor(43, keccak256(b"block43"));
    assert_eq!(store.get_chain_cursor(), Some((43, keccak256(b"block43"))));
}
