///
/// +--------------+---------------------+------------------------------+
/// | KeyPrefix::  | Key::               | Value::                      |
/// +--------------+---------------------+------------------------------+
/// | 0            | Address             | ChannelState                 |
/// | 32           | seq (u64 BE)        | LoggedEvent                  |
/// | 33           | -                   | last event seq (u64 BE)      |
/// | 48           | entity id bytes     | (seq, serialized state)      |
/// | 64           | hashlock            | Secret                       |
/// | 80           | -                   | chain cursor (number, hash)  |
/// | 255          | -                   | schema version               |
/// +--------------+---------------------+------------------------------+
///
pub(crate) const CHANNEL_STATE_PREFIX: u8 = 0;
pub(crate) const EVENT_LOG_PREFIX: u8 = 32;
pub(crate) const EVENT_LOG_LAST_SEQ_KEY: [u8; 1] = [33];
pub(crate) const SNAPSHOT_PREFIX: u8 = 48;
pub(crate) const SECRET_PREFIX: u8 = 64;
pub(crate) const CHAIN_CURSOR_KEY: [u8; 1] = [80];
pub(crate) const DB_VERSION_KEY: [u8; 1] = [255];

pub(crate) const DB_VERSION: u8 = 1;
