pub mod actor;
pub mod client;
pub mod events;
pub mod watcher;

pub use actor::{ChainTxActor, ChainTxMessage};
pub use client::{BlockRef, ChainClient, ChainError, ChainTx, RawLog, RpcChainClient};
pub use events::{decode_log, ContractEvent, ContractEventBody, ContractEventKind, DecodeError};
pub use watcher::{ChainWatcherActor, ChainWatcherConfig, ChainWatcherMessage};

#[cfg(test)]
pub mod tests;
