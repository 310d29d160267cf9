use ractor::SpawnErr;
use thiserror::Error;

use crate::chain::{ChainError, DecodeError};
use crate::channel::{ChannelError, ProofError};
use crate::protocol::MessageError;
use crate::transfer::TransferError;
use crate::types::{Address, B256};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Channel not found: {0}")]
    ChannelNotFound(Address),
    #[error("No transfer in flight for hashlock {0:#x}")]
    TransferNotFound(B256),
    #[error("Message about channel {channel} from {sender}, who is not its counterparty")]
    PeerMismatch { channel: Address, sender: Address },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Failed to spawn actor: {0}")]
    SpawnErr(#[from] SpawnErr),
}

pub type Result<T> = std::result::Result<T, Error>;
