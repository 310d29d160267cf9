//! Positional decoding of settlement-layer logs into typed events.
//!
//! One process-lifetime table maps a log's first topic (the keccak-256 hash
//! of the event signature string) to its kind and field extractor. Address
//! fields occupy bytes 12..32 of their 32-byte slot, uints the full slot
//! big-endian; dynamic strings follow the standard ABI rule of an offset
//! slot, a length slot, and the bytes padded to a 32-byte multiple.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{keccak256, Address, B256, BlockNumber, Secret, U256};

use super::client::RawLog;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum DecodeError {
    #[error("No decoder for topic {0:#x}")]
    UnknownTopic(B256),
    #[error("Log carries no topics")]
    MissingTopics,
    #[error("Log data too short: wanted {wanted} bytes, got {got}")]
    DataTooShort { wanted: usize, got: usize },
    #[error("Dynamic field offset {0} is not the canonical head offset")]
    BadDynamicOffset(usize),
    #[error("Dynamic string is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ContractEventKind {
    TokenAdded,
    ChannelNew,
    ChannelNewBalance,
    ChannelClosed,
    TransferUpdated,
    ChannelSettled,
    SecretRevealed,
    AddressRegistered,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ContractEventBody {
    TokenAdded {
        token: Address,
        manager: Address,
    },
    ChannelNew {
        channel: Address,
        participant1: Address,
        participant2: Address,
        settle_timeout: u64,
    },
    ChannelNewBalance {
        token: Address,
        participant: Address,
        balance: U256,
    },
    ChannelClosed {
        closing_address: Address,
    },
    TransferUpdated {
        node: Address,
    },
    ChannelSettled,
    SecretRevealed {
        secret: Secret,
        receiver: Address,
    },
    AddressRegistered {
        account: Address,
        endpoint: String,
    },
}

impl ContractEventBody {
    pub fn kind(&self) -> ContractEventKind {
        match self {
            ContractEventBody::TokenAdded { .. } => ContractEventKind::TokenAdded,
            ContractEventBody::ChannelNew { .. } => ContractEventKind::ChannelNew,
            ContractEventBody::ChannelNewBalance { .. } => ContractEventKind::ChannelNewBalance,
            ContractEventBody::ChannelClosed { .. } => ContractEventKind::ChannelClosed,
            ContractEventBody::TransferUpdated { .. } => ContractEventKind::TransferUpdated,
            ContractEventBody::ChannelSettled => ContractEventKind::ChannelSettled,
            ContractEventBody::SecretRevealed { .. } => ContractEventKind::SecretRevealed,
            ContractEventBody::AddressRegistered { .. } => ContractEventKind::AddressRegistered,
        }
    }
}

/// A decoded log, attached to the block that confirmed it. For channel
/// events `contract` is the netting channel address itself.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub contract: Address,
    pub block_number: BlockNumber,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
    pub body: ContractEventBody,
}

type Extractor = fn(&RawLog) -> Result<ContractEventBody, DecodeError>;

struct EventDecoder {
    kind: ContractEventKind,
    extract: Extractor,
}

static DECODERS: Lazy<HashMap<B256, EventDecoder>> = Lazy::new(|| {
    let table: [(&str, ContractEventKind, Extractor); 8] = [
        ("TokenAdded(address,address)", ContractEventKind::TokenAdded, decode_token_added),
        (
            "ChannelNew(address,address,address,uint256)",
            ContractEventKind::ChannelNew,
            decode_channel_new,
        ),
        (
            "ChannelNewBalance(address,address,uint256)",
            ContractEventKind::ChannelNewBalance,
            decode_channel_new_balance,
        ),
        (
            "ChannelClosed(address,uint256)",
            ContractEventKind::ChannelClosed,
            decode_channel_closed,
        ),
        (
            "TransferUpdated(address,uint256)",
            ContractEventKind::TransferUpdated,
            decode_transfer_updated,
        ),
        (
            "ChannelSettled(uint256)",
            ContractEventKind::ChannelSettled,
            decode_channel_settled,
        ),
        (
            "ChannelSecretRevealed(bytes32,address)",
            ContractEventKind::SecretRevealed,
            decode_secret_revealed,
        ),
        (
            "AddressRegistered(address,string)",
            ContractEventKind::AddressRegistered,
            decode_address_registered,
        ),
    ];
    table
        .into_iter()
        .map(|(signature, kind, extract)| {
            (
                keccak256(signature.as_bytes()),
                EventDecoder { kind, extract },
            )
        })
        .collect()
});

/// Topic-0 for a given event kind, for constructing logs in tests and for
/// subscription filters.
pub fn topic_of(kind: ContractEventKind) -> B256 {
    *DECODERS
        .iter()
        .find(|(_, decoder)| decoder.kind == kind)
        .map(|(topic, _)| topic)
        .expect("every kind is in the decoder table")
}

pub fn decode_log(log: &RawLog) -> Result<ContractEvent, DecodeError> {
    let topic0 = log.topics.first().ok_or(DecodeError::MissingTopics)?;
    let decoder = DECODERS
        .get(topic0)
        .ok_or(DecodeError::UnknownTopic(*topic0))?;
    let body = (decoder.extract)(log)?;
    Ok(ContractEvent {
        contract: log.address,
        block_number: log.block_number,
        block_hash: log.block_hash,
        tx_hash: log.tx_hash,
        log_index: log.log_index,
        body,
    })
}

fn slot(data: &[u8], index: usize) -> Result<&[u8], DecodeError> {
    let end = (index + 1) * 32;
    if data.len() < end {
        return Err(DecodeError::DataTooShort {
            wanted: end,
            got: data.len(),
        });
    }
    Ok(&data[index * 32..end])
}

fn address_at(data: &[u8], index: usize) -> Result<Address, DecodeError> {
    Ok(Address::from_slice(&slot(data, index)?[12..]))
}

fn uint_at(data: &[u8], index: usize) -> Result<U256, DecodeError> {
    Ok(U256::from_be_slice(slot(data, index)?))
}

fn u64_at(data: &[u8], index: usize) -> Result<u64, DecodeError> {
    Ok(uint_at(data, index)?.saturating_to())
}

/// Standard dynamic-type decoding: the head slot at `index` holds the byte
/// offset of the tail, which starts with a length slot.
fn string_at(data: &[u8], index: usize) -> Result<String, DecodeError> {
    let offset: usize = uint_at(data, index)?.saturating_to();
    if offset % 32 != 0 {
        return Err(DecodeError::BadDynamicOffset(offset));
    }
    let length: usize = uint_at(data, offset / 32)?.saturating_to();
    let start = offset + 32;
    if data.len() < start + length {
        return Err(DecodeError::DataTooShort {
            wanted: start + length,
            got: data.len(),
        });
    }
    String::from_utf8(data[start..start + length].to_vec())
        .map_err(|_| DecodeError::InvalidUtf8)
}

fn decode_token_added(log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    Ok(ContractEventBody::TokenAdded {
        token: address_at(&log.data, 0)?,
        manager: address_at(&log.data, 1)?,
    })
}

fn decode_channel_new(log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    Ok(ContractEventBody::ChannelNew {
        channel: address_at(&log.data, 0)?,
        participant1: address_at(&log.data, 1)?,
        participant2: address_at(&log.data, 2)?,
        settle_timeout: u64_at(&log.data, 3)?,
    })
}

fn decode_channel_new_balance(log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    Ok(ContractEventBody::ChannelNewBalance {
        token: address_at(&log.data, 0)?,
        participant: address_at(&log.data, 1)?,
        balance: uint_at(&log.data, 2)?,
    })
}

fn decode_channel_closed(log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    Ok(ContractEventBody::ChannelClosed {
        closing_address: address_at(&log.data, 0)?,
    })
}

fn decode_transfer_updated(log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    Ok(ContractEventBody::TransferUpdated {
        node: address_at(&log.data, 0)?,
    })
}

fn decode_channel_settled(_log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    Ok(ContractEventBody::ChannelSettled)
}

fn decode_secret_revealed(log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    let secret_slot = slot(&log.data, 0)?;
    let mut secret = [0u8; 32];
    secret.copy_from_slice(secret_slot);
    Ok(ContractEventBody::SecretRevealed {
        secret: Secret::new(secret),
        receiver: address_at(&log.data, 1)?,
    })
}

/// `AddressRegistered(address indexed eth_address, string socket)`: the
/// account rides in topic 1, the endpoint string is the single dynamic
/// data field.
fn decode_address_registered(log: &RawLog) -> Result<ContractEventBody, DecodeError> {
    let account_topic = log.topics.get(1).ok_or(DecodeError::MissingTopics)?;
    Ok(ContractEventBody::AddressRegistered {
        account: Address::from_slice(&account_topic[12..]),
        endpoint: string_at(&log.data, 0)?,
    })
}
