use std::fmt;

use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use thiserror::Error;

use crate::channel::BalanceProof;
use crate::serde_utils::U64Hex;
use crate::types::{keccak256, Address, B256, BlockNumber, Secret, U256};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC transport failure: {0}")]
    Rpc(String),
    #[error("Malformed RPC response: {0}")]
    BadResponse(String),
    #[error("Transaction nonce out of sync")]
    NonceTooLow,
    #[error("Retry budget exhausted submitting {0}")]
    RetriesExhausted(String),
}

/// A raw settlement-layer log, positionally decoded by `chain::events`.
#[serde_as]
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    #[serde_as(as = "crate::serde_utils::SliceHex")]
    pub data: Vec<u8>,
    pub block_number: BlockNumber,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: BlockNumber,
    pub hash: B256,
    pub parent_hash: B256,
}

/// An on-chain call the node may need to make. Encoding to calldata happens
/// at the client boundary; everything inside the node speaks these terms.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainTx {
    Close {
        channel: Address,
        proof: Option<BalanceProof>,
    },
    UpdateTransfer {
        channel: Address,
        proof: BalanceProof,
    },
    RegisterSecret {
        registry: Address,
        secret: Secret,
    },
    Settle {
        channel: Address,
    },
}

impl fmt::Display for ChainTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainTx::Close { channel, .. } => write!(f, "close({})", channel),
            ChainTx::UpdateTransfer { channel, .. } => write!(f, "updateTransfer({})", channel),
            ChainTx::RegisterSecret { .. } => write!(f, "registerSecret(..)"),
            ChainTx::Settle { channel } => write!(f, "settle({})", channel),
        }
    }
}

impl ChainTx {
    pub fn recipient(&self) -> Address {
        match self {
            ChainTx::Close { channel, .. }
            | ChainTx::UpdateTransfer { channel, .. }
            | ChainTx::Settle { channel } => *channel,
            ChainTx::RegisterSecret { registry, .. } => *registry,
        }
    }

    /// ABI calldata: 4-byte selector, fixed args as 32-byte words, one
    /// optional trailing dynamic `bytes` argument for the proof signature.
    pub fn calldata(&self) -> Vec<u8> {
        match self {
            ChainTx::Close { proof: None, .. } => abi_call("close()", &[], None),
            ChainTx::Close {
                proof: Some(proof), ..
            } => proof_call("close(uint256,uint256,bytes32,bytes32,bytes)", proof),
            ChainTx::UpdateTransfer { proof, .. } => proof_call(
                "updateTransfer(uint256,uint256,bytes32,bytes32,bytes)",
                proof,
            ),
            ChainTx::RegisterSecret { secret, .. } => abi_call(
                "registerSecret(bytes32)",
                &[B256::from_slice(secret.as_bytes())],
                None,
            ),
            ChainTx::Settle { .. } => abi_call("settle()", &[], None),
        }
    }
}

fn proof_call(signature: &str, proof: &BalanceProof) -> Vec<u8> {
    abi_call(
        signature,
        &[
            B256::from(U256::from(proof.nonce)),
            B256::from(proof.transferred_amount),
            proof.locks_root,
            proof.extra_hash,
        ],
        Some(&proof.signature.to_bytes()),
    )
}

fn abi_call(signature: &str, words: &[B256], dynamic: Option<&[u8]>) -> Vec<u8> {
    let mut data = keccak256(signature.as_bytes())[..4].to_vec();
    for word in words {
        data.extend_from_slice(word.as_slice());
    }
    if let Some(bytes) = dynamic {
        // Offset to the dynamic part, then length, then padded payload.
        let offset = (words.len() + 1) * 32;
        data.extend_from_slice(&B256::from(U256::from(offset)).0);
        data.extend_from_slice(&B256::from(U256::from(bytes.len())).0);
        data.extend_from_slice(bytes);
        let padding = (32 - bytes.len() % 32) % 32;
        data.extend_from_slice(&vec![0u8; padding]);
    }
    data
}

/// The seam towards the settlement layer. The dispatcher, watcher and the
/// transaction gateway only ever see this trait; production wires in the
/// JSON-RPC client below, tests an in-memory mock.
#[ractor::async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn block_number(&self) -> Result<BlockNumber, ChainError>;
    async fn block_ref(&self, number: BlockNumber) -> Result<Option<BlockRef>, ChainError>;
    async fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<RawLog>, ChainError>;
    async fn account_nonce(&self, account: Address) -> Result<u64, ChainError>;
    async fn submit(&self, tx: &ChainTx, from: Address, nonce: u64) -> Result<B256, ChainError>;
}

#[serde_as]
#[derive(Deserialize)]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    #[serde_as(as = "crate::serde_utils::SliceHex")]
    data: Vec<u8>,
    #[serde_as(as = "U64Hex")]
    #[serde(rename = "blockNumber")]
    block_number: u64,
    #[serde(rename = "blockHash")]
    block_hash: B256,
    #[serde(rename = "transactionHash")]
    tx_hash: B256,
    #[serde_as(as = "U64Hex")]
    #[serde(rename = "logIndex")]
    log_index: u64,
}

#[serde_as]
#[derive(Deserialize)]
struct RpcBlock {
    #[serde_as(as = "U64Hex")]
    number: u64,
    hash: B256,
    #[serde(rename = "parentHash")]
    parent_hash: B256,
}

#[serde_as]
#[derive(Serialize)]
struct RpcTransactionRequest {
    from: Address,
    to: Address,
    #[serde_as(as = "crate::serde_utils::SliceHex")]
    data: Vec<u8>,
    #[serde_as(as = "U64Hex")]
    nonce: u64,
}

#[serde_as]
#[derive(Serialize)]
struct RpcLogFilter {
    #[serde_as(as = "U64Hex")]
    #[serde(rename = "fromBlock")]
    from_block: u64,
    #[serde_as(as = "U64Hex")]
    #[serde(rename = "toBlock")]
    to_block: u64,
}

/// Thin JSON-RPC client over the node's settlement-layer endpoint. Account
/// management and transaction signing stay on the endpoint's side; this
/// node only prepares calldata.
pub struct RpcChainClient {
    client: HttpClient,
}

impl RpcChainClient {
    pub fn new(url: &str) -> Result<Self, ChainError> {
        let client = HttpClientBuilder::default()
            .build(url)
            .map_err(|err| ChainError::Rpc(err.to_string()))?;
        Ok(RpcChainClient { client })
    }
}

fn rpc_error(err: jsonrpsee::core::ClientError) -> ChainError {
    let text = err.to_string();
    if text.contains("nonce too low") {
        ChainError::NonceTooLow
    } else {
        ChainError::Rpc(text)
    }
}

#[ractor::async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> Result<BlockNumber, ChainError> {
        let hex: String = self
            .client
            .request("eth_blockNumber", rpc_params![])
            .await
            .map_err(rpc_error)?;
        u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|err| ChainError::BadResponse(err.to_string()))
    }

    async fn block_ref(&self, number: BlockNumber) -> Result<Option<BlockRef>, ChainError> {
        let block: Option<RpcBlock> = self
            .client
            .request(
                "eth_getBlockByNumber",
                rpc_params![format!("0x{:x}", number), false],
            )
            .await
            .map_err(rpc_error)?;
        Ok(block.map(|b| BlockRef {
            number: b.number,
            hash: b.hash,
            parent_hash: b.parent_hash,
        }))
    }

    async fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<RawLog>, ChainError> {
        let logs: Vec<RpcLog> = self
            .client
            .request(
                "eth_getLogs",
                rpc_params![RpcLogFilter {
                    from_block: from,
                    to_block: to,
                }],
            )
            .await
            .map_err(rpc_error)?;
        Ok(logs
            .into_iter()
            .map(|log| RawLog {
                address: log.address,
                topics: log.topics,
                data: log.data,
                block_number: log.block_number,
                block_hash: log.block_hash,
                tx_hash: log.tx_hash,
                log_index: log.log_index,
            })
            .collect())
    }

    async fn account_nonce(&self, account: Address) -> Result<u64, ChainError> {
        let hex: String = self
            .client
            .request(
                "eth_getTransactionCount",
                rpc_params![account, "pending"],
            )
            .await
            .map_err(rpc_error)?;
        u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|err| ChainError::BadResponse(err.to_string()))
    }

    async fn submit(&self, tx: &ChainTx, from: Address, nonce: u64) -> Result<B256, ChainError> {
        let request = RpcTransactionRequest {
            from,
            to: tx.recipient(),
            data: tx.calldata(),
            nonce,
        };
        self.client
            .request("eth_sendTransaction", rpc_params![request])
            .await
            .map_err(rpc_error)
    }
}
