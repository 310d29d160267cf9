use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ractor::{async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef};
use tracing::{debug, info, trace, warn};

use crate::dispatcher::{send_event, DispatcherEvent, DispatcherMessage};
use crate::store::ChainCursorStore;
use crate::types::{BlockNumber, B256};

use super::client::{BlockRef, ChainClient};
use super::events::{decode_log, DecodeError};

/// How many emitted block hashes to keep for reorg detection. Reorgs deeper
/// than both this and the confirmation depth rewind to the last persisted
/// cursor; the dispatcher absorbs the re-emission.
const MAX_TRACKED_BLOCKS: usize = 64;

/// Follows the settlement layer from the persisted cursor and feeds the
/// dispatcher typed events, holding each block back until it is
/// `confirmation_blocks` deep. `BlockMined(n)` is always emitted before any
/// event of block n.
pub struct ChainWatcherActor<C, S> {
    client: Arc<C>,
    dispatcher: ActorRef<DispatcherMessage>,
    store: S,
}

#[derive(Clone, Debug)]
pub struct ChainWatcherConfig {
    pub confirmation_blocks: u64,
    pub start_block: BlockNumber,
    pub poll_interval: Duration,
}

#[derive(Debug)]
pub enum ChainWatcherMessage {
    Poll,
}

pub struct ChainWatcherState {
    config: ChainWatcherConfig,
    /// Last confirmed block already emitted to the dispatcher.
    cursor: BlockNumber,
    /// Recently emitted blocks, oldest first.
    recent: VecDeque<BlockRef>,
}

impl<C, S> ChainWatcherActor<C, S>
where
    C: ChainClient,
    S: ChainCursorStore + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>, dispatcher: ActorRef<DispatcherMessage>, store: S) -> Self {
        Self {
            client,
            dispatcher,
            store,
        }
    }

    /// Re-checks the hashes of already-emitted blocks, deepest last. A
    /// mismatch rewinds the cursor to the fork point; the range above it is
    /// fetched and emitted again on the next poll.
    async fn rewind_past_reorg(&self, state: &mut ChainWatcherState) {
        while let Some(tracked) = state.recent.back().copied() {
            match self.client.block_ref(tracked.number).await {
                Ok(Some(current)) if current.hash == tracked.hash => return,
                Ok(_) => {
                    warn!(
                        "reorg: block {} hash {:#x} no longer canonical, rewinding",
                        tracked.number, tracked.hash
                    );
                    state.recent.pop_back();
                    state.cursor = tracked.number - 1;
                    let hash = state
                        .recent
                        .back()
                        .map(|block| block.hash)
                        .unwrap_or(B256::ZERO);
                    self.store.set_chain_cursor(state.cursor, hash);
                }
                Err(err) => {
                    warn!("reorg check failed: {}", err);
                    return;
                }
            }
        }
    }

    async fn emit_block(&self, state: &mut ChainWatcherState, block: BlockRef) -> bool {
        let logs = match self.client.get_logs(block.number, block.number).await {
            Ok(logs) => logs,
            Err(err) => {
                warn!("fetching logs for block {}: {}", block.number, err);
                return false;
            }
        };
        send_event(&self.dispatcher, DispatcherEvent::BlockMined(block.number));
        let mut logs = logs;
        logs.sort_by_key(|log| log.log_index);
        for log in &logs {
            match decode_log(log) {
                Ok(event) => {
                    trace!("chain event {:?}", event);
                    send_event(&self.dispatcher, DispatcherEvent::ChainEvent(event));
                }
                Err(DecodeError::UnknownTopic(topic)) => {
                    trace!("skipping log with unhandled topic {:#x}", topic)
                }
                Err(err) => warn!("undecodable log in block {}: {}", block.number, err),
            }
        }
        state.cursor = block.number;
        state.recent.push_back(block);
        while state.recent.len() > MAX_TRACKED_BLOCKS {
            state.recent.pop_front();
        }
        self.store.set_chain_cursor(block.number, block.hash);
        true
    }

    async fn poll(&self, state: &mut ChainWatcherState) {
        let tip = match self.client.block_number().await {
            Ok(tip) => tip,
            Err(err) => {
                warn!("settlement layer unreachable: {}", err);
                return;
            }
        };
        self.rewind_past_reorg(state).await;
        let confirmed = tip.saturating_sub(state.config.confirmation_blocks);
        while state.cursor < confirmed {
            let number = state.cursor + 1;
            let block = match self.client.block_ref(number).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    debug!("block {} not available yet", number);
                    return;
                }
                Err(err) => {
                    warn!("fetching block {}: {}", number, err);
                    return;
                }
            };
            if let Some(previous) = state.recent.back() {
                if block.parent_hash != previous.hash {
                    warn!(
                        "reorg: block {} does not extend {:#x}",
                        number, previous.hash
                    );
                    // Next poll re-checks the tracked chain and rewinds.
                    return;
                }
            }
            if !self.emit_block(state, block).await {
                return;
            }
        }
    }
}

#[rasync_trait]
impl<C, S> Actor for ChainWatcherActor<C, S>
where
    C: ChainClient,
    S: ChainCursorStore + Send + Sync + 'static,
{
    type Msg = ChainWatcherMessage;
    type State = ChainWatcherState;
    type Arguments = ChainWatcherConfig;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        config: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (cursor, hash) = self
            .store
            .get_chain_cursor()
            .unwrap_or((config.start_block, B256::ZERO));
        let mut recent = VecDeque::new();
        if hash != B256::ZERO {
            recent.push_back(BlockRef {
                number: cursor,
                hash,
                parent_hash: B256::ZERO,
            });
        }
        info!(
            "chain watcher starting from block {} with confirmation depth {}",
            cursor, config.confirmation_blocks
        );
        let interval = config.poll_interval;
        let _ = myself.send_interval(interval, || ChainWatcherMessage::Poll);
        Ok(ChainWatcherState {
            config,
            cursor,
            recent,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ChainWatcherMessage::Poll => self.poll(state).await,
        }
        Ok(())
    }
}
