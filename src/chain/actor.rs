use std::sync::Arc;

use ractor::{
    async_trait as rasync_trait,
    concurrency::{sleep, Duration},
    Actor, ActorProcessingErr, ActorRef,
};
use tracing::{info, warn};

use crate::dispatcher::{send_event, DispatcherEvent, DispatcherMessage, DISPATCHER_ACTOR_NAME};
use crate::types::Address;

use super::client::{ChainClient, ChainError, ChainTx};

const RETRY_BUDGET: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// The serialising gateway for on-chain submissions. All transactions flow
/// through this one actor, which owns the account's transaction nonce;
/// nonce-too-low answers trigger a resync and a retry. Only after the retry
/// budget is exhausted does the dispatcher hear about the failure, as a
/// single summarised event.
pub struct ChainTxActor<C> {
    client: Arc<C>,
}

#[derive(Debug)]
pub enum ChainTxMessage {
    Submit(ChainTx),
}

pub struct ChainTxState {
    account: Address,
    nonce: u64,
}

impl<C: ChainClient> ChainTxActor<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    async fn submit(&self, state: &mut ChainTxState, tx: ChainTx) {
        let mut last_error = None;
        for attempt in 0..RETRY_BUDGET {
            match self.client.submit(&tx, state.account, state.nonce).await {
                Ok(hash) => {
                    info!("submitted {} as {:#x} with nonce {}", tx, hash, state.nonce);
                    state.nonce += 1;
                    return;
                }
                Err(ChainError::NonceTooLow) => {
                    match self.client.account_nonce(state.account).await {
                        Ok(nonce) => {
                            warn!("nonce resynced from {} to {}", state.nonce, nonce);
                            state.nonce = nonce;
                        }
                        Err(err) => last_error = Some(err),
                    }
                }
                Err(err) => {
                    warn!("submitting {} (attempt {}): {}", tx, attempt + 1, err);
                    last_error = Some(err);
                    sleep(RETRY_BACKOFF * (attempt as u32 + 1)).await;
                }
            }
        }
        let error = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "nonce resync kept failing".to_string());
        // The dispatcher is looked up by name: the gateway starts before it
        // and must not hold a reference it cannot have yet.
        if let Some(cell) = ractor::registry::where_is(DISPATCHER_ACTOR_NAME.to_string()) {
            let dispatcher: ActorRef<DispatcherMessage> = cell.into();
            send_event(
                &dispatcher,
                DispatcherEvent::ChainTxFailed {
                    tx: tx.to_string(),
                    error,
                },
            );
        } else {
            warn!("submission of {} failed with no dispatcher to notify: {}", tx, error);
        }
    }
}

#[rasync_trait]
impl<C: ChainClient> Actor for ChainTxActor<C> {
    type Msg = ChainTxMessage;
    type State = ChainTxState;
    type Arguments = Address;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        account: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let nonce = self.client.account_nonce(account).await?;
        info!("chain gateway ready for {} at nonce {}", account, nonce);
        Ok(ChainTxState { account, nonce })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ChainTxMessage::Submit(tx) => self.submit(state, tx).await,
        }
        Ok(())
    }
}
