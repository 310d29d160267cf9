use std::{sync::Arc, time::Duration};

use ractor::{async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volt::{
    actors::RootActor,
    chain::{ChainTxActor, ChainWatcherActor, ChainWatcherConfig, RpcChainClient},
    dispatcher::{
        DispatcherActor, DispatcherConfig, NodeServiceEvent, TransportCommand,
        DISPATCHER_ACTOR_NAME,
    },
    store::Store,
    tasks::{
        cancel_tasks_and_wait_for_completion, new_tokio_cancellation_token,
        new_tokio_task_tracker,
    },
    Config,
};

/// The P2P transport is an external collaborator; until one is attached,
/// outbound envelopes are dropped here. Unacked messages keep riding the
/// dispatcher's block-tick retries, so nothing is lost by the gap.
struct TransportStubActor;

#[rasync_trait]
impl Actor for TransportStubActor {
    type Msg = TransportCommand;
    type State = ();
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TransportCommand::SendMessage { recipient, data } => {
                debug!(
                    "no transport attached; dropping {} byte envelope for {}",
                    data.len(),
                    recipient
                );
            }
        }
        Ok(())
    }
}

#[tokio::main]
pub async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();

    let store = match Store::new(config.node.store_path()) {
        Ok(store) => store,
        Err(err) => {
            error!("cannot open database {:?}: {}", config.node.store_path(), err);
            std::process::exit(1);
        }
    };
    let key = match config.node.read_or_generate_secret_key() {
        Ok(key) => key,
        Err(err) => {
            error!("cannot read node key: {}", err);
            std::process::exit(1);
        }
    };
    let client = match RpcChainClient::new(&config.chain.rpc_url) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!("cannot reach {}: {}", config.chain.rpc_url, err);
            std::process::exit(1);
        }
    };

    let tracker = new_tokio_task_tracker();
    let token = new_tokio_cancellation_token();
    let root = RootActor::start(tracker, token).await;

    let (event_sender, mut event_receiver) = mpsc::channel::<NodeServiceEvent>(256);
    new_tokio_task_tracker().spawn(async move {
        while let Some(event) = event_receiver.recv().await {
            info!("service event: {:?}", event);
        }
    });

    let (transport, _) = Actor::spawn_linked(
        Some("transport".to_string()),
        TransportStubActor,
        (),
        root.get_cell(),
    )
    .await
    .expect("start transport actor");

    let (chain_tx, _) = Actor::spawn_linked(
        Some("chain gateway".to_string()),
        ChainTxActor::new(client.clone()),
        key.address(),
        root.get_cell(),
    )
    .await
    .expect("start chain gateway actor");

    let (dispatcher, _) = Actor::spawn_linked(
        Some(DISPATCHER_ACTOR_NAME.to_string()),
        DispatcherActor::new(event_sender, chain_tx, transport, store.clone()),
        DispatcherConfig {
            key,
            registry: config
                .chain
                .secret_registry
                .expect("secret registry address is checked at config parse"),
            reveal_timeout: config.node.reveal_timeout(),
            on_chain_margin: config.node.on_chain_margin(),
        },
        root.get_cell(),
    )
    .await
    .expect("start dispatcher actor");

    let _ = Actor::spawn_linked(
        Some("chain watcher".to_string()),
        ChainWatcherActor::new(client, dispatcher, store),
        ChainWatcherConfig {
            confirmation_blocks: config.chain.confirmation_blocks(),
            start_block: config.chain.start_block.unwrap_or(0),
            poll_interval: Duration::from_millis(config.chain.poll_interval_ms()),
        },
        root.get_cell(),
    )
    .await
    .expect("start chain watcher actor");

    info!("volt node running as {}", key.address());

    tokio::signal::ctrl_c().await.expect("listen for ctrl-c");
    info!("shutting down");
    cancel_tasks_and_wait_for_completion().await;
}
