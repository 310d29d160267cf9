use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ractor::{async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef};
use tempfile::TempDir;

use crate::chain::client::{BlockRef, ChainClient, ChainError, ChainTx, RawLog};
use crate::chain::events::{topic_of, ContractEventKind};
use crate::chain::watcher::{ChainWatcherActor, ChainWatcherConfig, ChainWatcherMessage};
use crate::dispatcher::{DispatcherEvent, DispatcherMessage};
use crate::store::{ChainCursorStore, Store};
use crate::types::{keccak256, Address, B256, BlockNumber, U256};

struct MockChainInner {
    blocks: Vec<BlockRef>,
    logs: HashMap<BlockNumber, Vec<RawLog>>,
}

/// A scriptable settlement layer: a hash-linked chain of block refs that a
/// test can extend or rewrite to fake a reorg.
struct MockChain {
    inner: Mutex<MockChainInner>,
}

fn block_hash(number: BlockNumber, branch: u8) -> B256 {
    keccak256([branch, number as u8])
}

impl MockChain {
    fn new() -> Self {
        MockChain {
            inner: Mutex::new(MockChainInner {
                blocks: vec![BlockRef {
                    number: 0,
                    hash: block_hash(0, 0),
                    parent_hash: B256::ZERO,
                }],
                logs: HashMap::new(),
            }),
        }
    }

    fn extend_to(&self, tip: BlockNumber, branch: u8) {
        let mut inner = self.inner.lock().unwrap();
        let mut parent = inner.blocks.last().expect("genesis").hash;
        for number in inner.blocks.len() as u64..=tip {
            let block = BlockRef {
                number,
                hash: block_hash(number, branch),
                parent_hash: parent,
            };
            parent = block.hash;
            inner.blocks.push(block);
        }
    }

    /// Replaces everything from `fork` on with a different branch.
    fn reorg(&self, fork: BlockNumber, tip: BlockNumber, branch: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.truncate(fork as usize);
        let mut parent = inner.blocks.last().expect("fork ancestor").hash;
        for number in fork..=tip {
            let block = BlockRef {
                number,
                hash: block_hash(number, branch),
                parent_hash: parent,
            };
            parent = block.hash;
            inner.blocks.push(block);
        }
    }

    fn add_channel_new_log(&self, number: BlockNumber) {
        let mut data = Vec::new();
        for filler in [0x01u8, 0x02, 0x03] {
            let mut slot = [0u8; 32];
            slot[12..].copy_from_slice(Address::repeat_byte(filler).as_slice());
            data.extend_from_slice(&slot);
        }
        data.extend_from_slice(&B256::from(U256::from(40u64)).0);
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.blocks[number as usize].hash;
        inner.logs.entry(number).or_default().push(RawLog {
            address: Address::repeat_byte(0xef),
            topics: vec![topic_of(ContractEventKind::ChannelNew)],
            data,
            block_number: number,
            block_hash: hash,
            tx_hash: keccak256([number as u8]),
            log_index: 0,
        });
    }
}

#[rasync_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<BlockNumber, ChainError> {
        Ok(self.inner.lock().unwrap().blocks.last().expect("genesis").number)
    }

    async fn block_ref(&self, number: BlockNumber) -> Result<Option<BlockRef>, ChainError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blocks
            .get(number as usize)
            .copied())
    }

    async fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<RawLog>, ChainError> {
        let inner = self.inner.lock().unwrap();
        Ok((from..=to)
            .flat_map(|number| inner.logs.get(&number).cloned().unwrap_or_default())
            .collect())
    }

    async fn account_nonce(&self, _account: Address) -> Result<u64, ChainError> {
        Ok(0)
    }

    async fn submit(
        &self,
        _tx: &ChainTx,
        _from: Address,
        _nonce: u64,
    ) -> Result<B256, ChainError> {
        Ok(B256::ZERO)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Recorded {
    Block(BlockNumber),
    Event(BlockNumber, crate::chain::events::ContractEventKind),
}

struct RecorderActor {
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

#[rasync_trait]
impl Actor for RecorderActor {
    type Msg = DispatcherMessage;
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
        if let DispatcherMessage::Event(event) = message {
            match event {
                DispatcherEvent::BlockMined(number) => {
                    self.recorded.lock().unwrap().push(Recorded::Block(number))
                }
                DispatcherEvent::ChainEvent(event) => self
                    .recorded
                    .lock()
                    .unwrap()
                    .push(Recorded::Event(event.block_number, event.body.kind())),
                _ => {}
            }
        }
        Ok(())
    }
}

struct WatcherHarness {
    chain: Arc<MockChain>,
    watcher: ActorRef<ChainWatcherMessage>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    store: Store,
    _dir: TempDir,
}

async fn start_watcher(chain: Arc<MockChain>, store: Store, dir: TempDir) -> WatcherHarness {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let (dispatcher, _) = Actor::spawn(
        None,
        RecorderActor {
            recorded: recorded.clone(),
        },
        (),
    )
    .await
    .unwrap();
    let (watcher, _) = Actor::spawn(
        None,
        ChainWatcherActor::new(chain.clone(), dispatcher, store.clone()),
        ChainWatcherConfig {
            confirmation_blocks: 2,
            start_block: 0,
            // Polls are driven by the tests, the interval only has to stay
            // out of the way.
            poll_interval: Duration::from_secs(3600),
        },
    )
    .await
    .unwrap();
    WatcherHarness {
        chain,
        watcher,
        recorded,
        store,
        _dir: dir,
    }
}

async fn harness() -> WatcherHarness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("log.db")).unwrap();
    start_watcher(Arc::new(MockChain::new()), store, dir).await
}

impl WatcherHarness {
    async fn poll(&self) {
        self.watcher.send_message(ChainWatcherMessage::Poll).unwrap();
        // One extra round trip so the recorder has drained too.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.recorded.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_watcher_emits_blocks_before_their_events() {
    let h = harness().await;
    h.chain.extend_to(10, 0);
    h.chain.add_channel_new_log(3);
    h.poll().await;

    let recorded = h.recorded();
    // Confirmation depth 2 holds blocks 9 and 10 back.
    assert_eq!(recorded.len(), 9);
    assert_eq!(recorded[0], Recorded::Block(1));
    assert_eq!(recorded[2], Recorded::Block(3));
    assert_eq!(
        recorded[3],
        Recorded::Event(3, ContractEventKind::ChannelNew)
    );
    assert_eq!(recorded.last(), Some(&Recorded::Block(8)));
    assert_eq!(h.store.get_chain_cursor().map(|(n, _)| n), Some(8));
}

#[tokio::test]
async fn test_watcher_waits_for_confirmations() {
    let h = harness().await;
    h.chain.extend_to(2, 0);
    h.poll().await;
    assert!(h.recorded().is_empty());
    h.chain.extend_to(4, 0);
    h.poll().await;
    assert_eq!(
        h.recorded(),
        vec![Recorded::Block(1), Recorded::Block(2)]
    );
}

#[tokio::test]
async fn test_watcher_rewinds_across_deep_reorg_and_reemits() {
    let h = harness().await;
    h.chain.extend_to(10, 0);
    h.poll().await;
    assert_eq!(h.store.get_chain_cursor().map(|(n, _)| n), Some(8));

    // Blocks 7 and up are replaced by a competing branch that then grows
    // past the confirmation depth.
    h.chain.reorg(7, 12, 1);
    h.chain.add_channel_new_log(7);
    // The same poll rewinds to the fork point and re-emits from there.
    h.poll().await;

    let recorded = h.recorded();
    let rewound: Vec<&Recorded> = recorded.iter().skip(8).collect();
    assert_eq!(rewound[0], &Recorded::Block(7));
    assert_eq!(
        rewound[1],
        &Recorded::Event(7, ContractEventKind::ChannelNew)
    );
    assert_eq!(recorded.last(), Some(&Recorded::Block(10)));
    assert_eq!(h.store.get_chain_cursor().map(|(n, _)| n), Some(10));
}

#[tokio::test]
async fn test_watcher_resumes_from_persisted_cursor() {
    let h = harness().await;
    h.chain.extend_to(10, 0);
    h.poll().await;
    assert_eq!(h.store.get_chain_cursor().map(|(n, _)| n), Some(8));
    let chain = h.chain.clone();
    let store = h.store.clone();
    h.watcher.stop_and_wait(None, None).await.unwrap();
    let WatcherHarness { _dir, .. } = h;

    let h2 = start_watcher(chain, store, _dir).await;
    h2.chain.extend_to(14, 0);
    h2.poll().await;
    // Nothing before the persisted cursor is emitted again.
    assert_eq!(
        h2.recorded(),
        vec![
            Recorded::Block(9),
            Recorded::Block(10),
            Recorded::Block(11),
            Recorded::Block(12)
        ]
    );
}
