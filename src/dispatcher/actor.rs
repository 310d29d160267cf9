use std::collections::{BTreeMap, BTreeSet};

use ractor::{async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::chain::actor::ChainTxMessage;
use crate::chain::client::ChainTx;
use crate::chain::events::{ContractEvent, ContractEventBody};
use crate::channel::{ChannelError, ChannelState, ChannelStatus, End};
use crate::errors::Error;
use crate::protocol::{
    Ack, DirectTransfer, MediatedTransfer, Message, RefundTransfer, RevealSecret, SecretRequest,
    Unlock,
};
use crate::store::{ChannelStateStore, EventLogStore, SecretStore};
use crate::transfer::{
    InitiatorMachine, MediatorMachine, TargetMachine, TransferEffect, TransferEnvelope,
};
use crate::types::{Address, B256, BlockNumber, Privkey, Secret, U256};

use super::{
    DispatcherCommand, DispatcherEvent, DispatcherMessage, LoggedEvent, NodeServiceEvent,
    SendPaymentCommand, ServiceEventSender, TransportCommand, ASSUME_DISPATCHER_ALIVE,
    DEFAULT_MAX_HOPS, SNAPSHOT_INTERVAL,
};

const NODE_META_ENTITY: &[u8] = b"node";

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub key: Privkey,
    /// The secret registry contract `registerSecret` calls go to.
    pub registry: Address,
    pub reveal_timeout: BlockNumber,
    pub on_chain_margin: BlockNumber,
}

/// Everything the reducer owns. Only the dispatcher actor ever holds a
/// mutable reference; all maps are ordered so that state reached by log
/// replay is identical regardless of the run that produced the log.
pub struct NodeState {
    pub key: Privkey,
    pub address: Address,
    pub registry: Address,
    pub reveal_timeout: BlockNumber,
    pub on_chain_margin: BlockNumber,
    pub block_number: BlockNumber,
    pub channels: BTreeMap<Address, ChannelState>,
    pub initiators: BTreeMap<B256, InitiatorMachine>,
    pub mediators: BTreeMap<B256, MediatorMachine>,
    pub targets: BTreeMap<B256, TargetMachine>,
    pub tokens_by_manager: BTreeMap<Address, Address>,
    pub next_payment_id: u64,
    pub next_message_id: u64,
    pub seen: BTreeSet<(Address, u64)>,
    pub pending_outbound: BTreeMap<(Address, u64), Message>,
    pub safe_mode: Option<String>,
    /// Set while replaying the durable log: transitions run, outbound I/O
    /// and observer notifications do not.
    pub replaying: bool,
}

/// The non-entity remainder of `NodeState`, snapshotted under one key.
#[derive(Serialize, Deserialize)]
struct NodeMeta {
    block_number: BlockNumber,
    tokens_by_manager: BTreeMap<Address, Address>,
    next_payment_id: u64,
    next_message_id: u64,
    seen: BTreeSet<(Address, u64)>,
    pending_outbound: BTreeMap<(Address, u64), Message>,
    safe_mode: Option<String>,
}

impl NodeState {
    fn new(config: &DispatcherConfig) -> Self {
        NodeState {
            key: config.key,
            address: config.key.address(),
            registry: config.registry,
            reveal_timeout: config.reveal_timeout,
            on_chain_margin: config.on_chain_margin,
            block_number: 0,
            channels: BTreeMap::new(),
            initiators: BTreeMap::new(),
            mediators: BTreeMap::new(),
            targets: BTreeMap::new(),
            tokens_by_manager: BTreeMap::new(),
            next_payment_id: 0,
            next_message_id: 0,
            seen: BTreeSet::new(),
            pending_outbound: BTreeMap::new(),
            safe_mode: None,
            replaying: false,
        }
    }

    fn alloc_message_id(&mut self) -> u64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    fn usable_channel(&self, token: Address, partner: Address) -> Option<&ChannelState> {
        self.channels
            .values()
            .find(|ch| ch.token == token && ch.remote.address == partner && ch.is_usable())
    }

    /// Simplest-viable routing over our own channels: a direct channel to
    /// the target if one exists, otherwise any funded channel towards a
    /// peer that is not where the transfer came from. Pathfinding across
    /// the wider network is an external concern.
    fn select_route(
        &self,
        token: Address,
        target: Address,
        amount: U256,
        exclude_channel: Option<Address>,
        exclude_partner: Option<Address>,
    ) -> Option<(Address, Address, u64)> {
        if let Some(ch) = self.usable_channel(token, target) {
            if self.distributable_on(ch) >= amount {
                return Some((ch.channel, ch.remote.address, 1));
            }
        }
        self.channels
            .values()
            .find(|ch| {
                ch.token == token
                    && ch.is_usable()
                    && Some(ch.channel) != exclude_channel
                    && Some(ch.remote.address) != exclude_partner
                    && ch.remote.address != target
                    && self.distributable_on(ch) >= amount
            })
            .map(|ch| (ch.channel, ch.remote.address, DEFAULT_MAX_HOPS))
    }

    fn distributable_on(&self, ch: &ChannelState) -> U256 {
        ch.distributable(End::Local)
    }
}

fn channel_entity(channel: &Address) -> Vec<u8> {
    [b"c".as_slice(), channel.as_slice()].concat()
}

fn machine_entity(role: u8, hashlock: &B256) -> Vec<u8> {
    [&[role][..], hashlock.as_slice()].concat()
}

pub struct DispatcherActor<S> {
    event_sender: ServiceEventSender,
    chain_tx: ActorRef<ChainTxMessage>,
    transport: ActorRef<TransportCommand>,
    store: S,
}

impl<S> DispatcherActor<S>
where
    S: ChannelStateStore + EventLogStore + SecretStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        event_sender: ServiceEventSender,
        chain_tx: ActorRef<ChainTxMessage>,
        transport: ActorRef<TransportCommand>,
        store: S,
    ) -> Self {
        Self {
            event_sender,
            chain_tx,
            transport,
            store,
        }
    }

    // ------------------------------------------------------------------
    // Write-ahead logging, snapshots, replay.
    // ------------------------------------------------------------------

    async fn persist_and_apply(&self, state: &mut NodeState, event: LoggedEvent) {
        let seq = self.store.append_event(&event);
        self.apply_event(state, event).await;
        if seq % SNAPSHOT_INTERVAL == 0 {
            self.snapshot(state, seq);
        }
    }

    fn snapshot(&self, state: &NodeState, seq: u64) {
        let mut entities: Vec<(Vec<u8>, Vec<u8>)> = vec![(
            NODE_META_ENTITY.to_vec(),
            crate::store::serialize_to_vec(
                &NodeMeta {
                    block_number: state.block_number,
                    tokens_by_manager: state.tokens_by_manager.clone(),
                    next_payment_id: state.next_payment_id,
                    next_message_id: state.next_message_id,
                    seen: state.seen.clone(),
                    pending_outbound: state.pending_outbound.clone(),
                    safe_mode: state.safe_mode.clone(),
                },
                "NodeMeta",
            ),
        )];
        for (address, channel) in &state.channels {
            self.store.insert_channel_state(channel);
            entities.push((
                channel_entity(address),
                crate::store::serialize_to_vec(channel, "ChannelState"),
            ));
        }
        for (hashlock, machine) in &state.initiators {
            entities.push((
                machine_entity(b'i', hashlock),
                crate::store::serialize_to_vec(machine, "InitiatorMachine"),
            ));
        }
        for (hashlock, machine) in &state.mediators {
            entities.push((
                machine_entity(b'm', hashlock),
                crate::store::serialize_to_vec(machine, "MediatorMachine"),
            ));
        }
        for (hashlock, machine) in &state.targets {
            entities.push((
                machine_entity(b't', hashlock),
                crate::store::serialize_to_vec(machine, "TargetMachine"),
            ));
        }
        let live: BTreeSet<Vec<u8>> = entities.iter().map(|(key, _)| key.clone()).collect();
        for (stale, _, _) in self
            .store
            .list_snapshots()
            .into_iter()
            .filter(|(key, _, _)| !live.contains(key))
        {
            self.store.delete_snapshot(&stale);
        }
        for (entity, bytes) in entities {
            self.store.put_snapshot(&entity, seq, bytes);
        }
        debug!("snapshotted node state at seq {}", seq);
    }

    /// Startup: latest snapshots plus a replay of everything logged after
    /// them. Replay runs the very same transitions with I/O suppressed, so
    /// the state reached is the one the crashed process held.
    async fn load(&self, config: &DispatcherConfig) -> NodeState {
        let mut state = NodeState::new(config);
        let snapshots = self.store.list_snapshots();
        let replay_from = snapshots.iter().map(|(_, seq, _)| *seq).min().unwrap_or(0);
        for (entity, _, bytes) in snapshots {
            if entity == NODE_META_ENTITY {
                let meta: NodeMeta = crate::store::deserialize_from_slice(&bytes, "NodeMeta");
                state.block_number = meta.block_number;
                state.tokens_by_manager = meta.tokens_by_manager;
                state.next_payment_id = meta.next_payment_id;
                state.next_message_id = meta.next_message_id;
                state.seen = meta.seen;
                state.pending_outbound = meta.pending_outbound;
                state.safe_mode = meta.safe_mode;
                continue;
            }
            let id = &entity[1..];
            match entity[0] {
                b'c' => {
                    let channel: ChannelState =
                        crate::store::deserialize_from_slice(&bytes, "ChannelState");
                    state.channels.insert(Address::from_slice(id), channel);
                }
                b'i' => {
                    let machine: InitiatorMachine =
                        crate::store::deserialize_from_slice(&bytes, "InitiatorMachine");
                    state.initiators.insert(B256::from_slice(id), machine);
                }
                b'm' => {
                    let machine: MediatorMachine =
                        crate::store::deserialize_from_slice(&bytes, "MediatorMachine");
                    state.mediators.insert(B256::from_slice(id), machine);
                }
                b't' => {
                    let machine: TargetMachine =
                        crate::store::deserialize_from_slice(&bytes, "TargetMachine");
                    state.targets.insert(B256::from_slice(id), machine);
                }
                other => panic!("unknown snapshot entity tag {}", other),
            }
        }
        let events = self.store.events_from(replay_from);
        if !events.is_empty() {
            info!(
                "replaying {} logged events from seq {}",
                events.len(),
                replay_from + 1
            );
        }
        state.replaying = true;
        for (_, event) in events {
            self.apply_event(&mut state, event).await;
        }
        state.replaying = false;
        state
    }

    // ------------------------------------------------------------------
    // The reducer proper.
    // ------------------------------------------------------------------

    async fn apply_event(&self, state: &mut NodeState, event: LoggedEvent) {
        match event {
            LoggedEvent::BlockMined(number) => self.on_block(state, number).await,
            LoggedEvent::MessageReceived { sender, message } => {
                self.on_message(state, sender, message).await
            }
            LoggedEvent::ChainEvent(event) => {
                if let Err(err) = self.on_chain_event(state, event).await {
                    match err {
                        Error::Channel(ChannelError::ReorgConflict(reason)) => {
                            self.enter_safe_mode(state, reason).await
                        }
                        err => warn!("chain event not applied: {}", err),
                    }
                }
            }
            LoggedEvent::PaymentInitiated {
                payment_id,
                token,
                target,
                amount,
                secret,
                direct,
            } => {
                self.on_payment_initiated(state, payment_id, token, target, amount, secret, direct)
                    .await
            }
            LoggedEvent::PaymentCancelled { payment_id } => {
                self.on_payment_cancelled(state, payment_id).await
            }
            LoggedEvent::CloseRequested { channel } => {
                self.on_close_requested(state, channel).await
            }
        }
        self.prune_terminal_machines(state);
    }

    async fn on_block(&self, state: &mut NodeState, number: BlockNumber) {
        if number <= state.block_number {
            // Re-emissions after a watcher rewind land here.
            return;
        }
        state.block_number = number;

        let channels: Vec<Address> = state.channels.keys().copied().collect();
        for address in &channels {
            let expired = state
                .channels
                .get_mut(address)
                .expect("channel listed")
                .expire_locks(number);
            for (end, lock) in expired {
                debug!(
                    "lock {:#x} on channel {} ({:?} side) expired at block {}",
                    lock.hashlock, address, end, number
                );
            }
        }

        let hashlocks: Vec<B256> = state.initiators.keys().copied().collect();
        for hashlock in hashlocks {
            let (envelope, effects) = {
                let machine = state.initiators.get_mut(&hashlock).expect("listed");
                (machine.envelope, machine.on_block(number))
            };
            self.execute_transfer_effects(state, envelope, effects)
                .await;
        }
        let hashlocks: Vec<B256> = state.mediators.keys().copied().collect();
        for hashlock in hashlocks {
            let (envelope, effects) = {
                let machine = state.mediators.get_mut(&hashlock).expect("listed");
                (machine.envelope, machine.on_block(number))
            };
            self.execute_transfer_effects(state, envelope, effects)
                .await;
        }
        let hashlocks: Vec<B256> = state.targets.keys().copied().collect();
        for hashlock in hashlocks {
            let (envelope, effects) = {
                let machine = state.targets.get_mut(&hashlock).expect("listed");
                (machine.envelope, machine.on_block(number))
            };
            self.execute_transfer_effects(state, envelope, effects)
                .await;
        }

        for address in &channels {
            let settle = {
                let channel = state.channels.get_mut(address).expect("channel listed");
                if channel.settle_window_over(number) {
                    channel.settle(number).is_ok()
                } else {
                    false
                }
            };
            if settle {
                self.submit_chain_tx(state, ChainTx::Settle { channel: *address })
                    .await;
            }
        }

        // Unacked messages ride every block tick until the peer confirms.
        if !state.replaying {
            let retries: Vec<(Address, Message)> = state
                .pending_outbound
                .iter()
                .map(|((recipient, _), message)| (*recipient, *message))
                .collect();
            for (recipient, message) in retries {
                self.send_sealed(state, recipient, &message).await;
            }
        }
    }

    async fn on_message(&self, state: &mut NodeState, sender: Address, message: Message) {
        if let Message::Ack(ack) = &message {
            state.pending_outbound.remove(&(sender, ack.message_id));
            return;
        }
        let message_id = message.message_id();
        if !state.seen.insert((sender, message_id)) {
            debug!("duplicate message {} from {}", message_id, sender);
            self.send_ack(state, sender, message_id).await;
            return;
        }
        if let Err(err) = self.handle_peer_message(state, sender, &message).await {
            warn!("dropping message {} from {}: {}", message_id, sender, err);
        }
        if message.wants_ack() {
            self.send_ack(state, sender, message_id).await;
        }
    }

    async fn handle_peer_message(
        &self,
        state: &mut NodeState,
        sender: Address,
        message: &Message,
    ) -> Result<(), Error> {
        match message {
            Message::DirectTransfer(transfer) => {
                let received = {
                    let channel = expect_channel_from(state, transfer.proof.channel, sender)?;
                    let before = channel.remote.transferred_amount;
                    channel.apply_direct_transfer(&transfer.proof)?;
                    channel.remote.transferred_amount - before
                };
                self.notify(
                    state,
                    NodeServiceEvent::PaymentReceived {
                        payment_id: transfer.payment_id,
                        amount: received,
                    },
                )
                .await;
                Ok(())
            }
            Message::MediatedTransfer(transfer) => {
                self.on_mediated_transfer(state, sender, transfer).await
            }
            Message::RefundTransfer(refund) => self.on_refund_transfer(state, sender, refund).await,
            Message::SecretRequest(request) => {
                let (envelope, effects) = {
                    let machine = state
                        .initiators
                        .get_mut(&request.hashlock)
                        .ok_or(Error::TransferNotFound(request.hashlock))?;
                    (
                        machine.envelope,
                        machine.on_secret_request(sender, request.hashlock, request.amount)?,
                    )
                };
                self.execute_transfer_effects(state, envelope, effects)
                    .await;
                Ok(())
            }
            Message::RevealSecret(reveal) => {
                self.on_reveal_secret(state, sender, reveal.secret).await
            }
            Message::Unlock(unlock) => self.on_unlock(state, sender, unlock).await,
            Message::Ping(_) => Ok(()),
            Message::Ack(_) => Ok(()),
        }
    }

    async fn on_mediated_transfer(
        &self,
        state: &mut NodeState,
        sender: Address,
        transfer: &MediatedTransfer,
    ) -> Result<(), Error> {
        let hashlock = transfer.lock.hashlock;
        let block = state.block_number;
        let channel_address = {
            let channel = expect_channel_from(state, transfer.proof.channel, sender)?;
            if channel.token != transfer.token {
                return Err(Error::Channel(ChannelError::InvalidTransfer(format!(
                    "transfer names token {} but the channel carries {}",
                    transfer.token, channel.token
                ))));
            }
            channel.apply_mediated_transfer(&transfer.proof, transfer.lock, block)?;
            channel.channel
        };
        let envelope = TransferEnvelope {
            payment_id: transfer.payment_id,
            token: transfer.token,
            amount: transfer.lock.amount,
            hashlock,
            initiator: transfer.initiator,
            target: transfer.target,
        };
        if transfer.target == state.address {
            if state.targets.contains_key(&hashlock) {
                return Err(Error::Transfer(crate::transfer::TransferError::InvalidState(
                    format!("a transfer with hashlock {:#x} is already in flight", hashlock),
                )));
            }
            let mut machine = TargetMachine::new(
                envelope,
                channel_address,
                sender,
                transfer.lock,
                state.reveal_timeout,
                state.on_chain_margin,
            );
            let effects = machine.on_transfer()?;
            state.targets.insert(hashlock, machine);
            self.execute_transfer_effects(state, envelope, effects)
                .await;
        } else {
            if state.mediators.contains_key(&hashlock) {
                return Err(Error::Transfer(crate::transfer::TransferError::InvalidState(
                    format!("already mediating hashlock {:#x}", hashlock),
                )));
            }
            // Safe mode refuses to route new transfers; the machine turns
            // a missing route into a refund towards the payer.
            let route = if state.safe_mode.is_some() {
                None
            } else {
                state
                    .select_route(
                        transfer.token,
                        transfer.target,
                        transfer.lock.amount,
                        Some(channel_address),
                        Some(sender),
                    )
                    .map(|(channel, partner, _)| (channel, partner))
            };
            let mut machine = MediatorMachine::new(
                envelope,
                sender,
                channel_address,
                transfer.lock,
                state.reveal_timeout,
                state.on_chain_margin,
            );
            let effects = machine.on_route(route, block)?;
            state.mediators.insert(hashlock, machine);
            self.execute_transfer_effects(state, envelope, effects)
                .await;
        }
        Ok(())
    }

    async fn on_refund_transfer(
        &self,
        state: &mut NodeState,
        sender: Address,
        refund: &RefundTransfer,
    ) -> Result<(), Error> {
        let block = state.block_number;
        {
            let channel = expect_channel_from(state, refund.proof.channel, sender)?;
            channel.apply_mediated_transfer(&refund.proof, refund.lock, block)?;
        }
        let hashlock = refund.lock.hashlock;
        if let Some(machine) = state.initiators.get_mut(&hashlock) {
            let envelope = machine.envelope;
            let effects = machine.on_refund(sender)?;
            self.execute_transfer_effects(state, envelope, effects)
                .await;
        } else if state.mediators.contains_key(&hashlock) {
            // Downstream gave up; our own incoming lock unwinds through the
            // mediator's safety deadline, nothing more to do here.
            warn!("refund received for mediated hashlock {:#x}", hashlock);
        } else {
            return Err(Error::TransferNotFound(hashlock));
        }
        Ok(())
    }

    async fn on_reveal_secret(
        &self,
        state: &mut NodeState,
        sender: Address,
        secret: Secret,
    ) -> Result<(), Error> {
        let hashlock = secret.hashlock();
        self.store.insert_secret(secret);
        for channel in state.channels.values_mut() {
            channel.register_secret(secret);
        }
        if let Some(machine) = state.targets.get_mut(&hashlock) {
            let envelope = machine.envelope;
            let effects = machine.on_reveal_secret(sender, secret)?;
            self.execute_transfer_effects(state, envelope, effects)
                .await;
            return Ok(());
        }
        if let Some(machine) = state.mediators.get_mut(&hashlock) {
            let envelope = machine.envelope;
            let effects = machine.on_reveal_secret(sender, secret)?;
            self.execute_transfer_effects(state, envelope, effects)
                .await;
            return Ok(());
        }
        if let Some(machine) = state.initiators.get_mut(&hashlock) {
            let envelope = machine.envelope;
            let effects = machine.on_reveal_secret(sender, secret)?;
            self.execute_transfer_effects(state, envelope, effects)
                .await;
            return Ok(());
        }
        Err(Error::TransferNotFound(hashlock))
    }

    async fn on_unlock(
        &self,
        state: &mut NodeState,
        sender: Address,
        unlock: &Unlock,
    ) -> Result<(), Error> {
        let hashlock = unlock.secret.hashlock();
        {
            let channel = expect_channel_from(state, unlock.proof.channel, sender)?;
            channel.apply_unlock(&unlock.proof, unlock.secret)?;
        }
        if let Some(machine) = state.targets.get_mut(&hashlock) {
            let envelope = machine.envelope;
            let effects = machine.on_unlock()?;
            self.execute_transfer_effects(state, envelope, effects)
                .await;
            return Ok(());
        }
        if state.mediators.contains_key(&hashlock) {
            let (envelope, effects) = {
                let machine = state.mediators.get_mut(&hashlock).expect("checked");
                if sender != machine.payer {
                    return Err(Error::PeerMismatch {
                        channel: unlock.proof.channel,
                        sender,
                    });
                }
                (machine.envelope, machine.on_payer_unlock()?)
            };
            self.execute_transfer_effects(state, envelope, effects)
                .await;
            let machine = state.mediators.get_mut(&hashlock).expect("checked");
            if let Err(err) = machine.on_payee_unlocked() {
                warn!("mediator completion for {:#x}: {}", hashlock, err);
            }
            return Ok(());
        }
        // An unlock with no machine still credits the channel (for example
        // after the counterpart machine already reached a terminal state).
        debug!("unlock without transfer machine for {:#x}", hashlock);
        Ok(())
    }

    async fn on_chain_event(
        &self,
        state: &mut NodeState,
        event: ContractEvent,
    ) -> Result<(), Error> {
        let block = event.block_number;
        match event.body {
            ContractEventBody::TokenAdded { token, manager } => {
                debug!("token {} registered with manager {}", token, manager);
                state.tokens_by_manager.insert(manager, token);
                Ok(())
            }
            ContractEventBody::ChannelNew {
                channel,
                participant1,
                participant2,
                settle_timeout,
            } => {
                if participant1 != state.address && participant2 != state.address {
                    return Ok(());
                }
                let partner = if participant1 == state.address {
                    participant2
                } else {
                    participant1
                };
                let token = state
                    .tokens_by_manager
                    .get(&event.contract)
                    .copied()
                    .unwrap_or_else(|| {
                        warn!("channel {} from unknown manager {}", channel, event.contract);
                        Address::ZERO
                    });
                let fresh = !state.channels.contains_key(&channel);
                let reveal_timeout = state.reveal_timeout;
                let address = state.address;
                let entry = state.channels.entry(channel).or_insert_with(|| {
                    ChannelState::new(
                        channel,
                        token,
                        address,
                        partner,
                        settle_timeout,
                        reveal_timeout,
                    )
                });
                entry.on_opened(block).map_err(Error::Channel)?;
                if fresh {
                    info!(
                        "channel {} with {} opened at block {}",
                        channel, partner, block
                    );
                    self.notify(state, NodeServiceEvent::ChannelOpened(channel))
                        .await;
                }
                Ok(())
            }
            ContractEventBody::ChannelNewBalance {
                participant,
                balance,
                ..
            } => {
                let channel = state
                    .channels
                    .get_mut(&event.contract)
                    .ok_or(Error::ChannelNotFound(event.contract))?;
                let end = channel
                    .end_by_address(participant)
                    .ok_or(Error::PeerMismatch {
                        channel: event.contract,
                        sender: participant,
                    })?;
                channel.register_deposit(end, balance).map_err(Error::Channel)
            }
            ContractEventBody::ChannelClosed { closing_address } => {
                let update = {
                    let channel = state
                        .channels
                        .get_mut(&event.contract)
                        .ok_or(Error::ChannelNotFound(event.contract))?;
                    channel
                        .on_closed(block, closing_address)
                        .map_err(Error::Channel)?
                };
                if let Some(proof) = update {
                    self.submit_chain_tx(
                        state,
                        ChainTx::UpdateTransfer {
                            channel: event.contract,
                            proof,
                        },
                    )
                    .await;
                }
                self.notify(state, NodeServiceEvent::ChannelClosed(event.contract))
                    .await;
                Ok(())
            }
            ContractEventBody::ChannelSettled => {
                let channel = state
                    .channels
                    .get_mut(&event.contract)
                    .ok_or(Error::ChannelNotFound(event.contract))?;
                channel.on_settled(block).map_err(Error::Channel)?;
                self.notify(state, NodeServiceEvent::ChannelSettled(event.contract))
                    .await;
                Ok(())
            }
            ContractEventBody::SecretRevealed { secret, .. } => {
                self.store.insert_secret(secret);
                let hashlock = secret.hashlock();
                for channel in state.channels.values_mut() {
                    channel
                        .on_secret_revealed(secret, block)
                        .map_err(Error::Channel)?;
                }
                if state.mediators.contains_key(&hashlock) {
                    let (envelope, effects) = {
                        let machine = state.mediators.get_mut(&hashlock).expect("checked");
                        (machine.envelope, machine.on_secret_revealed_on_chain(secret)?)
                    };
                    self.execute_transfer_effects(state, envelope, effects)
                        .await;
                }
                Ok(())
            }
            ContractEventBody::TransferUpdated { node } => {
                debug!(
                    "counter balance proof submitted by {} on {}",
                    node, event.contract
                );
                Ok(())
            }
            ContractEventBody::AddressRegistered { account, endpoint } => {
                debug!("endpoint registry: {} is at {}", account, endpoint);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_payment_initiated(
        &self,
        state: &mut NodeState,
        payment_id: u64,
        token: Address,
        target: Address,
        amount: U256,
        secret: Secret,
        direct: bool,
    ) {
        state.next_payment_id = state.next_payment_id.max(payment_id);
        if let Some(reason) = &state.safe_mode {
            let reason = format!("node is in safe mode: {}", reason);
            self.notify(state, NodeServiceEvent::PaymentFailed { payment_id, reason })
                .await;
            return;
        }
        self.store.insert_secret(secret);
        if direct {
            let result = match state.usable_channel(token, target).map(|ch| ch.channel) {
                Some(address) => {
                    let key = state.key;
                    let channel = state.channels.get_mut(&address).expect("channel listed");
                    channel.create_direct_transfer(amount, B256::ZERO, &key)
                }
                None => Err(ChannelError::InvalidState(format!(
                    "no open channel with {} for token {}",
                    target, token
                ))),
            };
            match result {
                Ok(proof) => {
                    let message_id = state.alloc_message_id();
                    let message = Message::DirectTransfer(DirectTransfer {
                        message_id,
                        payment_id,
                        token,
                        proof,
                    });
                    self.queue_message(state, target, message).await;
                    self.notify(state, NodeServiceEvent::PaymentSucceeded { payment_id })
                        .await;
                }
                Err(err) => {
                    self.notify(
                        state,
                        NodeServiceEvent::PaymentFailed {
                            payment_id,
                            reason: err.to_string(),
                        },
                    )
                    .await;
                }
            }
            return;
        }

        let hashlock = secret.hashlock();
        let envelope = TransferEnvelope {
            payment_id,
            token,
            amount,
            hashlock,
            initiator: state.address,
            target,
        };
        let route = state.select_route(token, target, amount, None, None);
        let mut machine = InitiatorMachine::new(envelope, secret);
        let effects = match route {
            Some((channel, partner, hops)) => machine.on_route(
                channel,
                partner,
                hops,
                state.block_number,
                state.reveal_timeout,
            ),
            None => machine.on_no_route(),
        };
        state.initiators.insert(hashlock, machine);
        match effects {
            Ok(effects) => {
                self.execute_transfer_effects(state, envelope, effects)
                    .await
            }
            Err(err) => error!("initiating payment {}: {}", payment_id, err),
        }
    }

    async fn on_payment_cancelled(&self, state: &mut NodeState, payment_id: u64) {
        let hashlock = state
            .initiators
            .iter()
            .find(|(_, machine)| machine.envelope.payment_id == payment_id)
            .map(|(hashlock, _)| *hashlock);
        let Some(hashlock) = hashlock else {
            warn!("cancellation for unknown payment {}", payment_id);
            return;
        };
        let (envelope, effects) = {
            let machine = state.initiators.get_mut(&hashlock).expect("listed");
            (machine.envelope, machine.cancel())
        };
        match effects {
            Ok(effects) => {
                self.execute_transfer_effects(state, envelope, effects)
                    .await
            }
            Err(err) => warn!("cancelling payment {}: {}", payment_id, err),
        }
    }

    async fn on_close_requested(&self, state: &mut NodeState, address: Address) {
        let close = {
            let Some(channel) = state.channels.get_mut(&address) else {
                warn!("close requested for unknown channel {}", address);
                return;
            };
            channel.close()
        };
        match close {
            Ok(proof) => {
                self.submit_chain_tx(
                    state,
                    ChainTx::Close {
                        channel: address,
                        proof,
                    },
                )
                .await;
            }
            Err(err) => warn!("closing channel {}: {}", address, err),
        }
    }

    // ------------------------------------------------------------------
    // Effect execution.
    // ------------------------------------------------------------------

    async fn execute_transfer_effects(
        &self,
        state: &mut NodeState,
        envelope: TransferEnvelope,
        effects: Vec<TransferEffect>,
    ) {
        for effect in effects {
            match effect {
                TransferEffect::SendMediatedTransfer { channel, lock } => {
                    let key = state.key;
                    let block = state.block_number;
                    let outcome = state.channels.get_mut(&channel).map(|ch| {
                        (
                            ch.remote.address,
                            ch.create_mediated_transfer(lock, block, B256::ZERO, &key),
                        )
                    });
                    match outcome {
                        Some((partner, Ok(proof))) => {
                            let message_id = state.alloc_message_id();
                            let message = Message::MediatedTransfer(MediatedTransfer {
                                message_id,
                                payment_id: envelope.payment_id,
                                token: envelope.token,
                                initiator: envelope.initiator,
                                target: envelope.target,
                                lock,
                                proof,
                            });
                            self.queue_message(state, partner, message).await;
                        }
                        Some((_, Err(err))) => {
                            error!("escrowing lock on {}: {}", channel, err)
                        }
                        None => error!("mediated transfer on unknown channel {}", channel),
                    }
                }
                TransferEffect::SendRefundTransfer { channel, lock } => {
                    let key = state.key;
                    let block = state.block_number;
                    let outcome = state.channels.get_mut(&channel).map(|ch| {
                        (
                            ch.remote.address,
                            ch.create_mediated_transfer(lock, block, B256::ZERO, &key),
                        )
                    });
                    match outcome {
                        Some((partner, Ok(proof))) => {
                            let message_id = state.alloc_message_id();
                            let message = Message::RefundTransfer(RefundTransfer {
                                message_id,
                                payment_id: envelope.payment_id,
                                token: envelope.token,
                                initiator: envelope.initiator,
                                target: envelope.target,
                                lock,
                                proof,
                            });
                            self.queue_message(state, partner, message).await;
                        }
                        Some((_, Err(err))) => error!("escrowing refund on {}: {}", channel, err),
                        None => error!("refund on unknown channel {}", channel),
                    }
                }
                TransferEffect::SendSecretRequest {
                    recipient,
                    hashlock,
                    amount,
                } => {
                    let message_id = state.alloc_message_id();
                    let message = Message::SecretRequest(SecretRequest {
                        message_id,
                        payment_id: envelope.payment_id,
                        hashlock,
                        amount,
                    });
                    self.queue_message(state, recipient, message).await;
                }
                TransferEffect::SendRevealSecret { recipient, secret } => {
                    let message_id = state.alloc_message_id();
                    let message = Message::RevealSecret(RevealSecret { message_id, secret });
                    self.queue_message(state, recipient, message).await;
                }
                TransferEffect::SendUnlock { channel, secret } => {
                    let key = state.key;
                    let outcome = state
                        .channels
                        .get_mut(&channel)
                        .map(|ch| (ch.remote.address, ch.create_unlock(secret, B256::ZERO, &key)));
                    match outcome {
                        Some((partner, Ok((proof, _)))) => {
                            let message_id = state.alloc_message_id();
                            let message = Message::Unlock(Unlock {
                                message_id,
                                payment_id: envelope.payment_id,
                                secret,
                                proof,
                            });
                            self.queue_message(state, partner, message).await;
                        }
                        Some((_, Err(err))) => error!("unlocking on {}: {}", channel, err),
                        None => error!("unlock on unknown channel {}", channel),
                    }
                }
                TransferEffect::RegisterSecretOnChain { secret } => {
                    let registry = state.registry;
                    self.submit_chain_tx(state, ChainTx::RegisterSecret { registry, secret })
                        .await;
                }
                TransferEffect::PaymentSucceeded { payment_id } => {
                    self.notify(state, NodeServiceEvent::PaymentSucceeded { payment_id })
                        .await;
                }
                TransferEffect::PaymentReceived { payment_id, amount } => {
                    self.notify(
                        state,
                        NodeServiceEvent::PaymentReceived { payment_id, amount },
                    )
                    .await;
                }
                TransferEffect::PaymentFailed { payment_id, reason } => {
                    self.notify(state, NodeServiceEvent::PaymentFailed { payment_id, reason })
                        .await;
                }
            }
        }
    }

    fn prune_terminal_machines(&self, state: &mut NodeState) {
        state.initiators.retain(|_, machine| !machine.is_terminal());
        state.mediators.retain(|_, machine| !machine.is_terminal());
        state.targets.retain(|_, machine| !machine.is_terminal());
    }

    async fn queue_message(&self, state: &mut NodeState, recipient: Address, message: Message) {
        if message.wants_ack() {
            state
                .pending_outbound
                .insert((recipient, message.message_id()), message);
        }
        self.send_sealed(state, recipient, &message).await;
    }

    async fn send_ack(&self, state: &NodeState, recipient: Address, message_id: u64) {
        self.send_sealed(state, recipient, &Message::Ack(Ack { message_id }))
            .await;
    }

    async fn send_sealed(&self, state: &NodeState, recipient: Address, message: &Message) {
        if state.replaying {
            return;
        }
        let data = message.seal(&state.key);
        if let Err(err) = self
            .transport
            .send_message(TransportCommand::SendMessage { recipient, data })
        {
            // Best effort; unacked messages are retried on block ticks.
            debug!("transport send to {} failed: {}", recipient, err);
        }
    }

    async fn submit_chain_tx(&self, state: &NodeState, tx: ChainTx) {
        if state.replaying {
            return;
        }
        self.chain_tx
            .send_message(ChainTxMessage::Submit(tx))
            .expect("chain gateway actor must be alive");
    }

    async fn notify(&self, state: &NodeState, event: NodeServiceEvent) {
        if state.replaying {
            return;
        }
        let _ = self.event_sender.send(event).await;
    }

    async fn enter_safe_mode(&self, state: &mut NodeState, reason: String) {
        if state.safe_mode.is_some() {
            return;
        }
        error!(
            "entering safe mode, refusing to route new transfers: {}",
            reason
        );
        state.safe_mode = Some(reason.clone());
        self.notify(state, NodeServiceEvent::SafeModeEntered { reason })
            .await;
    }
}

fn expect_channel_from<'a>(
    state: &'a mut NodeState,
    channel: Address,
    sender: Address,
) -> Result<&'a mut ChannelState, Error> {
    let ch = state
        .channels
        .get_mut(&channel)
        .ok_or(Error::ChannelNotFound(channel))?;
    if ch.remote.address != sender {
        return Err(Error::PeerMismatch { channel, sender });
    }
    Ok(ch)
}

#[rasync_trait]
impl<S> Actor for DispatcherActor<S>
where
    S: ChannelStateStore + EventLogStore + SecretStore + Clone + Send + Sync + 'static,
{
    type Msg = DispatcherMessage;
    type State = NodeState;
    type Arguments = DispatcherConfig;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        config: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let state = self.load(&config).await;
        info!(
            "dispatcher started for {} at block {}, {} channels, log seq {}",
            state.address,
            state.block_number,
            state.channels.len(),
            self.store.last_seq()
        );
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Event(event) => match event {
                DispatcherEvent::BlockMined(number) => {
                    self.persist_and_apply(state, LoggedEvent::BlockMined(number))
                        .await;
                }
                DispatcherEvent::PeerMessage { sender, message } => {
                    self.persist_and_apply(state, LoggedEvent::MessageReceived { sender, message })
                        .await;
                }
                DispatcherEvent::ChainEvent(event) => {
                    self.persist_and_apply(state, LoggedEvent::ChainEvent(event))
                        .await;
                }
                DispatcherEvent::ChainTxFailed { tx, error } => {
                    // Transient unknown: the submission may be retried by a
                    // later transition, local state is untouched.
                    warn!("chain submission {} failed: {}", tx, error);
                }
            },
            DispatcherMessage::Command(command) => match command {
                DispatcherCommand::SendPayment(payment, reply) => {
                    let SendPaymentCommand {
                        token,
                        target,
                        amount,
                        direct,
                    } = payment;
                    if amount.is_zero() {
                        let _ = reply.send(Err("amount must be positive".to_string()));
                        return Ok(());
                    }
                    if target == state.address {
                        let _ = reply.send(Err("refusing to pay ourselves".to_string()));
                        return Ok(());
                    }
                    let payment_id = state.next_payment_id + 1;
                    self.persist_and_apply(
                        state,
                        LoggedEvent::PaymentInitiated {
                            payment_id,
                            token,
                            target,
                            amount,
                            secret: Secret::generate(),
                            direct,
                        },
                    )
                    .await;
                    let _ = reply.send(Ok(payment_id));
                }
                DispatcherCommand::CancelPayment(payment_id, reply) => {
                    let cancellable = state.initiators.values().any(|machine| {
                        machine.envelope.payment_id == payment_id
                            && machine.state
                                <= crate::transfer::InitiatorState::WaitingSecretRequest
                    });
                    if !cancellable {
                        let _ = reply.send(Err(format!(
                            "payment {} is unknown or already committed",
                            payment_id
                        )));
                        return Ok(());
                    }
                    self.persist_and_apply(state, LoggedEvent::PaymentCancelled { payment_id })
                        .await;
                    let _ = reply.send(Ok(()));
                }
                DispatcherCommand::CloseChannel(channel, reply) => {
                    let closable = state
                        .channels
                        .get(&channel)
                        .map(|ch| {
                            matches!(ch.status, ChannelStatus::Opened | ChannelStatus::Closing)
                        })
                        .unwrap_or(false);
                    if !closable {
                        let _ = reply.send(Err(format!("channel {} cannot be closed", channel)));
                        return Ok(());
                    }
                    self.persist_and_apply(state, LoggedEvent::CloseRequested { channel })
                        .await;
                    let _ = reply.send(Ok(()));
                }
                DispatcherCommand::ListChannels(reply) => {
                    let _ = reply.send(state.channels.values().cloned().collect());
                }
            },
        }
        Ok(())
    }
}

/// Convenience used by collaborator actors when handing events in.
pub fn send_event(dispatcher: &ActorRef<DispatcherMessage>, event: DispatcherEvent) {
    dispatcher
        .send_message(DispatcherMessage::Event(event))
        .expect(ASSUME_DISPATCHER_ALIVE);
}
