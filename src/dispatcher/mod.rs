//! The event dispatcher: a single actor through which every state change
//! flows. Transport, chain watcher and the transaction gateway feed typed
//! events into its queue; it persists each one to the durable log before
//! applying it, computes channel and transfer transitions, and executes the
//! resulting side effects. One writer, no races on channel state.

mod actor;

use ractor::RpcReplyPort;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chain::events::ContractEvent;
use crate::channel::ChannelState;
use crate::protocol::Message;
use crate::types::{Address, BlockNumber, Secret, U256};

pub use actor::{send_event, DispatcherActor, DispatcherConfig, NodeState};

pub(crate) const ASSUME_DISPATCHER_ALIVE: &str = "dispatcher actor must be alive";

/// Registry name the dispatcher is spawned under; collaborators that start
/// before it resolve the reference lazily.
pub const DISPATCHER_ACTOR_NAME: &str = "dispatcher";

/// How many hops we assume a mediated route may take when no better
/// estimate exists; the first-hop expiration budgets one reveal-timeout
/// margin per hop.
pub const DEFAULT_MAX_HOPS: u64 = 5;

/// Snapshot the full entity set into the store every this many log events,
/// bounding replay work after a restart.
pub const SNAPSHOT_INTERVAL: u64 = 500;

#[derive(Debug)]
pub enum DispatcherMessage {
    Command(DispatcherCommand),
    Event(DispatcherEvent),
}

#[derive(Clone, Debug)]
pub struct SendPaymentCommand {
    pub token: Address,
    pub target: Address,
    pub amount: U256,
    /// Move the transferred amount directly instead of escrowing a lock.
    /// Only possible towards a direct channel partner.
    pub direct: bool,
}

#[derive(Debug)]
pub enum DispatcherCommand {
    SendPayment(SendPaymentCommand, RpcReplyPort<Result<u64, String>>),
    CancelPayment(u64, RpcReplyPort<Result<(), String>>),
    CloseChannel(Address, RpcReplyPort<Result<(), String>>),
    ListChannels(RpcReplyPort<Vec<ChannelState>>),
}

#[derive(Debug)]
pub enum DispatcherEvent {
    /// A verified envelope from the transport bridge.
    PeerMessage { sender: Address, message: Message },
    ChainEvent(ContractEvent),
    BlockMined(BlockNumber),
    /// The gateway exhausted its retry budget; state is unchanged, the
    /// submission may be retried on a later block.
    ChainTxFailed { tx: String, error: String },
}

/// What actually goes into the write-ahead log. Randomness (the payment
/// secret) is drawn at event-creation time and recorded here, so replaying
/// the log is fully deterministic.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LoggedEvent {
    BlockMined(BlockNumber),
    MessageReceived {
        sender: Address,
        message: Message,
    },
    ChainEvent(ContractEvent),
    PaymentInitiated {
        payment_id: u64,
        token: Address,
        target: Address,
        amount: U256,
        secret: Secret,
        direct: bool,
    },
    PaymentCancelled {
        payment_id: u64,
    },
    CloseRequested {
        channel: Address,
    },
}

/// Notifications for outside observers (the REST facade, tests).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeServiceEvent {
    ChannelOpened(Address),
    ChannelClosed(Address),
    ChannelSettled(Address),
    PaymentSucceeded { payment_id: u64 },
    PaymentFailed { payment_id: u64, reason: String },
    PaymentReceived { payment_id: u64, amount: U256 },
    SafeModeEntered { reason: String },
}

pub type ServiceEventSender = mpsc::Sender<NodeServiceEvent>;

/// Outbound seam towards the P2P transport, which is an external
/// collaborator. The dispatcher hands it sealed envelopes only.
#[derive(Debug)]
pub enum TransportCommand {
    SendMessage { recipient: Address, data: Vec<u8> },
}

#[cfg(test)]
pub mod tests;
