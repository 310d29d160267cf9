//! Transfer state machines.
//!
//! One machine instance per transfer per role, owned by the dispatcher and
//! keyed by hashlock. Transitions are synchronous and deterministic: they
//! inspect the event, mutate the machine, and return side-effect descriptors
//! for the dispatcher to execute. No transition performs I/O or reads the
//! clock; block numbers arrive as events.

pub mod initiator;
pub mod mediator;
pub mod target;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::Lock;
use crate::types::{Address, B256, Secret, U256};

pub use initiator::{InitiatorMachine, InitiatorState};
pub use mediator::{MediatorMachine, MediatorState};
pub use target::{TargetMachine, TargetState};

#[cfg(test)]
pub mod tests;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum TransferError {
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Message from unexpected sender {0}")]
    UnexpectedSender(Address),
    #[error("Secret does not match the transfer's hashlock")]
    HashlockMismatch,
    #[error("Amount mismatch: expected {expected}, got {got}")]
    AmountMismatch { expected: U256, got: U256 },
}

pub type TransferResult<T = Vec<TransferEffect>> = Result<T, TransferError>;

/// What every machine knows about the end-to-end payment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    pub payment_id: u64,
    pub token: Address,
    pub amount: U256,
    pub hashlock: B256,
    pub initiator: Address,
    pub target: Address,
}

/// Side-effect descriptors produced by transitions. The dispatcher turns
/// these into channel mutations, outbound messages and chain submissions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferEffect {
    /// Escrow a new lock on `channel` and send the mediated transfer to its
    /// partner.
    SendMediatedTransfer { channel: Address, lock: Lock },
    /// Send the same lock back towards the payer on `channel`, refund
    /// direction.
    SendRefundTransfer { channel: Address, lock: Lock },
    SendSecretRequest {
        recipient: Address,
        hashlock: B256,
        amount: U256,
    },
    SendRevealSecret { recipient: Address, secret: Secret },
    /// Settle our pending lock on `channel` with an unlock proof.
    SendUnlock { channel: Address, secret: Secret },
    /// Commit the secret to the settlement contract before the incoming
    /// lock expires.
    RegisterSecretOnChain { secret: Secret },
    PaymentSucceeded { payment_id: u64 },
    PaymentReceived { payment_id: u64, amount: U256 },
    PaymentFailed { payment_id: u64, reason: String },
}
