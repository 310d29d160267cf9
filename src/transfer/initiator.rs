use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::Lock;
use crate::types::{Address, B256, BlockNumber, Secret, U256};

use super::{TransferEffect, TransferEnvelope, TransferError, TransferResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InitiatorState {
    WaitingRoute,
    WaitingSecretRequest,
    /// The secret went to the target; now waiting for the first hop to
    /// prove it learned it so we can unlock. Past this point the transfer
    /// is committed and can no longer be cancelled.
    WaitingSecretReveal,
    Completed,
    Expired,
}

/// Drives one payment we originate: pick the secret, lock funds towards the
/// first hop, hand the secret to the target, settle with the first hop.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InitiatorMachine {
    pub envelope: TransferEnvelope,
    pub secret: Secret,
    pub state: InitiatorState,
    pub expiration: BlockNumber,
    pub channel: Address,
    pub first_hop: Address,
}

impl InitiatorMachine {
    /// The secret is drawn by the caller at event-creation time and already
    /// sits in the durable log by the time the machine exists.
    pub fn new(envelope: TransferEnvelope, secret: Secret) -> Self {
        InitiatorMachine {
            envelope,
            secret,
            state: InitiatorState::WaitingRoute,
            expiration: 0,
            channel: Address::ZERO,
            first_hop: Address::ZERO,
        }
    }

    /// A route was found. The first-hop expiration budgets one
    /// reveal-timeout margin per hop, plus one more so the target still has
    /// a full reveal window of its own.
    pub fn on_route(
        &mut self,
        channel: Address,
        first_hop: Address,
        route_length: u64,
        current_block: BlockNumber,
        reveal_timeout_margin: BlockNumber,
    ) -> TransferResult {
        if self.state != InitiatorState::WaitingRoute {
            return Err(TransferError::InvalidState(format!(
                "route offered in state {:?}",
                self.state
            )));
        }
        self.channel = channel;
        self.first_hop = first_hop;
        self.expiration = current_block + (route_length + 1) * reveal_timeout_margin;
        self.state = InitiatorState::WaitingSecretRequest;
        Ok(vec![TransferEffect::SendMediatedTransfer {
            channel,
            lock: Lock {
                amount: self.envelope.amount,
                expiration: self.expiration,
                hashlock: self.envelope.hashlock,
            },
        }])
    }

    pub fn on_no_route(&mut self) -> TransferResult {
        self.state = InitiatorState::Expired;
        Ok(vec![TransferEffect::PaymentFailed {
            payment_id: self.envelope.payment_id,
            reason: format!("no usable route towards {}", self.envelope.target),
        }])
    }

    /// The target confirms it holds the lock and asks for the secret. The
    /// reveal goes directly to the target, off the payment path.
    pub fn on_secret_request(
        &mut self,
        sender: Address,
        hashlock: B256,
        amount: U256,
    ) -> TransferResult {
        if self.state != InitiatorState::WaitingSecretRequest {
            return Err(TransferError::InvalidState(format!(
                "secret request in state {:?}",
                self.state
            )));
        }
        if sender != self.envelope.target {
            return Err(TransferError::UnexpectedSender(sender));
        }
        if hashlock != self.envelope.hashlock {
            return Err(TransferError::HashlockMismatch);
        }
        if amount != self.envelope.amount {
            return Err(TransferError::AmountMismatch {
                expected: self.envelope.amount,
                got: amount,
            });
        }
        self.state = InitiatorState::WaitingSecretReveal;
        Ok(vec![TransferEffect::SendRevealSecret {
            recipient: self.envelope.target,
            secret: self.secret,
        }])
    }

    /// The first hop echoes the secret back: it learned it through the
    /// route and wants its unlock. Paying it completes the transfer.
    pub fn on_reveal_secret(&mut self, sender: Address, secret: Secret) -> TransferResult {
        if self.state != InitiatorState::WaitingSecretReveal {
            return Err(TransferError::InvalidState(format!(
                "secret reveal in state {:?}",
                self.state
            )));
        }
        if sender != self.first_hop {
            return Err(TransferError::UnexpectedSender(sender));
        }
        if secret.hashlock() != self.envelope.hashlock {
            return Err(TransferError::HashlockMismatch);
        }
        self.state = InitiatorState::Completed;
        Ok(vec![
            TransferEffect::SendUnlock {
                channel: self.channel,
                secret: self.secret,
            },
            TransferEffect::PaymentSucceeded {
                payment_id: self.envelope.payment_id,
            },
        ])
    }

    /// Deadlines are carried by block ticks; the lock itself is returned by
    /// the channel's expiry sweep, the machine only reports the failure.
    pub fn on_block(&mut self, block: BlockNumber) -> Vec<TransferEffect> {
        if self.is_terminal() || self.state == InitiatorState::WaitingRoute {
            return Vec::new();
        }
        if block >= self.expiration {
            debug!(
                "payment {} expired at block {}",
                self.envelope.payment_id, block
            );
            self.state = InitiatorState::Expired;
            return vec![TransferEffect::PaymentFailed {
                payment_id: self.envelope.payment_id,
                reason: format!("transfer expired at block {}", block),
            }];
        }
        Vec::new()
    }

    /// The first hop bounced the transfer back. The escrowed lock comes
    /// home on its own at expiry; the payment itself is over.
    pub fn on_refund(&mut self, sender: Address) -> TransferResult {
        if self.state != InitiatorState::WaitingSecretRequest {
            return Err(TransferError::InvalidState(format!(
                "refund in state {:?}",
                self.state
            )));
        }
        if sender != self.first_hop {
            return Err(TransferError::UnexpectedSender(sender));
        }
        self.state = InitiatorState::Expired;
        Ok(vec![TransferEffect::PaymentFailed {
            payment_id: self.envelope.payment_id,
            reason: "transfer was refunded by the first hop".to_string(),
        }])
    }

    /// User cancellation is only honoured before the secret leaves us.
    pub fn cancel(&mut self) -> TransferResult {
        if self.state > InitiatorState::WaitingSecretRequest {
            return Err(TransferError::InvalidState(
                "the secret was already revealed; the transfer is committed".to_string(),
            ));
        }
        self.state = InitiatorState::Expired;
        Ok(vec![TransferEffect::PaymentFailed {
            payment_id: self.envelope.payment_id,
            reason: "cancelled by user".to_string(),
        }])
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            InitiatorState::Completed | InitiatorState::Expired
        )
    }
}
