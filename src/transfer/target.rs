use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::Lock;
use crate::types::{Address, BlockNumber, Secret};

use super::{TransferEffect, TransferEnvelope, TransferError, TransferResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetState {
    WaitingTransfer,
    WaitingSecret,
    /// Secret verified and echoed to the previous hop; waiting for its
    /// unlock proof.
    Revealed,
    Completed,
    Expired,
}

/// The receiving end of a payment: ask the initiator for the secret, prove
/// knowledge to the previous hop, collect the unlock.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TargetMachine {
    pub envelope: TransferEnvelope,
    pub state: TargetState,
    pub channel: Address,
    pub previous_hop: Address,
    pub lock: Lock,
    pub secret: Option<Secret>,
    pub reveal_timeout: BlockNumber,
    pub on_chain_margin: BlockNumber,
    secret_registered: bool,
}

impl TargetMachine {
    pub fn new(
        envelope: TransferEnvelope,
        channel: Address,
        previous_hop: Address,
        lock: Lock,
        reveal_timeout: BlockNumber,
        on_chain_margin: BlockNumber,
    ) -> Self {
        TargetMachine {
            envelope,
            state: TargetState::WaitingTransfer,
            channel,
            previous_hop,
            lock,
            secret: None,
            reveal_timeout,
            on_chain_margin,
            secret_registered: false,
        }
    }

    /// The mediated transfer was validated and escrowed on our channel.
    /// Amount and hashlock correctness against the secret can only be
    /// checked once the secret arrives; here we only ask for it.
    pub fn on_transfer(&mut self) -> TransferResult {
        if self.state != TargetState::WaitingTransfer {
            return Err(TransferError::InvalidState(format!(
                "transfer received in state {:?}",
                self.state
            )));
        }
        self.state = TargetState::WaitingSecret;
        Ok(vec![TransferEffect::SendSecretRequest {
            recipient: self.envelope.initiator,
            hashlock: self.envelope.hashlock,
            amount: self.envelope.amount,
        }])
    }

    pub fn on_reveal_secret(&mut self, sender: Address, secret: Secret) -> TransferResult {
        if self.state != TargetState::WaitingSecret {
            return Err(TransferError::InvalidState(format!(
                "secret reveal in state {:?}",
                self.state
            )));
        }
        if sender != self.envelope.initiator {
            return Err(TransferError::UnexpectedSender(sender));
        }
        if secret.hashlock() != self.envelope.hashlock {
            return Err(TransferError::HashlockMismatch);
        }
        if self.lock.amount != self.envelope.amount {
            return Err(TransferError::AmountMismatch {
                expected: self.envelope.amount,
                got: self.lock.amount,
            });
        }
        self.secret = Some(secret);
        self.state = TargetState::Revealed;
        Ok(vec![TransferEffect::SendRevealSecret {
            recipient: self.previous_hop,
            secret,
        }])
    }

    /// The previous hop's unlock proof arrived and was applied.
    pub fn on_unlock(&mut self) -> TransferResult {
        if self.state != TargetState::Revealed {
            return Err(TransferError::InvalidState(format!(
                "unlock in state {:?}",
                self.state
            )));
        }
        self.state = TargetState::Completed;
        Ok(vec![TransferEffect::PaymentReceived {
            payment_id: self.envelope.payment_id,
            amount: self.envelope.amount,
        }])
    }

    pub fn on_block(&mut self, block: BlockNumber) -> Vec<TransferEffect> {
        match self.state {
            TargetState::WaitingTransfer | TargetState::WaitingSecret
                if block + self.reveal_timeout >= self.lock.expiration =>
            {
                debug!(
                    "giving up on payment {} at block {}: no secret before deadline",
                    self.envelope.payment_id, block
                );
                self.state = TargetState::Expired;
                Vec::new()
            }
            // The previous hop is stalling its unlock; claim on-chain while
            // the lock is still alive.
            TargetState::Revealed
                if !self.secret_registered
                    && self.lock.expiration.saturating_sub(block) <= self.on_chain_margin =>
            {
                self.secret_registered = true;
                vec![TransferEffect::RegisterSecretOnChain {
                    secret: self.secret.expect("secret known in Revealed state"),
                }]
            }
            _ => Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TargetState::Completed | TargetState::Expired)
    }
}
