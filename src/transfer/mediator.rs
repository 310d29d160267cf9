use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::Lock;
use crate::types::{Address, BlockNumber, Secret};

use super::{TransferEffect, TransferEnvelope, TransferError, TransferResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediatorState {
    /// Incoming lock accepted, no outgoing route chosen yet.
    Pending,
    /// The outgoing lock is escrowed towards the payee.
    PayeeLocked,
    /// The payee proved knowledge of the secret; we revealed to the payer
    /// and are waiting for the payer's unlock.
    SecretKnown,
    /// The payer settled our incoming lock; our own unlock to the payee is
    /// on its way out.
    PayerUnlocked,
    Completed,
    Expired,
    Refunded,
}

/// Forwards a transfer between the two channels this node holds with payer
/// and payee. The one invariant everything here serves: the outgoing lock
/// must expire at least `reveal_timeout` blocks before the incoming one, so
/// a secret learned late can still be registered on-chain against the payer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MediatorMachine {
    pub envelope: TransferEnvelope,
    pub state: MediatorState,
    pub payer: Address,
    pub payer_channel: Address,
    pub incoming_lock: Lock,
    pub payee: Address,
    pub payee_channel: Address,
    pub outgoing_lock: Option<Lock>,
    pub secret: Option<Secret>,
    pub reveal_timeout: BlockNumber,
    pub on_chain_margin: BlockNumber,
    secret_registered: bool,
}

impl MediatorMachine {
    pub fn new(
        envelope: TransferEnvelope,
        payer: Address,
        payer_channel: Address,
        incoming_lock: Lock,
        reveal_timeout: BlockNumber,
        on_chain_margin: BlockNumber,
    ) -> Self {
        MediatorMachine {
            envelope,
            state: MediatorState::Pending,
            payer,
            payer_channel,
            incoming_lock,
            payee: Address::ZERO,
            payee_channel: Address::ZERO,
            outgoing_lock: None,
            secret: None,
            reveal_timeout,
            on_chain_margin,
            secret_registered: false,
        }
    }

    /// Route decision. `route` is the channel towards the next hop, or None
    /// when no channel can carry the amount with enough expiration margin,
    /// in which case the transfer bounces back as a refund: a distinct lock
    /// in the opposite direction, same hashlock, strictly shorter expiration.
    pub fn on_route(
        &mut self,
        route: Option<(Address, Address)>,
        current_block: BlockNumber,
    ) -> TransferResult {
        if self.state != MediatorState::Pending {
            return Err(TransferError::InvalidState(format!(
                "route offered in state {:?}",
                self.state
            )));
        }
        let outgoing_expiration = self.incoming_lock.expiration - self.reveal_timeout;
        let lock = Lock {
            amount: self.envelope.amount,
            expiration: outgoing_expiration,
            hashlock: self.envelope.hashlock,
        };
        match route {
            Some((channel, payee)) if outgoing_expiration > current_block + self.reveal_timeout => {
                self.payee = payee;
                self.payee_channel = channel;
                self.outgoing_lock = Some(lock);
                self.state = MediatorState::PayeeLocked;
                Ok(vec![TransferEffect::SendMediatedTransfer { channel, lock }])
            }
            _ => {
                debug!(
                    "refunding payment {}: no route with expiration margin",
                    self.envelope.payment_id
                );
                self.state = MediatorState::Refunded;
                Ok(vec![TransferEffect::SendRefundTransfer {
                    channel: self.payer_channel,
                    lock,
                }])
            }
        }
    }

    /// The payee (or the chain) revealed the secret. Pass it upstream so the
    /// payer can unlock us; duplicates past SecretKnown are no-ops.
    pub fn on_reveal_secret(&mut self, sender: Address, secret: Secret) -> TransferResult {
        if secret.hashlock() != self.envelope.hashlock {
            return Err(TransferError::HashlockMismatch);
        }
        if self.state >= MediatorState::SecretKnown {
            return Ok(Vec::new());
        }
        if self.state != MediatorState::PayeeLocked {
            return Err(TransferError::InvalidState(format!(
                "secret reveal in state {:?}",
                self.state
            )));
        }
        if sender != self.payee {
            return Err(TransferError::UnexpectedSender(sender));
        }
        self.secret = Some(secret);
        self.state = MediatorState::SecretKnown;
        Ok(vec![TransferEffect::SendRevealSecret {
            recipient: self.payer,
            secret,
        }])
    }

    /// The secret appeared on-chain. Same promotion as an off-chain reveal,
    /// but nothing further needs registering.
    pub fn on_secret_revealed_on_chain(&mut self, secret: Secret) -> TransferResult {
        if secret.hashlock() != self.envelope.hashlock {
            return Err(TransferError::HashlockMismatch);
        }
        self.secret_registered = true;
        if self.state >= MediatorState::SecretKnown || self.state == MediatorState::Refunded {
            return Ok(Vec::new());
        }
        self.secret = Some(secret);
        self.state = MediatorState::SecretKnown;
        Ok(vec![TransferEffect::SendRevealSecret {
            recipient: self.payer,
            secret,
        }])
    }

    /// The payer's unlock proof settled our incoming lock; settle the payee
    /// in turn.
    pub fn on_payer_unlock(&mut self) -> TransferResult {
        if self.state != MediatorState::SecretKnown {
            return Err(TransferError::InvalidState(format!(
                "payer unlock in state {:?}",
                self.state
            )));
        }
        let secret = self.secret.expect("secret known in SecretKnown state");
        self.state = MediatorState::PayerUnlocked;
        Ok(vec![TransferEffect::SendUnlock {
            channel: self.payee_channel,
            secret,
        }])
    }

    /// Our unlock towards the payee went out; mediation is done.
    pub fn on_payee_unlocked(&mut self) -> TransferResult {
        if self.state != MediatorState::PayerUnlocked {
            return Err(TransferError::InvalidState(format!(
                "payee unlock in state {:?}",
                self.state
            )));
        }
        self.state = MediatorState::Completed;
        Ok(Vec::new())
    }

    pub fn on_block(&mut self, block: BlockNumber) -> Vec<TransferEffect> {
        match self.state {
            // Safety deadline: without the secret there is no point keeping
            // the outgoing lock alive once we could no longer settle the
            // incoming one on time.
            MediatorState::Pending | MediatorState::PayeeLocked
                if block + self.reveal_timeout >= self.incoming_lock.expiration =>
            {
                warn!(
                    "abandoning mediation of payment {} at block {}: reveal deadline passed",
                    self.envelope.payment_id, block
                );
                self.state = MediatorState::Expired;
                Vec::new()
            }
            // With the secret in hand, compel the payer on-chain before the
            // incoming lock can expire under us.
            MediatorState::SecretKnown | MediatorState::PayerUnlocked
                if !self.secret_registered
                    && self.incoming_lock.expiration.saturating_sub(block)
                        <= self.on_chain_margin =>
            {
                self.secret_registered = true;
                vec![TransferEffect::RegisterSecretOnChain {
                    secret: self.secret.expect("secret known"),
                }]
            }
            _ => Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            MediatorState::Completed | MediatorState::Expired | MediatorState::Refunded
        )
    }
}
