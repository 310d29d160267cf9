use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, B256, BlockNumber, Privkey, Secret, U256};

use super::merkle::{Lock, LockTree, LockTreeError};
use super::proof::{BalanceProof, ProofError};

#[derive(Error, Debug, PartialEq)]
pub enum ChannelError {
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Non-monotonic deposit: new total {new} is below current {current}")]
    NonMonotonicDeposit { new: U256, current: U256 },
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error(transparent)]
    LockTree(#[from] LockTreeError),
    #[error("No pending lock with hashlock {0:#x}")]
    UnknownHashlock(B256),
    #[error("Lock expires at {expiration}, too close to block {block} for a reveal timeout of {reveal_timeout}")]
    ExpirationTooSoon {
        expiration: BlockNumber,
        block: BlockNumber,
        reveal_timeout: BlockNumber,
    },
    #[error("Amount {amount} exceeds the distributable balance {distributable}")]
    InsufficientBalance { amount: U256, distributable: U256 },
    #[error("Chain fact contradicts recorded state: {0}")]
    ReorgConflict(String),
}

pub type ChannelResult<T = ()> = Result<T, ChannelError>;

/// Which side of the channel a participant record belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum End {
    Local,
    Remote,
}

impl End {
    pub fn other(self) -> End {
        match self {
            End::Local => End::Remote,
            End::Remote => End::Local,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// The on-chain channel contract exists but the new-channel event has not
    /// reached confirmation depth yet.
    Opening,
    Opened,
    /// A close transaction was submitted, not yet confirmed.
    Closing,
    Closed,
    /// A settle transaction was submitted after the dispute window elapsed.
    Settling,
    Settled,
}

/// One endpoint's replica record. `transferred_amount` and `nonce` track the
/// proofs issued by this side; `pending` mirrors the locks this side has
/// escrowed towards the other.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub address: Address,
    pub deposit: U256,
    pub transferred_amount: U256,
    pub nonce: u64,
    pub pending: LockTree,
    pub unlocked: BTreeMap<B256, Lock>,
    pub expired: BTreeMap<B256, Lock>,
    /// Secrets known for still-pending locks, keyed by hashlock. Funds only
    /// move once the matching unlock proof arrives or settlement claims them.
    pub secrets: BTreeMap<B256, Secret>,
    /// The most recent proof issued by this side, redeemable on-chain.
    pub last_proof: Option<BalanceProof>,
}

impl ParticipantState {
    fn new(address: Address) -> Self {
        ParticipantState {
            address,
            deposit: U256::ZERO,
            transferred_amount: U256::ZERO,
            nonce: 0,
            pending: LockTree::new(),
            unlocked: BTreeMap::new(),
            expired: BTreeMap::new(),
            secrets: BTreeMap::new(),
            last_proof: None,
        }
    }
}

/// Per-channel replica of both endpoints' balances, lock sets and nonces.
/// Only ever mutated through the operations below; every operation either
/// rejects without touching state or leaves all invariants intact.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    /// The on-chain netting channel contract address, the channel identity.
    pub channel: Address,
    pub token: Address,
    pub settle_timeout: BlockNumber,
    pub reveal_timeout: BlockNumber,
    pub status: ChannelStatus,
    pub opened_at: Option<BlockNumber>,
    pub closed_at: Option<BlockNumber>,
    pub settled_at: Option<BlockNumber>,
    pub closer: Option<Address>,
    pub local: ParticipantState,
    pub remote: ParticipantState,
}

impl ChannelState {
    pub fn new(
        channel: Address,
        token: Address,
        local: Address,
        remote: Address,
        settle_timeout: BlockNumber,
        reveal_timeout: BlockNumber,
    ) -> Self {
        ChannelState {
            channel,
            token,
            settle_timeout,
            reveal_timeout,
            status: ChannelStatus::Opening,
            opened_at: None,
            closed_at: None,
            settled_at: None,
            closer: None,
            local: ParticipantState::new(local),
            remote: ParticipantState::new(remote),
        }
    }

    pub fn end(&self, end: End) -> &ParticipantState {
        match end {
            End::Local => &self.local,
            End::Remote => &self.remote,
        }
    }

    fn end_mut(&mut self, end: End) -> &mut ParticipantState {
        match end {
            End::Local => &mut self.local,
            End::Remote => &mut self.remote,
        }
    }

    pub fn end_by_address(&self, address: Address) -> Option<End> {
        if self.local.address == address {
            Some(End::Local)
        } else if self.remote.address == address {
            Some(End::Remote)
        } else {
            None
        }
    }

    /// What `end` could still send right now: its deposit plus everything
    /// received, minus everything sent or escrowed in pending locks.
    pub fn distributable(&self, end: End) -> U256 {
        let ours = self.end(end);
        let theirs = self.end(end.other());
        (ours.deposit + theirs.transferred_amount)
            .saturating_sub(ours.transferred_amount + ours.pending.total_locked())
    }

    pub fn is_usable(&self) -> bool {
        self.status == ChannelStatus::Opened
    }

    fn require_opened(&self, what: &str) -> ChannelResult {
        if self.status != ChannelStatus::Opened {
            return Err(ChannelError::InvalidState(format!(
                "cannot {} on a channel in state {:?}",
                what, self.status
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Proofs issued by the remote side.
    // ------------------------------------------------------------------

    fn verify_incoming(&self, proof: &BalanceProof) -> ChannelResult {
        if proof.channel != self.channel {
            return Err(ChannelError::InvalidTransfer(format!(
                "proof is for channel {} not {}",
                proof.channel, self.channel
            )));
        }
        proof.verify(self.remote.address, self.remote.nonce)?;
        Ok(())
    }

    pub fn apply_direct_transfer(&mut self, proof: &BalanceProof) -> ChannelResult {
        self.require_opened("apply a direct transfer")?;
        self.verify_incoming(proof)?;
        if proof.locks_root != self.remote.pending.root() {
            return Err(ChannelError::InvalidTransfer(
                "direct transfer must carry the sender's current locks root".to_string(),
            ));
        }
        let amount = proof
            .transferred_amount
            .checked_sub(self.remote.transferred_amount)
            .filter(|delta| !delta.is_zero())
            .ok_or_else(|| {
                ChannelError::InvalidTransfer(
                    "transferred amount must strictly increase".to_string(),
                )
            })?;
        let distributable = self.distributable(End::Remote);
        if amount > distributable {
            return Err(ChannelError::InsufficientBalance {
                amount,
                distributable,
            });
        }
        let remote = &mut self.remote;
        remote.transferred_amount = proof.transferred_amount;
        remote.nonce = proof.nonce;
        remote.last_proof = Some(*proof);
        Ok(())
    }

    pub fn apply_mediated_transfer(
        &mut self,
        proof: &BalanceProof,
        lock: Lock,
        current_block: BlockNumber,
    ) -> ChannelResult {
        self.require_opened("apply a mediated transfer")?;
        self.verify_incoming(proof)?;
        if lock.expiration <= current_block + self.reveal_timeout {
            return Err(ChannelError::ExpirationTooSoon {
                expiration: lock.expiration,
                block: current_block,
                reveal_timeout: self.reveal_timeout,
            });
        }
        let distributable = self.distributable(End::Remote);
        if lock.amount > distributable {
            return Err(ChannelError::InsufficientBalance {
                amount: lock.amount,
                distributable,
            });
        }
        if proof.transferred_amount != self.remote.transferred_amount {
            return Err(ChannelError::InvalidTransfer(
                "a mediated transfer must not move the transferred amount".to_string(),
            ));
        }
        if proof.locks_root != self.remote.pending.root_with(&lock) {
            return Err(ChannelError::InvalidTransfer(
                "locks root does not commit to the pending set plus the new lock".to_string(),
            ));
        }
        self.remote.pending.add(lock)?;
        self.remote.nonce = proof.nonce;
        self.remote.last_proof = Some(*proof);
        Ok(())
    }

    /// Records a revealed secret against matching pending locks on either
    /// side. No funds move until the unlock proof follows.
    pub fn register_secret(&mut self, secret: Secret) -> bool {
        let hashlock = secret.hashlock();
        let mut matched = false;
        for end in [End::Local, End::Remote] {
            let participant = self.end_mut(end);
            if participant.pending.contains(&hashlock) {
                participant.secrets.insert(hashlock, secret);
                matched = true;
            }
        }
        matched
    }

    pub fn apply_unlock(&mut self, proof: &BalanceProof, secret: Secret) -> ChannelResult<Lock> {
        self.require_opened("apply an unlock")?;
        self.verify_incoming(proof)?;
        let hashlock = secret.hashlock();
        let lock = *self
            .remote
            .pending
            .get(&hashlock)
            .ok_or(ChannelError::UnknownHashlock(hashlock))?;
        if proof.locks_root != self.remote.pending.root_without(&hashlock) {
            return Err(ChannelError::InvalidTransfer(
                "unlock proof must commit to the pending set minus the lock".to_string(),
            ));
        }
        if proof.transferred_amount != self.remote.transferred_amount + lock.amount {
            return Err(ChannelError::InvalidTransfer(
                "unlock must credit exactly the lock amount".to_string(),
            ));
        }
        let remote = &mut self.remote;
        remote.pending.remove(&hashlock);
        remote.secrets.remove(&hashlock);
        remote.unlocked.insert(hashlock, lock);
        remote.transferred_amount = proof.transferred_amount;
        remote.nonce = proof.nonce;
        remote.last_proof = Some(*proof);
        Ok(lock)
    }

    // ------------------------------------------------------------------
    // Proofs issued by us. Constructors mirror exactly the checks the
    // receiving side applies, so a proof we sign is always acceptable.
    // ------------------------------------------------------------------

    pub fn create_direct_transfer(
        &mut self,
        amount: U256,
        extra_hash: B256,
        key: &Privkey,
    ) -> ChannelResult<BalanceProof> {
        self.require_opened("send a direct transfer")?;
        if amount.is_zero() {
            return Err(ChannelError::InvalidTransfer(
                "transfer amount must be positive".to_string(),
            ));
        }
        let distributable = self.distributable(End::Local);
        if amount > distributable {
            return Err(ChannelError::InsufficientBalance {
                amount,
                distributable,
            });
        }
        let local = &mut self.local;
        let proof = BalanceProof::new_signed(
            local.nonce + 1,
            local.transferred_amount + amount,
            local.pending.root(),
            self.channel,
            extra_hash,
            key,
        );
        local.nonce = proof.nonce;
        local.transferred_amount = proof.transferred_amount;
        local.last_proof = Some(proof);
        Ok(proof)
    }

    pub fn create_mediated_transfer(
        &mut self,
        lock: Lock,
        current_block: BlockNumber,
        extra_hash: B256,
        key: &Privkey,
    ) -> ChannelResult<BalanceProof> {
        self.require_opened("send a mediated transfer")?;
        if lock.expiration <= current_block + self.reveal_timeout {
            return Err(ChannelError::ExpirationTooSoon {
                expiration: lock.expiration,
                block: current_block,
                reveal_timeout: self.reveal_timeout,
            });
        }
        let distributable = self.distributable(End::Local);
        if lock.amount > distributable {
            return Err(ChannelError::InsufficientBalance {
                amount: lock.amount,
                distributable,
            });
        }
        let locks_root = self.local.pending.root_with(&lock);
        self.local.pending.add(lock)?;
        let local = &mut self.local;
        let proof = BalanceProof::new_signed(
            local.nonce + 1,
            local.transferred_amount,
            locks_root,
            self.channel,
            extra_hash,
            key,
        );
        local.nonce = proof.nonce;
        local.last_proof = Some(proof);
        Ok(proof)
    }

    pub fn create_unlock(
        &mut self,
        secret: Secret,
        extra_hash: B256,
        key: &Privkey,
    ) -> ChannelResult<(BalanceProof, Lock)> {
        self.require_opened("send an unlock")?;
        let hashlock = secret.hashlock();
        let lock = *self
            .local
            .pending
            .get(&hashlock)
            .ok_or(ChannelError::UnknownHashlock(hashlock))?;
        let locks_root = self.local.pending.root_without(&hashlock);
        let local = &mut self.local;
        local.pending.remove(&hashlock);
        local.secrets.remove(&hashlock);
        local.unlocked.insert(hashlock, lock);
        let proof = BalanceProof::new_signed(
            local.nonce + 1,
            local.transferred_amount + lock.amount,
            locks_root,
            self.channel,
            extra_hash,
            key,
        );
        local.nonce = proof.nonce;
        local.transferred_amount = proof.transferred_amount;
        local.last_proof = Some(proof);
        Ok((proof, lock))
    }

    /// Moves every lock past its expiration out of the pending set. The
    /// escrowed amounts were never credited, so they simply become spendable
    /// by the sender again. Returns what expired for the transfer machines.
    pub fn expire_locks(&mut self, current_block: BlockNumber) -> Vec<(End, Lock)> {
        let mut expired = Vec::new();
        for end in [End::Local, End::Remote] {
            let participant = self.end_mut(end);
            let stale: Vec<B256> = participant
                .pending
                .iter()
                .filter(|lock| lock.expiration < current_block)
                .map(|lock| lock.hashlock)
                .collect();
            for hashlock in stale {
                let lock = participant
                    .pending
                    .remove(&hashlock)
                    .expect("hashlock collected from pending");
                participant.secrets.remove(&hashlock);
                participant.expired.insert(hashlock, lock);
                expired.push((end, lock));
            }
        }
        expired
    }

    // ------------------------------------------------------------------
    // Lifecycle and chain facts. Chain appliers are idempotent for
    // identical parameters; contradictory parameters are a ReorgConflict.
    // ------------------------------------------------------------------

    pub fn on_opened(&mut self, block: BlockNumber) -> ChannelResult {
        match (self.status, self.opened_at) {
            (ChannelStatus::Opening, None) => {
                self.status = ChannelStatus::Opened;
                self.opened_at = Some(block);
                Ok(())
            }
            (_, Some(opened)) if opened == block => Ok(()),
            (_, Some(opened)) => Err(ChannelError::ReorgConflict(format!(
                "channel opened at block {} but a new-channel event claims {}",
                opened, block
            ))),
            _ => Err(ChannelError::InvalidState(format!(
                "new-channel event in state {:?}",
                self.status
            ))),
        }
    }

    /// Idempotent: the chain reports deposit totals, not deltas.
    pub fn register_deposit(&mut self, end: End, new_total: U256) -> ChannelResult {
        let participant = self.end_mut(end);
        if new_total < participant.deposit {
            return Err(ChannelError::NonMonotonicDeposit {
                new: new_total,
                current: participant.deposit,
            });
        }
        participant.deposit = new_total;
        Ok(())
    }

    /// Local decision to close. Returns the best counter-proof to submit
    /// with the on-chain close call, if the remote ever issued one.
    pub fn close(&mut self) -> ChannelResult<Option<BalanceProof>> {
        match self.status {
            ChannelStatus::Opened => {
                self.status = ChannelStatus::Closing;
                Ok(self.remote.last_proof)
            }
            ChannelStatus::Closing => Ok(self.remote.last_proof),
            _ => Err(ChannelError::InvalidState(format!(
                "cannot close a channel in state {:?}",
                self.status
            ))),
        }
    }

    /// A close transaction was confirmed. When the counterparty closed, the
    /// returned proof is our view of their balance, to be submitted via
    /// `updateTransfer` inside the settlement window.
    pub fn on_closed(
        &mut self,
        block: BlockNumber,
        closer: Address,
    ) -> ChannelResult<Option<BalanceProof>> {
        match (self.status, self.closed_at) {
            (ChannelStatus::Opened | ChannelStatus::Closing, None) => {
                self.status = ChannelStatus::Closed;
                self.closed_at = Some(block);
                self.closer = Some(closer);
                if closer == self.local.address {
                    Ok(None)
                } else {
                    Ok(self.remote.last_proof)
                }
            }
            (_, Some(closed)) if closed == block && self.closer == Some(closer) => Ok(None),
            (_, Some(closed)) => Err(ChannelError::ReorgConflict(format!(
                "channel closed at block {} by {:?} but a closed event claims block {} by {}",
                closed, self.closer, block, closer
            ))),
            _ => Err(ChannelError::InvalidState(format!(
                "closed event in state {:?}",
                self.status
            ))),
        }
    }

    pub fn settle_window_over(&self, current_block: BlockNumber) -> bool {
        matches!(self.status, ChannelStatus::Closed)
            && self
                .closed_at
                .is_some_and(|closed| current_block >= closed + self.settle_timeout)
    }

    pub fn settle(&mut self, current_block: BlockNumber) -> ChannelResult {
        if !self.settle_window_over(current_block) {
            return Err(ChannelError::InvalidState(format!(
                "settle requested in state {:?} at block {}, window ends at {:?}",
                self.status,
                current_block,
                self.closed_at.map(|c| c + self.settle_timeout)
            )));
        }
        self.status = ChannelStatus::Settling;
        Ok(())
    }

    pub fn on_settled(&mut self, block: BlockNumber) -> ChannelResult {
        match (self.status, self.settled_at) {
            (ChannelStatus::Closed | ChannelStatus::Settling, None) => {
                self.status = ChannelStatus::Settled;
                self.settled_at = Some(block);
                Ok(())
            }
            (_, Some(settled)) if settled == block => Ok(()),
            (_, Some(settled)) => Err(ChannelError::ReorgConflict(format!(
                "channel settled at block {} but a settled event claims {}",
                settled, block
            ))),
            _ => Err(ChannelError::InvalidState(format!(
                "settled event in state {:?}",
                self.status
            ))),
        }
    }

    /// A secret registered on-chain. A pending lock whose secret appears
    /// before its expiration becomes claimable at settlement; it moves to
    /// the unlocked set without touching the transferred amounts, which the
    /// settlement contract adjusts itself.
    pub fn on_secret_revealed(&mut self, secret: Secret, block: BlockNumber) -> ChannelResult {
        let hashlock = secret.hashlock();
        for end in [End::Local, End::Remote] {
            let participant = self.end_mut(end);
            if let Some(lock) = participant.pending.get(&hashlock).copied() {
                if lock.expiration >= block {
                    participant.pending.remove(&hashlock);
                    participant.secrets.remove(&hashlock);
                    participant.unlocked.insert(hashlock, lock);
                }
            }
        }
        Ok(())
    }

    /// Debug and test aid: re-checks every invariant the operations above
    /// preserve transition by transition.
    pub fn check_invariants(&self) -> ChannelResult {
        for end in [End::Local, End::Remote] {
            let participant = self.end(end);
            let theirs = self.end(end.other());
            let outgoing = participant.transferred_amount + participant.pending.total_locked();
            if participant.deposit + theirs.transferred_amount < outgoing {
                return Err(ChannelError::InvalidState(format!(
                    "{:?} side overdrawn: deposit {} + received {} < sent {} + locked {}",
                    end,
                    participant.deposit,
                    theirs.transferred_amount,
                    participant.transferred_amount,
                    participant.pending.total_locked()
                )));
            }
            for hashlock in participant.unlocked.keys() {
                if participant.pending.contains(hashlock) || participant.expired.contains_key(hashlock)
                {
                    return Err(ChannelError::InvalidState(format!(
                        "lock {:#x} present in more than one lifecycle set",
                        hashlock
                    )));
                }
            }
            for hashlock in participant.expired.keys() {
                if participant.pending.contains(hashlock) {
                    return Err(ChannelError::InvalidState(format!(
                        "lock {:#x} both pending and expired",
                        hashlock
                    )));
                }
            }
            if let Some(proof) = &participant.last_proof {
                if proof.nonce != participant.nonce {
                    return Err(ChannelError::InvalidState(format!(
                        "last proof nonce {} does not match participant nonce {}",
                        proof.nonce, participant.nonce
                    )));
                }
            }
        }
        Ok(())
    }
}
