use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::channel::{
    BalanceProof, ChannelError, ChannelState, ChannelStatus, End, Lock, ProofError,
};
use crate::types::{keccak256, Address, Privkey, Secret, B256, U256};

pub fn test_keys() -> (Privkey, Privkey) {
    (Privkey::from([1u8; 32]), Privkey::from([2u8; 32]))
}

/// A freshly opened channel with both sides funded, from A's point of view.
pub fn opened_channel(deposit: u64) -> (ChannelState, Privkey, Privkey) {
    let (key_a, key_b) = test_keys();
    let mut channel = ChannelState::new(
        Address::repeat_byte(0xcc),
        Address::repeat_byte(0xee),
        key_a.address(),
        key_b.address(),
        40,
        10,
    );
    channel.on_opened(1).unwrap();
    channel
        .register_deposit(End::Local, U256::from(deposit))
        .unwrap();
    channel
        .register_deposit(End::Remote, U256::from(deposit))
        .unwrap();
    (channel, key_a, key_b)
}

/// The same channel seen from B's side: local and remote swapped.
pub fn mirrored(channel: &ChannelState) -> ChannelState {
    let mut other = channel.clone();
    std::mem::swap(&mut other.local, &mut other.remote);
    other
}

fn lock_with(amount: u64, expiration: u64, secret: Secret) -> Lock {
    Lock {
        amount: U256::from(amount),
        expiration,
        hashlock: secret.hashlock(),
    }
}

#[test]
fn test_deposit_is_idempotent_and_monotonic() {
    let (mut channel, _, _) = opened_channel(100);
    channel
        .register_deposit(End::Local, U256::from(100u64))
        .unwrap();
    assert_eq!(channel.local.deposit, U256::from(100u64));
    assert_eq!(
        channel.register_deposit(End::Local, U256::from(50u64)),
        Err(ChannelError::NonMonotonicDeposit {
            new: U256::from(50u64),
            current: U256::from(100u64),
        })
    );
}

#[test]
fn test_direct_transfer_round_trip() {
    // S1: A sends a direct transfer of 10 on a 100/100 channel.
    let (mut sender, key_a, _) = opened_channel(100);
    let mut receiver = mirrored(&sender);

    let proof = sender
        .create_direct_transfer(U256::from(10u64), B256::ZERO, &key_a)
        .unwrap();
    receiver.apply_direct_transfer(&proof).unwrap();

    assert_eq!(proof.nonce, 1);
    assert_eq!(sender.local.transferred_amount, U256::from(10u64));
    assert_eq!(receiver.remote.transferred_amount, U256::from(10u64));
    assert_eq!(sender.distributable(End::Local), U256::from(90u64));
    assert_eq!(receiver.distributable(End::Local), U256::from(110u64));
    sender.check_invariants().unwrap();
    receiver.check_invariants().unwrap();
}

#[test]
fn test_direct_transfer_replay_is_rejected() {
    let (mut sender, key_a, _) = opened_channel(100);
    let mut receiver = mirrored(&sender);
    let proof = sender
        .create_direct_transfer(U256::from(10u64), B256::ZERO, &key_a)
        .unwrap();
    receiver.apply_direct_transfer(&proof).unwrap();
    assert_eq!(
        receiver.apply_direct_transfer(&proof),
        Err(ChannelError::Proof(ProofError::StaleNonce {
            proof: 1,
            current: 1
        }))
    );
}

#[test]
fn test_direct_transfer_cannot_overdraw() {
    let (mut sender, key_a, _) = opened_channel(100);
    assert!(matches!(
        sender.create_direct_transfer(U256::from(101u64), B256::ZERO, &key_a),
        Err(ChannelError::InsufficientBalance { .. })
    ));
    // A validly signed proof claiming more than distributable is rejected too.
    let mut receiver = mirrored(&sender);
    let forged = BalanceProof::new_signed(
        1,
        U256::from(150u64),
        B256::ZERO,
        receiver.channel,
        B256::ZERO,
        &key_a,
    );
    assert!(matches!(
        receiver.apply_direct_transfer(&forged),
        Err(ChannelError::InsufficientBalance { .. })
    ));
}

#[test]
fn test_direct_transfer_wrong_signer_rejected() {
    let (channel, _, _) = opened_channel(100);
    let mut receiver = mirrored(&channel);
    let intruder = Privkey::from([9u8; 32]);
    let forged = BalanceProof::new_signed(
        1,
        U256::from(10u64),
        B256::ZERO,
        receiver.channel,
        B256::ZERO,
        &intruder,
    );
    assert_eq!(
        receiver.apply_direct_transfer(&forged),
        Err(ChannelError::Proof(ProofError::InvalidSignature))
    );
}

#[test]
fn test_mediated_transfer_locks_and_unlocks() {
    // S2 channel-level half: lock 5 behind a hashlock, then unlock it.
    let (mut sender, key_a, _) = opened_channel(100);
    let mut receiver = mirrored(&sender);
    let secret = Secret::new([1u8; 32]);
    let lock = lock_with(5, 60, secret);

    let proof = sender
        .create_mediated_transfer(lock, 10, B256::ZERO, &key_a)
        .unwrap();
    receiver
        .apply_mediated_transfer(&proof, lock, 10)
        .unwrap();

    assert_eq!(sender.distributable(End::Local), U256::from(95u64));
    assert_eq!(receiver.distributable(End::Local), U256::from(100u64));
    assert!(receiver.remote.pending.contains(&secret.hashlock()));

    let (unlock, unlocked) = sender.create_unlock(secret, B256::ZERO, &key_a).unwrap();
    assert_eq!(unlocked, lock);
    receiver.apply_unlock(&unlock, secret).unwrap();

    assert_eq!(sender.distributable(End::Local), U256::from(95u64));
    assert_eq!(receiver.distributable(End::Local), U256::from(105u64));
    assert!(receiver.remote.pending.is_empty());
    assert!(receiver.remote.unlocked.contains_key(&secret.hashlock()));
    sender.check_invariants().unwrap();
    receiver.check_invariants().unwrap();
}

#[test]
fn test_mediated_transfer_expiration_too_soon() {
    let (mut sender, key_a, _) = opened_channel(100);
    let lock = lock_with(5, 15, Secret::new([1u8; 32]));
    // reveal_timeout is 10, so expiration 15 at block 10 leaves no margin.
    assert!(matches!(
        sender.create_mediated_transfer(lock, 10, B256::ZERO, &key_a),
        Err(ChannelError::ExpirationTooSoon { .. })
    ));
}

#[test]
fn test_unlock_requires_exact_amount() {
    let (mut sender, key_a, _) = opened_channel(100);
    let mut receiver = mirrored(&sender);
    let secret = Secret::new([1u8; 32]);
    let lock = lock_with(5, 60, secret);
    let proof = sender
        .create_mediated_transfer(lock, 10, B256::ZERO, &key_a)
        .unwrap();
    receiver
        .apply_mediated_transfer(&proof, lock, 10)
        .unwrap();

    let forged = BalanceProof::new_signed(
        2,
        U256::from(7u64), // lock amount is 5
        receiver.remote.pending.root_without(&secret.hashlock()),
        receiver.channel,
        B256::ZERO,
        &key_a,
    );
    assert!(matches!(
        receiver.apply_unlock(&forged, secret),
        Err(ChannelError::InvalidTransfer(_))
    ));
    // The pending lock is untouched by the failed unlock.
    assert!(receiver.remote.pending.contains(&secret.hashlock()));
}

#[test]
fn test_expired_lock_returns_funds_to_sender() {
    // S4: the lock expires, nothing was credited, sender spends again.
    let (mut sender, key_a, _) = opened_channel(100);
    let mut receiver = mirrored(&sender);
    let secret = Secret::new([1u8; 32]);
    let lock = lock_with(5, 60, secret);
    let proof = sender
        .create_mediated_transfer(lock, 10, B256::ZERO, &key_a)
        .unwrap();
    receiver
        .apply_mediated_transfer(&proof, lock, 10)
        .unwrap();
    assert_eq!(sender.distributable(End::Local), U256::from(95u64));

    let expired = sender.expire_locks(61);
    assert_eq!(expired, vec![(End::Local, lock)]);
    assert_eq!(sender.distributable(End::Local), U256::from(100u64));
    assert!(sender.local.expired.contains_key(&secret.hashlock()));
    // Not yet expired at exactly the expiration block.
    assert!(receiver.expire_locks(60).is_empty());
    sender.check_invariants().unwrap();
}

#[test]
fn test_register_secret_moves_no_funds() {
    let (mut sender, key_a, _) = opened_channel(100);
    let secret = Secret::new([1u8; 32]);
    let lock = lock_with(5, 60, secret);
    sender
        .create_mediated_transfer(lock, 10, B256::ZERO, &key_a)
        .unwrap();
    assert!(sender.register_secret(secret));
    assert!(!sender.register_secret(Secret::new([2u8; 32])));
    assert_eq!(sender.distributable(End::Local), U256::from(95u64));
    assert!(sender.local.pending.contains(&secret.hashlock()));
}

#[test]
fn test_close_and_settle_lifecycle() {
    let (mut channel, key_a, _) = opened_channel(100);
    let mut partner_view = mirrored(&channel);
    let proof = channel
        .create_direct_transfer(U256::from(10u64), B256::ZERO, &key_a)
        .unwrap();
    partner_view.apply_direct_transfer(&proof).unwrap();

    // The partner closes; our view of their proof is what they submit.
    let counter = partner_view.close().unwrap();
    assert_eq!(counter, Some(proof));
    assert_eq!(partner_view.status, ChannelStatus::Closing);

    // First mined close wins; the other side must update within the window.
    let closer = partner_view.local.address;
    let update = channel.on_closed(100, closer).unwrap();
    assert_eq!(channel.status, ChannelStatus::Closed);
    assert_eq!(update, channel.remote.last_proof);

    assert!(!channel.settle_window_over(139));
    assert!(matches!(
        channel.settle(139),
        Err(ChannelError::InvalidState(_))
    ));
    assert!(channel.settle_window_over(140));
    channel.settle(140).unwrap();
    channel.on_settled(141).unwrap();
    assert_eq!(channel.status, ChannelStatus::Settled);
}

#[test]
fn test_chain_events_are_idempotent_and_detect_conflicts() {
    let (mut channel, _, _) = opened_channel(100);
    // Property 7: identical re-application is a no-op.
    channel.on_opened(1).unwrap();
    let closer = channel.remote.address;
    channel.on_closed(100, closer).unwrap();
    channel.on_closed(100, closer).unwrap();
    // A contradictory close block is a reorg conflict.
    assert!(matches!(
        channel.on_closed(101, closer),
        Err(ChannelError::ReorgConflict(_))
    ));
    channel.on_settled(200).unwrap();
    channel.on_settled(200).unwrap();
    assert!(matches!(
        channel.on_settled(201),
        Err(ChannelError::ReorgConflict(_))
    ));
}

#[test]
fn test_on_chain_secret_reveal_moves_lock_to_unlocked() {
    let (mut sender, key_a, _) = opened_channel(100);
    let secret = Secret::new([1u8; 32]);
    let lock = lock_with(5, 60, secret);
    sender
        .create_mediated_transfer(lock, 10, B256::ZERO, &key_a)
        .unwrap();

    sender.on_secret_revealed(secret, 50).unwrap();
    assert!(sender.local.unlocked.contains_key(&secret.hashlock()));
    assert!(!sender.local.pending.contains(&secret.hashlock()));
    // Re-applying the same chain fact is a no-op.
    sender.on_secret_revealed(secret, 50).unwrap();
    sender.check_invariants().unwrap();
}

#[test]
fn test_on_chain_secret_reveal_after_expiration_is_ignored() {
    let (mut sender, key_a, _) = opened_channel(100);
    let secret = Secret::new([1u8; 32]);
    let lock = lock_with(5, 60, secret);
    sender
        .create_mediated_transfer(lock, 10, B256::ZERO, &key_a)
        .unwrap();
    sender.on_secret_revealed(secret, 61).unwrap();
    assert!(sender.local.pending.contains(&secret.hashlock()));
}

/// Properties 1-4 under random operation sequences: conservation, nonce
/// monotonicity, lock-set disjointness and root consistency hold in every
/// reachable state.
#[test]
fn test_invariants_hold_under_random_operations() {
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..16 {
        let (mut a_view, key_a, key_b) = opened_channel(1_000);
        let mut b_view = mirrored(&a_view);
        let total_deposit = U256::from(2_000u64);
        let mut block = 10u64;
        let mut secret_counter = round as u8;
        let mut open_secrets: Vec<Secret> = Vec::new();

        for _ in 0..rng.gen_range(20..60) {
            match rng.gen_range(0..5) {
                0 => {
                    let amount = U256::from(rng.gen_range(1..50u64));
                    if let Ok(proof) =
                        a_view.create_direct_transfer(amount, B256::ZERO, &key_a)
                    {
                        b_view.apply_direct_transfer(&proof).unwrap();
                    }
                }
                1 => {
                    let amount = U256::from(rng.gen_range(1..50u64));
                    if let Ok(proof) =
                        b_view.create_direct_transfer(amount, B256::ZERO, &key_b)
                    {
                        a_view.apply_direct_transfer(&proof).unwrap();
                    }
                }
                2 => {
                    secret_counter = secret_counter.wrapping_add(1);
                    let secret = Secret::new(keccak256([round as u8, secret_counter]).0);
                    let lock = Lock {
                        amount: U256::from(rng.gen_range(1..40u64)),
                        expiration: block + rng.gen_range(15..40u64),
                        hashlock: secret.hashlock(),
                    };
                    if let Ok(proof) =
                        a_view.create_mediated_transfer(lock, block, B256::ZERO, &key_a)
                    {
                        b_view
                            .apply_mediated_transfer(&proof, lock, block)
                            .unwrap();
                        open_secrets.push(secret);
                    }
                }
                3 => {
                    if !open_secrets.is_empty() {
                        let secret = open_secrets.swap_remove(rng.gen_range(0..open_secrets.len()));
                        if let Ok((proof, _)) =
                            a_view.create_unlock(secret, B256::ZERO, &key_a)
                        {
                            b_view.apply_unlock(&proof, secret).unwrap();
                        }
                    }
                }
                _ => {
                    block += rng.gen_range(1..10u64);
                    a_view.expire_locks(block);
                    b_view.expire_locks(block);
                    open_secrets.retain(|secret| {
                        a_view.local.pending.contains(&secret.hashlock())
                    });
                }
            }

            a_view.check_invariants().unwrap();
            b_view.check_invariants().unwrap();
            // Conservation: distributable(A) + distributable(B) + locked
            // never exceeds the total deposit.
            let locked =
                a_view.local.pending.total_locked() + a_view.remote.pending.total_locked();
            assert!(
                a_view.distributable(End::Local)
                    + a_view.distributable(End::Remote)
                    + locked
                    <= total_deposit
            );
            // Both replicas agree on the sender's pending set root.
            assert_eq!(a_view.local.pending.root(), b_view.remote.pending.root());
        }
    }
}
