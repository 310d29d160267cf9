use crate::channel::Lock;
use crate::transfer::{
    InitiatorMachine, InitiatorState, MediatorMachine, MediatorState, TargetMachine, TargetState,
    TransferEffect, TransferEnvelope, TransferError,
};
use crate::types::{Address, Secret, U256};

const REVEAL_TIMEOUT: u64 = 10;
const ON_CHAIN_MARGIN: u64 = 5;

fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn envelope(secret: Secret) -> TransferEnvelope {
    TransferEnvelope {
        payment_id: 1,
        token: addr(0xee),
        amount: U256::from(7u64),
        hashlock: secret.hashlock(),
        initiator: addr(0xaa),
        target: addr(0xcc),
    }
}

#[test]
fn test_initiator_happy_path() {
    let secret = Secret::new([1u8; 32]);
    let mut machine = InitiatorMachine::new(envelope(secret), secret);

    let effects = machine
        .on_route(addr(0x01), addr(0xbb), 2, 100, REVEAL_TIMEOUT)
        .unwrap();
    assert_eq!(machine.state, InitiatorState::WaitingSecretRequest);
    assert_eq!(machine.expiration, 130);
    assert_eq!(
        effects,
        vec![TransferEffect::SendMediatedTransfer {
            channel: addr(0x01),
            lock: Lock {
                amount: U256::from(7u64),
                expiration: 130,
                hashlock: secret.hashlock(),
            },
        }]
    );

    let effects = machine
        .on_secret_request(addr(0xcc), secret.hashlock(), U256::from(7u64))
        .unwrap();
    assert_eq!(machine.state, InitiatorState::WaitingSecretReveal);
    assert_eq!(
        effects,
        vec![TransferEffect::SendRevealSecret {
            recipient: addr(0xcc),
            secret,
        }]
    );

    let effects = machine.on_reveal_secret(addr(0xbb), secret).unwrap();
    assert_eq!(machine.state, InitiatorState::Completed);
    assert_eq!(
        effects,
        vec![
            TransferEffect::SendUnlock {
                channel: addr(0x01),
                secret,
            },
            TransferEffect::PaymentSucceeded { payment_id: 1 },
        ]
    );
    assert!(machine.is_terminal());
}

#[test]
fn test_initiator_rejects_foreign_secret_request() {
    let secret = Secret::new([1u8; 32]);
    let mut machine = InitiatorMachine::new(envelope(secret), secret);
    machine
        .on_route(addr(0x01), addr(0xbb), 1, 100, REVEAL_TIMEOUT)
        .unwrap();

    assert_eq!(
        machine.on_secret_request(addr(0x99), secret.hashlock(), U256::from(7u64)),
        Err(TransferError::UnexpectedSender(addr(0x99)))
    );
    assert_eq!(
        machine.on_secret_request(addr(0xcc), secret.hashlock(), U256::from(8u64)),
        Err(TransferError::AmountMismatch {
            expected: U256::from(7u64),
            got: U256::from(8u64),
        })
    );
    assert_eq!(machine.state, InitiatorState::WaitingSecretRequest);
}

#[test]
fn test_initiator_expires_without_unlocking() {
    let secret = Secret::new([1u8; 32]);
    let mut machine = InitiatorMachine::new(envelope(secret), secret);
    machine
        .on_route(addr(0x01), addr(0xbb), 1, 100, REVEAL_TIMEOUT)
        .unwrap();

    assert!(machine.on_block(119).is_empty());
    let effects = machine.on_block(120);
    assert_eq!(machine.state, InitiatorState::Expired);
    assert!(matches!(
        effects.as_slice(),
        [TransferEffect::PaymentFailed { payment_id: 1, .. }]
    ));
    // No unlock is ever emitted for an expired transfer.
    assert!(!effects
        .iter()
        .any(|e| matches!(e, TransferEffect::SendUnlock { .. })));
}

#[test]
fn test_initiator_cancel_only_before_reveal() {
    let secret = Secret::new([1u8; 32]);
    let mut machine = InitiatorMachine::new(envelope(secret), secret);
    machine
        .on_route(addr(0x01), addr(0xbb), 1, 100, REVEAL_TIMEOUT)
        .unwrap();
    machine
        .on_secret_request(addr(0xcc), secret.hashlock(), U256::from(7u64))
        .unwrap();
    // Secret released: the transfer is committed.
    assert!(machine.cancel().is_err());

    let mut fresh = InitiatorMachine::new(envelope(secret), secret);
    fresh
        .on_route(addr(0x01), addr(0xbb), 1, 100, REVEAL_TIMEOUT)
        .unwrap();
    assert!(fresh.cancel().is_ok());
    assert_eq!(fresh.state, InitiatorState::Expired);
}

fn mediator(incoming_expiration: u64) -> (MediatorMachine, Secret) {
    let secret = Secret::new([2u8; 32]);
    let machine = MediatorMachine::new(
        envelope(secret),
        addr(0xaa),
        addr(0x01),
        Lock {
            amount: U256::from(7u64),
            expiration: incoming_expiration,
            hashlock: secret.hashlock(),
        },
        REVEAL_TIMEOUT,
        ON_CHAIN_MARGIN,
    );
    (machine, secret)
}

#[test]
fn test_mediator_happy_path_keeps_expiry_ordering() {
    let (mut machine, secret) = mediator(150);
    let effects = machine
        .on_route(Some((addr(0x02), addr(0xcc))), 100)
        .unwrap();
    assert_eq!(machine.state, MediatorState::PayeeLocked);
    let outgoing = match &effects[..] {
        [TransferEffect::SendMediatedTransfer { lock, .. }] => *lock,
        other => panic!("unexpected effects {:?}", other),
    };
    // Property 5: outgoing.expiration + reveal_timeout <= incoming.expiration.
    assert!(outgoing.expiration + REVEAL_TIMEOUT <= 150);

    let effects = machine.on_reveal_secret(addr(0xcc), secret).unwrap();
    assert_eq!(machine.state, MediatorState::SecretKnown);
    assert_eq!(
        effects,
        vec![TransferEffect::SendRevealSecret {
            recipient: addr(0xaa),
            secret,
        }]
    );
    // A duplicate reveal is absorbed.
    assert!(machine.on_reveal_secret(addr(0xcc), secret).unwrap().is_empty());

    let effects = machine.on_payer_unlock().unwrap();
    assert_eq!(machine.state, MediatorState::PayerUnlocked);
    assert_eq!(
        effects,
        vec![TransferEffect::SendUnlock {
            channel: addr(0x02),
            secret,
        }]
    );
    machine.on_payee_unlocked().unwrap();
    assert_eq!(machine.state, MediatorState::Completed);
}

#[test]
fn test_mediator_refunds_without_expiry_margin() {
    // Incoming expires at 115; outgoing would expire at 105, which leaves
    // no reveal margin at block 100, so the transfer bounces back.
    let (mut machine, secret) = mediator(115);
    let effects = machine
        .on_route(Some((addr(0x02), addr(0xcc))), 100)
        .unwrap();
    assert_eq!(machine.state, MediatorState::Refunded);
    match &effects[..] {
        [TransferEffect::SendRefundTransfer { channel, lock }] => {
            assert_eq!(*channel, addr(0x01));
            assert_eq!(lock.hashlock, secret.hashlock());
            assert!(lock.expiration < 115);
        }
        other => panic!("unexpected effects {:?}", other),
    }
}

#[test]
fn test_mediator_refunds_without_route() {
    let (mut machine, _) = mediator(150);
    let effects = machine.on_route(None, 100).unwrap();
    assert_eq!(machine.state, MediatorState::Refunded);
    assert!(matches!(
        effects.as_slice(),
        [TransferEffect::SendRefundTransfer { .. }]
    ));
}

#[test]
fn test_mediator_abandons_at_safety_deadline() {
    let (mut machine, _) = mediator(150);
    machine
        .on_route(Some((addr(0x02), addr(0xcc))), 100)
        .unwrap();
    assert!(machine.on_block(139).is_empty());
    machine.on_block(140);
    assert_eq!(machine.state, MediatorState::Expired);
}

#[test]
fn test_mediator_registers_secret_on_chain_near_expiry() {
    let (mut machine, secret) = mediator(150);
    machine
        .on_route(Some((addr(0x02), addr(0xcc))), 100)
        .unwrap();
    machine.on_reveal_secret(addr(0xcc), secret).unwrap();

    assert!(machine.on_block(140).is_empty());
    let effects = machine.on_block(145);
    assert_eq!(
        effects,
        vec![TransferEffect::RegisterSecretOnChain { secret }]
    );
    // Registration is submitted once, not on every subsequent tick.
    assert!(machine.on_block(146).is_empty());
}

#[test]
fn test_mediator_chain_reveal_promotes_state() {
    let (mut machine, secret) = mediator(150);
    machine
        .on_route(Some((addr(0x02), addr(0xcc))), 100)
        .unwrap();
    let effects = machine.on_secret_revealed_on_chain(secret).unwrap();
    assert_eq!(machine.state, MediatorState::SecretKnown);
    assert!(matches!(
        effects.as_slice(),
        [TransferEffect::SendRevealSecret { .. }]
    ));
    // Already registered on-chain, no further registration effect fires.
    assert!(machine.on_block(149).is_empty());
}

fn target(lock_expiration: u64) -> (TargetMachine, Secret) {
    let secret = Secret::new([3u8; 32]);
    let machine = TargetMachine::new(
        envelope(secret),
        addr(0x02),
        addr(0xbb),
        Lock {
            amount: U256::from(7u64),
            expiration: lock_expiration,
            hashlock: secret.hashlock(),
        },
        REVEAL_TIMEOUT,
        ON_CHAIN_MARGIN,
    );
    (machine, secret)
}

#[test]
fn test_target_happy_path() {
    let (mut machine, secret) = target(150);
    let effects = machine.on_transfer().unwrap();
    assert_eq!(machine.state, TargetState::WaitingSecret);
    assert_eq!(
        effects,
        vec![TransferEffect::SendSecretRequest {
            recipient: addr(0xaa),
            hashlock: secret.hashlock(),
            amount: U256::from(7u64),
        }]
    );

    let effects = machine.on_reveal_secret(addr(0xaa), secret).unwrap();
    assert_eq!(machine.state, TargetState::Revealed);
    assert_eq!(
        effects,
        vec![TransferEffect::SendRevealSecret {
            recipient: addr(0xbb),
            secret,
        }]
    );

    let effects = machine.on_unlock().unwrap();
    assert_eq!(machine.state, TargetState::Completed);
    assert_eq!(
        effects,
        vec![TransferEffect::PaymentReceived {
            payment_id: 1,
            amount: U256::from(7u64),
        }]
    );
}

#[test]
fn test_target_rejects_wrong_secret_or_sender() {
    let (mut machine, secret) = target(150);
    machine.on_transfer().unwrap();
    assert_eq!(
        machine.on_reveal_secret(addr(0x99), secret),
        Err(TransferError::UnexpectedSender(addr(0x99)))
    );
    assert_eq!(
        machine.on_reveal_secret(addr(0xaa), Secret::new([9u8; 32])),
        Err(TransferError::HashlockMismatch)
    );
    assert_eq!(machine.state, TargetState::WaitingSecret);
}

#[test]
fn test_target_expires_without_secret() {
    let (mut machine, _) = target(150);
    machine.on_transfer().unwrap();
    assert!(machine.on_block(139).is_empty());
    machine.on_block(140);
    assert_eq!(machine.state, TargetState::Expired);
}

#[test]
fn test_target_registers_secret_when_unlock_stalls() {
    let (mut machine, secret) = target(150);
    machine.on_transfer().unwrap();
    machine.on_reveal_secret(addr(0xaa), secret).unwrap();
    assert!(machine.on_block(144).is_empty());
    let effects = machine.on_block(145);
    assert_eq!(
        effects,
        vec![TransferEffect::RegisterSecretOnChain { secret }]
    );
    assert!(machine.on_block(146).is_empty());
}
