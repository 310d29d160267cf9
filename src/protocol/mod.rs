//! Typed wire messages exchanged between channel peers.
//!
//! Envelope layout: 1-byte version ‖ 1-byte type ‖ payload ‖ 65-byte
//! recoverable signature over keccak256(version ‖ type ‖ payload). All
//! payload integers are fixed-width big-endian. The transport acknowledges
//! at envelope level; deduplication is by `(sender, message_id)`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{BalanceProof, Lock};
use crate::types::{keccak256, Address, B256, EcdsaSignature, Privkey, Secret, U256};

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum MessageError {
    #[error("Message truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Unknown protocol version: {0}")]
    UnknownVersion(u8),
    #[error("Unknown message type: {0}")]
    UnknownType(u8),
    #[error("Trailing bytes after payload")]
    TrailingBytes,
    #[error("Envelope signature is invalid")]
    InvalidSignature,
    #[error("Embedded balance proof is malformed")]
    MalformedProof,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageType {
    DirectTransfer = 1,
    MediatedTransfer = 2,
    RefundTransfer = 3,
    SecretRequest = 4,
    RevealSecret = 5,
    /// Carries the balance proof that settles a pending lock off-chain.
    Unlock = 6,
    Ack = 7,
    Ping = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::DirectTransfer),
            2 => Ok(MessageType::MediatedTransfer),
            3 => Ok(MessageType::RefundTransfer),
            4 => Ok(MessageType::SecretRequest),
            5 => Ok(MessageType::RevealSecret),
            6 => Ok(MessageType::Unlock),
            7 => Ok(MessageType::Ack),
            8 => Ok(MessageType::Ping),
            other => Err(MessageError::UnknownType(other)),
        }
    }
}

/// A transfer moving the transferred amount directly, no lock involved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirectTransfer {
    pub message_id: u64,
    pub payment_id: u64,
    pub token: Address,
    pub proof: BalanceProof,
}

/// A transfer escrowed behind a hashlock, forwarded hop by hop towards the
/// target. The embedded proof commits to the sender's pending set including
/// the new lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MediatedTransfer {
    pub message_id: u64,
    pub payment_id: u64,
    pub token: Address,
    pub initiator: Address,
    pub target: Address,
    pub lock: Lock,
    pub proof: BalanceProof,
}

/// A mediated transfer sent back towards the initiator when the payee could
/// not forward: a distinct lock in the opposite direction, same hashlock,
/// strictly shorter expiration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RefundTransfer {
    pub message_id: u64,
    pub payment_id: u64,
    pub token: Address,
    pub initiator: Address,
    pub target: Address,
    pub lock: Lock,
    pub proof: BalanceProof,
}

/// The target asks the initiator for the secret after receiving the lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecretRequest {
    pub message_id: u64,
    pub payment_id: u64,
    pub hashlock: B256,
    pub amount: U256,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RevealSecret {
    pub message_id: u64,
    pub secret: Secret,
}

/// The payer settles a pending lock: the secret together with a balance
/// proof whose transferred amount absorbs the lock's amount and whose locks
/// root commits to the pending set without the lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Unlock {
    pub message_id: u64,
    pub payment_id: u64,
    pub secret: Secret,
    pub proof: BalanceProof,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// The message id being acknowledged.
    pub message_id: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub message_id: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Message {
    DirectTransfer(DirectTransfer),
    MediatedTransfer(MediatedTransfer),
    RefundTransfer(RefundTransfer),
    SecretRequest(SecretRequest),
    RevealSecret(RevealSecret),
    Unlock(Unlock),
    Ack(Ack),
    Ping(Ping),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::DirectTransfer(_) => MessageType::DirectTransfer,
            Message::MediatedTransfer(_) => MessageType::MediatedTransfer,
            Message::RefundTransfer(_) => MessageType::RefundTransfer,
            Message::SecretRequest(_) => MessageType::SecretRequest,
            Message::RevealSecret(_) => MessageType::RevealSecret,
            Message::Unlock(_) => MessageType::Unlock,
            Message::Ack(_) => MessageType::Ack,
            Message::Ping(_) => MessageType::Ping,
        }
    }

    pub fn message_id(&self) -> u64 {
        match self {
            Message::DirectTransfer(m) => m.message_id,
            Message::MediatedTransfer(m) => m.message_id,
            Message::RefundTransfer(m) => m.message_id,
            Message::SecretRequest(m) => m.message_id,
            Message::RevealSecret(m) => m.message_id,
            Message::Unlock(m) => m.message_id,
            Message::Ack(m) => m.message_id,
            Message::Ping(m) => m.message_id,
        }
    }

    /// Whether the receiver should acknowledge this message. Acks are not
    /// themselves acknowledged, otherwise two peers would ping-pong forever.
    pub fn wants_ack(&self) -> bool {
        !matches!(self, Message::Ack(_))
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Message::DirectTransfer(m) => {
                out.extend_from_slice(&m.message_id.to_be_bytes());
                out.extend_from_slice(&m.payment_id.to_be_bytes());
                out.extend_from_slice(m.token.as_slice());
                out.extend_from_slice(&m.proof.to_wire());
            }
            Message::MediatedTransfer(m) => encode_locked_transfer(
                out,
                m.message_id,
                m.payment_id,
                m.token,
                m.initiator,
                m.target,
                &m.lock,
                &m.proof,
            ),
            Message::RefundTransfer(m) => encode_locked_transfer(
                out,
                m.message_id,
                m.payment_id,
                m.token,
                m.initiator,
                m.target,
                &m.lock,
                &m.proof,
            ),
            Message::SecretRequest(m) => {
                out.extend_from_slice(&m.message_id.to_be_bytes());
                out.extend_from_slice(&m.payment_id.to_be_bytes());
                out.extend_from_slice(m.hashlock.as_slice());
                out.extend_from_slice(&m.amount.to_be_bytes::<32>());
            }
            Message::RevealSecret(m) => {
                out.extend_from_slice(&m.message_id.to_be_bytes());
                out.extend_from_slice(m.secret.as_bytes());
            }
            Message::Unlock(m) => {
                out.extend_from_slice(&m.message_id.to_be_bytes());
                out.extend_from_slice(&m.payment_id.to_be_bytes());
                out.extend_from_slice(m.secret.as_bytes());
                out.extend_from_slice(&m.proof.to_wire());
            }
            Message::Ack(m) => out.extend_from_slice(&m.message_id.to_be_bytes()),
            Message::Ping(m) => out.extend_from_slice(&m.message_id.to_be_bytes()),
        }
    }

    fn decode_payload(message_type: MessageType, payload: &[u8]) -> Result<Message, MessageError> {
        let mut reader = Reader::new(payload);
        let message = match message_type {
            MessageType::DirectTransfer => Message::DirectTransfer(DirectTransfer {
                message_id: reader.u64()?,
                payment_id: reader.u64()?,
                token: reader.address()?,
                proof: reader.proof()?,
            }),
            MessageType::MediatedTransfer => {
                let (message_id, payment_id, token, initiator, target, lock, proof) =
                    decode_locked_transfer(&mut reader)?;
                Message::MediatedTransfer(MediatedTransfer {
                    message_id,
                    payment_id,
                    token,
                    initiator,
                    target,
                    lock,
                    proof,
                })
            }
            MessageType::RefundTransfer => {
                let (message_id, payment_id, token, initiator, target, lock, proof) =
                    decode_locked_transfer(&mut reader)?;
                Message::RefundTransfer(RefundTransfer {
                    message_id,
                    payment_id,
                    token,
                    initiator,
                    target,
                    lock,
                    proof,
                })
            }
            MessageType::SecretRequest => Message::SecretRequest(SecretRequest {
                message_id: reader.u64()?,
                payment_id: reader.u64()?,
                hashlock: reader.b256()?,
                amount: reader.u256()?,
            }),
            MessageType::RevealSecret => Message::RevealSecret(RevealSecret {
                message_id: reader.u64()?,
                secret: Secret::new(reader.b256()?.0),
            }),
            MessageType::Unlock => Message::Unlock(Unlock {
                message_id: reader.u64()?,
                payment_id: reader.u64()?,
                secret: Secret::new(reader.b256()?.0),
                proof: reader.proof()?,
            }),
            MessageType::Ack => Message::Ack(Ack {
                message_id: reader.u64()?,
            }),
            MessageType::Ping => Message::Ping(Ping {
                message_id: reader.u64()?,
            }),
        };
        reader.finish()?;
        Ok(message)
    }

    /// Signs and serialises into the wire envelope.
    pub fn seal(&self, key: &Privkey) -> Vec<u8> {
        let mut bytes = vec![PROTOCOL_VERSION, self.message_type() as u8];
        self.encode_payload(&mut bytes);
        let signature = key.sign(keccak256(&bytes));
        bytes.extend_from_slice(&signature.to_bytes());
        bytes
    }

    /// Verifies the envelope and recovers the sender's address.
    pub fn open(bytes: &[u8]) -> Result<(Message, Address), MessageError> {
        if bytes.len() < 2 + EcdsaSignature::LENGTH {
            return Err(MessageError::Truncated {
                needed: 2 + EcdsaSignature::LENGTH - bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(MessageError::UnknownVersion(bytes[0]));
        }
        let message_type = MessageType::try_from(bytes[1])?;
        let (signed, signature) = bytes.split_at(bytes.len() - EcdsaSignature::LENGTH);
        let signature =
            EcdsaSignature::from_slice(signature).map_err(|_| MessageError::InvalidSignature)?;
        let sender = signature
            .recover(keccak256(signed))
            .map_err(|_| MessageError::InvalidSignature)?;
        let message = Message::decode_payload(message_type, &signed[2..])?;
        Ok((message, sender))
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_locked_transfer(
    out: &mut Vec<u8>,
    message_id: u64,
    payment_id: u64,
    token: Address,
    initiator: Address,
    target: Address,
    lock: &Lock,
    proof: &BalanceProof,
) {
    out.extend_from_slice(&message_id.to_be_bytes());
    out.extend_from_slice(&payment_id.to_be_bytes());
    out.extend_from_slice(token.as_slice());
    out.extend_from_slice(initiator.as_slice());
    out.extend_from_slice(target.as_slice());
    out.extend_from_slice(&lock.encode());
    out.extend_from_slice(&proof.to_wire());
}

type LockedTransferFields = (u64, u64, Address, Address, Address, Lock, BalanceProof);

fn decode_locked_transfer(reader: &mut Reader) -> Result<LockedTransferFields, MessageError> {
    Ok((
        reader.u64()?,
        reader.u64()?,
        reader.address()?,
        reader.address()?,
        reader.address()?,
        reader.lock()?,
        reader.proof()?,
    ))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        if self.buf.len() < n {
            return Err(MessageError::Truncated {
                needed: n - self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u64(&mut self) -> Result<u64, MessageError> {
        Ok(u64::from_be_bytes(
            self.take(8)?.try_into().expect("8 bytes"),
        ))
    }

    fn u256(&mut self) -> Result<U256, MessageError> {
        Ok(U256::from_be_slice(self.take(32)?))
    }

    fn address(&mut self) -> Result<Address, MessageError> {
        Ok(Address::from_slice(self.take(20)?))
    }

    fn b256(&mut self) -> Result<B256, MessageError> {
        Ok(B256::from_slice(self.take(32)?))
    }

    fn lock(&mut self) -> Result<Lock, MessageError> {
        Ok(Lock {
            amount: self.u256()?,
            expiration: self.u64()?,
            hashlock: self.b256()?,
        })
    }

    fn proof(&mut self) -> Result<BalanceProof, MessageError> {
        BalanceProof::from_wire(self.take(BalanceProof::WIRE_LENGTH)?)
            .ok_or(MessageError::MalformedProof)
    }

    fn finish(&self) -> Result<(), MessageError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(MessageError::TrailingBytes)
        }
    }
}
