use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{keccak256, Address, B256, EcdsaSignature, Privkey, U256};

#[derive(Error, Debug, Eq, PartialEq)]
pub enum ProofError {
    #[error("Balance proof signature does not recover to the expected signer")]
    InvalidSignature,
    #[error("Stale nonce: proof carries {proof} but {current} was already accepted")]
    StaleNonce { proof: u64, current: u64 },
}

/// The signed off-chain accounting tuple exchanged between channel peers.
/// Each accepted proof replaces the previous one; during a dispute the latest
/// proof is what `updateTransfer` redeems on-chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BalanceProof {
    pub nonce: u64,
    pub transferred_amount: U256,
    pub locks_root: B256,
    pub channel: Address,
    pub extra_hash: B256,
    pub signature: EcdsaSignature,
}

impl BalanceProof {
    pub const ENCODED_LENGTH: usize = 8 + 32 + 32 + 20 + 32;
    pub const WIRE_LENGTH: usize = Self::ENCODED_LENGTH + EcdsaSignature::LENGTH;

    pub fn new_signed(
        nonce: u64,
        transferred_amount: U256,
        locks_root: B256,
        channel: Address,
        extra_hash: B256,
        key: &Privkey,
    ) -> Self {
        let digest = Self::digest_of(nonce, transferred_amount, locks_root, channel, extra_hash);
        BalanceProof {
            nonce,
            transferred_amount,
            locks_root,
            channel,
            extra_hash,
            signature: key.sign(digest),
        }
    }

    /// Canonical bit-exact serialisation of the signed fields, the same byte
    /// layout the settlement contract reconstructs during a dispute.
    pub fn encode(&self) -> [u8; Self::ENCODED_LENGTH] {
        encode_fields(
            self.nonce,
            self.transferred_amount,
            self.locks_root,
            self.channel,
            self.extra_hash,
        )
    }

    pub fn digest(&self) -> B256 {
        keccak256(self.encode())
    }

    fn digest_of(
        nonce: u64,
        transferred_amount: U256,
        locks_root: B256,
        channel: Address,
        extra_hash: B256,
    ) -> B256 {
        keccak256(encode_fields(
            nonce,
            transferred_amount,
            locks_root,
            channel,
            extra_hash,
        ))
    }

    pub fn recover_signer(&self) -> Result<Address, ProofError> {
        self.signature
            .recover(self.digest())
            .map_err(|_| ProofError::InvalidSignature)
    }

    /// Checks the signature against the expected issuer and the nonce against
    /// the last nonce accepted from that issuer on this channel.
    pub fn verify(&self, expected_signer: Address, last_accepted_nonce: u64) -> Result<(), ProofError> {
        if self.nonce <= last_accepted_nonce {
            return Err(ProofError::StaleNonce {
                proof: self.nonce,
                current: last_accepted_nonce,
            });
        }
        if self.recover_signer()? != expected_signer {
            return Err(ProofError::InvalidSignature);
        }
        Ok(())
    }

    /// Full wire form: encoded fields followed by the 65-byte signature.
    pub fn to_wire(&self) -> [u8; Self::WIRE_LENGTH] {
        let mut bytes = [0u8; Self::WIRE_LENGTH];
        bytes[..Self::ENCODED_LENGTH].copy_from_slice(&self.encode());
        bytes[Self::ENCODED_LENGTH..].copy_from_slice(&self.signature.to_bytes());
        bytes
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_LENGTH {
            return None;
        }
        let nonce = u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"));
        let transferred_amount = U256::from_be_slice(&bytes[8..40]);
        let locks_root = B256::from_slice(&bytes[40..72]);
        let channel = Address::from_slice(&bytes[72..92]);
        let extra_hash = B256::from_slice(&bytes[92..124]);
        let signature = EcdsaSignature::from_slice(&bytes[124..]).ok()?;
        Some(BalanceProof {
            nonce,
            transferred_amount,
            locks_root,
            channel,
            extra_hash,
            signature,
        })
    }
}

fn encode_fields(
    nonce: u64,
    transferred_amount: U256,
    locks_root: B256,
    channel: Address,
    extra_hash: B256,
) -> [u8; BalanceProof::ENCODED_LENGTH] {
    let mut bytes = [0u8; BalanceProof::ENCODED_LENGTH];
    bytes[..8].copy_from_slice(&nonce.to_be_bytes());
    bytes[8..40].copy_from_slice(&transferred_amount.to_be_bytes::<32>());
    bytes[40..72].copy_from_slice(locks_root.as_slice());
    bytes[72..92].copy_from_slice(channel.as_slice());
    bytes[92..124].copy_from_slice(extra_hash.as_slice());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof(key: &Privkey, nonce: u64) -> BalanceProof {
        BalanceProof::new_signed(
            nonce,
            U256::from(1000u64),
            keccak256(b"locks"),
            Address::repeat_byte(0x11),
            keccak256(b"extra"),
            key,
        )
    }

    #[test]
    fn test_signer_recovery() {
        let key = Privkey::from([3u8; 32]);
        let proof = sample_proof(&key, 1);
        assert_eq!(proof.recover_signer().unwrap(), key.address());
        assert!(proof.verify(key.address(), 0).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let key = Privkey::from([3u8; 32]);
        let other = Privkey::from([4u8; 32]);
        let proof = sample_proof(&key, 1);
        assert_eq!(
            proof.verify(other.address(), 0),
            Err(ProofError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_rejects_stale_nonce() {
        let key = Privkey::from([3u8; 32]);
        let proof = sample_proof(&key, 5);
        assert_eq!(
            proof.verify(key.address(), 5),
            Err(ProofError::StaleNonce { proof: 5, current: 5 })
        );
        assert_eq!(
            proof.verify(key.address(), 9),
            Err(ProofError::StaleNonce { proof: 5, current: 9 })
        );
    }

    #[test]
    fn test_tampered_fields_fail_verification() {
        let key = Privkey::from([3u8; 32]);
        let mut proof = sample_proof(&key, 1);
        proof.transferred_amount = U256::from(2000u64);
        assert_ne!(proof.recover_signer().unwrap(), key.address());
    }

    #[test]
    fn test_wire_round_trip() {
        let key = Privkey::from([3u8; 32]);
        let proof = sample_proof(&key, 7);
        let decoded = BalanceProof::from_wire(&proof.to_wire()).unwrap();
        assert_eq!(decoded, proof);
        assert!(BalanceProof::from_wire(&proof.to_wire()[1..]).is_none());
    }

    #[test]
    fn test_encoding_is_fixed_width_big_endian() {
        let key = Privkey::from([3u8; 32]);
        let proof = sample_proof(&key, 0x0102030405060708);
        let encoded = proof.encode();
        assert_eq!(&encoded[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(encoded.len(), BalanceProof::ENCODED_LENGTH);
        assert_eq!(
            U256::from_be_slice(&encoded[8..40]),
            proof.transferred_amount
        );
    }
}
