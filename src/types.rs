use once_cell::sync::OnceCell;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use thiserror::Error;

use crate::serde_utils::SliceHex;

pub use alloy_primitives::{keccak256, Address, B256, U256};

/// Block height on the settlement layer.
pub type BlockNumber = u64;

pub fn secp256k1_instance() -> &'static Secp256k1<All> {
    static INSTANCE: OnceCell<Secp256k1<All>> = OnceCell::new();
    INSTANCE.get_or_init(Secp256k1::new)
}

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Invalid signature length: {0}")]
    InvalidLength(usize),
    #[error("Invalid recovery id: {0}")]
    InvalidRecoveryId(u8),
    #[error("Signature recovery failed: {0}")]
    Recovery(#[from] secp256k1::Error),
}

#[derive(Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Privkey(pub SecretKey);

impl From<[u8; 32]> for Privkey {
    fn from(k: [u8; 32]) -> Self {
        Privkey(SecretKey::from_slice(&k).expect("Invalid secret key"))
    }
}

impl From<SecretKey> for Privkey {
    fn from(sk: SecretKey) -> Self {
        Self(sk)
    }
}

impl ::core::fmt::Debug for Privkey {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Privkey(..)")
    }
}

impl Privkey {
    pub fn from_slice(key: &[u8]) -> Self {
        SecretKey::from_slice(key)
            .expect("Invalid secret key")
            .into()
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey(self.0.public_key(secp256k1_instance()))
    }

    pub fn address(&self) -> Address {
        self.pubkey().address()
    }

    /// Produces a recoverable signature over a 32-byte digest.
    pub fn sign(&self, digest: B256) -> EcdsaSignature {
        let message = Message::from_digest(digest.0);
        EcdsaSignature(secp256k1_instance().sign_ecdsa_recoverable(&message, &self.0))
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Pubkey(pub PublicKey);

impl From<PublicKey> for Pubkey {
    fn from(pk: PublicKey) -> Self {
        Pubkey(pk)
    }
}

impl Pubkey {
    /// The rightmost 20 bytes of the keccak-256 hash of the uncompressed key,
    /// the settlement layer's account address derivation.
    pub fn address(&self) -> Address {
        let uncompressed = self.0.serialize_uncompressed();
        let digest = keccak256(&uncompressed[1..]);
        Address::from_slice(&digest[12..])
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EcdsaSignature(pub RecoverableSignature);

impl EcdsaSignature {
    pub const LENGTH: usize = 65;

    /// r ‖ s ‖ v with v in {27, 28}.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let (recid, compact) = self.0.serialize_compact();
        let mut bytes = [0u8; Self::LENGTH];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = 27 + recid.to_i32() as u8;
        bytes
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, SignatureError> {
        if slice.len() != Self::LENGTH {
            return Err(SignatureError::InvalidLength(slice.len()));
        }
        let v = slice[64];
        let recid = match v {
            0 | 1 => v,
            27 | 28 => v - 27,
            _ => return Err(SignatureError::InvalidRecoveryId(v)),
        };
        let recid = RecoveryId::from_i32(recid as i32)?;
        Ok(EcdsaSignature(RecoverableSignature::from_compact(
            &slice[..64],
            recid,
        )?))
    }

    /// Recovers the signer's address from the signature over `digest`.
    pub fn recover(&self, digest: B256) -> Result<Address, SignatureError> {
        let message = Message::from_digest(digest.0);
        let pubkey = secp256k1_instance().recover_ecdsa(&message, &self.0)?;
        Ok(Pubkey(pubkey).address())
    }
}

impl Serialize for EcdsaSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        crate::serde_utils::to_hex(self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for EcdsaSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = crate::serde_utils::from_hex(deserializer)?;
        EcdsaSignature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// The preimage of a hashlock. Chosen by the transfer initiator, revealed to
/// settle the route's locks off-chain or registered on-chain near expiry.
#[serde_as]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Secret(#[serde_as(as = "SliceHex")] [u8; 32]);

impl Secret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Secret(bytes)
    }

    /// Secrets are drawn at event-creation time only; transitions replayed
    /// from the log must never reach for randomness themselves.
    pub fn generate() -> Self {
        Secret(rand::random())
    }

    pub fn hashlock(&self) -> B256 {
        keccak256(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Secret {
    fn from(bytes: [u8; 32]) -> Self {
        Secret(bytes)
    }
}

impl TryFrom<Vec<u8>> for Secret {
    type Error = Vec<u8>;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        <[u8; 32]>::try_from(value).map(Secret)
    }
}

impl AsRef<[u8]> for Secret {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl ::core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Secret(hashlock {:#x})", self.hashlock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_recover() {
        let key = Privkey::from([42u8; 32]);
        let digest = keccak256(b"volt");
        let signature = key.sign(digest);
        assert_eq!(signature.recover(digest).unwrap(), key.address());
    }

    #[test]
    fn test_signature_byte_round_trip() {
        let key = Privkey::from([7u8; 32]);
        let digest = keccak256(b"round trip");
        let signature = key.sign(digest);
        let bytes = signature.to_bytes();
        assert!(bytes[64] == 27 || bytes[64] == 28);
        assert_eq!(EcdsaSignature::from_slice(&bytes).unwrap(), signature);
    }

    #[test]
    fn test_signature_rejects_bad_recovery_id() {
        let key = Privkey::from([7u8; 32]);
        let mut bytes = key.sign(keccak256(b"x")).to_bytes();
        bytes[64] = 99;
        assert!(matches!(
            EcdsaSignature::from_slice(&bytes),
            Err(SignatureError::InvalidRecoveryId(99))
        ));
    }

    #[test]
    fn test_secret_hashlock() {
        let secret = Secret::new([1u8; 32]);
        assert_eq!(secret.hashlock(), keccak256([1u8; 32]));
    }

    #[test]
    fn test_secret_serializes_as_prefixed_hex() {
        let secret = Secret::new([0xabu8; 32]);
        let serialized = serde_json::to_string(&secret).unwrap();
        assert_eq!(serialized, format!("\"0x{}\"", "ab".repeat(32)));
        let deserialized: Secret = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, secret);
    }

    #[test]
    fn test_signature_serde_round_trip() {
        let key = Privkey::from([6u8; 32]);
        let signature = key.sign(keccak256(b"serde"));
        let serialized = serde_json::to_string(&signature).unwrap();
        let deserialized: EcdsaSignature = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, signature);
    }
}
