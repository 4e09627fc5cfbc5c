use crate::address::Address;
use crate::error::{Result, TypesError};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigType {
    Ed25519,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub sig_type: SigType,
    pub data: Vec<u8>,
}

impl Signature {
    pub fn new_ed25519(data: Vec<u8>) -> Self {
        Self {
            sig_type: SigType::Ed25519,
            data,
        }
    }

    /// Verify this signature against a key address.
    pub fn verify(&self, signer: &Address, message: &[u8]) -> Result<()> {
        let key_bytes = signer.public_key().ok_or_else(|| {
            TypesError::InvalidSignature(format!("{} is not a key address", signer))
        })?;
        let key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|e| TypesError::InvalidSignature(e.to_string()))?;
        let raw: [u8; 64] = self
            .data
            .as_slice()
            .try_into()
            .map_err(|_| TypesError::InvalidSignature("expected 64 bytes".to_string()))?;
        key.verify(message, &ed25519_dalek::Signature::from_bytes(&raw))
            .map_err(|e| TypesError::InvalidSignature(e.to_string()))
    }
}

/// An ed25519 keypair bound to its key address.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::new_ed25519(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"voucher");
        assert!(sig.verify(&kp.address(), b"voucher").is_ok());
        assert!(sig.verify(&kp.address(), b"tampered").is_err());
        assert!(sig.verify(&KeyPair::generate().address(), b"voucher").is_err());
        assert!(sig.verify(&Address::new_id(1), b"voucher").is_err());
    }
}
