//! Local Schnorr keypair and the signer seam.
//!
//! [`Keys`] wraps a secp256k1 keypair; anything that can produce a BIP-340
//! signature over a 32-byte digest (a remote signer, a hardware wallet)
//! implements [`Signer`].

use secp256k1::{All, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};

use crate::error::{Error, Result};
use crate::event::{PublicKey, Signature};

/// Signs event digests on behalf of a single public key.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// BIP-340 sign the raw 32-byte digest (not its hex form).
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature>;
}

/// An in-process secp256k1 keypair.
#[derive(Clone)]
pub struct Keys {
    secp: Secp256k1<All>,
    keypair: Keypair,
    public_key: PublicKey,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (xonly, _) = XOnlyPublicKey::from_keypair(&keypair);
        Self {
            secp,
            keypair,
            public_key: PublicKey::from_bytes(xonly.serialize()),
        }
    }

    /// Load a keypair from a 64-char hex secret key.
    pub fn parse(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex).map_err(|e| Error::Signer(format!("secret key: {e}")))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| Error::Signer(format!("secret key: {e}")))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (xonly, _) = XOnlyPublicKey::from_keypair(&keypair);
        Ok(Self {
            secp,
            keypair,
            public_key: PublicKey::from_bytes(xonly.serialize()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Hex form of the secret key. Handle with care.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret half.
        write!(f, "Keys({})", self.public_key)
    }
}

impl Signer for Keys {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature> {
        let message = Message::from_digest(*digest);
        let sig = self.secp.sign_schnorr(&message, &self.keypair);
        Ok(Signature::from_bytes(sig.serialize()))
    }
}
