use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// A device's or server's long-term Ed25519 keypair, used only during the
/// handshake to authenticate the challenge/response exchange. Session
/// traffic itself is protected by the derived `SessionKeys`, not this key.
#[derive(Clone)]
pub struct NodeCredentials {
    pub signing: SigningKey,
    pub verifying: VerifyingKey,
}

impl NodeCredentials {
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    pub fn generate<R: rand_core::CryptoRngCore>(rng: &mut R) -> Self {
        let signing = SigningKey::generate(rng);
        Self::from_signing_key(signing)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify(message, signature).is_ok()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }
}

impl std::fmt::Debug for NodeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCredentials")
            .field("verifying", &self.verifying)
            .finish_non_exhaustive()
    }
}

/// Verifies a detached signature against a raw public key, without needing a
/// full `NodeCredentials`. Used by the server when checking a device's
/// handshake signature against the key on file in the `DeviceKeyStore`.
pub fn verify_with_public_key(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let verifying = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    verifying.verify(message, &signature).is_ok()
}
