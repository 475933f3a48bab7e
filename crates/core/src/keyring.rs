//! In-memory keyring: public keyblocks plus the operator's secret keys.
//!
//! The trust engine treats this as its key source: lookup by key id,
//! fingerprint, or user-id substring, secret-key enumeration for the
//! ultimate-root registry, and the signature check used when reconciling the
//! stored graph. Keyrings round-trip through CBOR files for the CLI.

use std::fs;
use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::KeyId;
use crate::packet::{Keyblock, PublicKey, SigTarget};

#[derive(Debug)]
pub enum KeyringError {
    Io(std::io::Error),
    Cbor(serde_cbor::Error),
}

impl From<std::io::Error> for KeyringError {
    fn from(e: std::io::Error) -> Self {
        KeyringError::Io(e)
    }
}
impl From<serde_cbor::Error> for KeyringError {
    fn from(e: serde_cbor::Error) -> Self {
        KeyringError::Cbor(e)
    }
}
impl std::fmt::Display for KeyringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyringError::Io(e) => write!(f, "keyring i/o: {e}"),
            KeyringError::Cbor(e) => write!(f, "keyring codec: {e}"),
        }
    }
}
impl std::error::Error for KeyringError {}

/// Outcome of a signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigCheck {
    Good,
    /// The signer's public key is not available.
    NoPubkey,
    /// The signature did not verify (or the packet is malformed).
    Bad,
}

/// A local secret key together with its public half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretKey {
    pub pk: PublicKey,
    seed: [u8; 32],
}

impl SecretKey {
    pub fn new(sk: &SigningKey, created_at: u64) -> Self {
        let pk = PublicKey::new(sk.verifying_key().to_bytes(), created_at);
        SecretKey {
            pk,
            seed: sk.to_bytes(),
        }
    }

    /// Generate a fresh local key.
    pub fn generate(created_at: u64) -> Self {
        Self::new(&SigningKey::generate(&mut OsRng), created_at)
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.seed)
    }

    pub fn keyid(&self) -> KeyId {
        self.pk.keyid()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keyring {
    blocks: Vec<Keyblock>,
    secrets: Vec<SecretKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_keyblock(&mut self, kb: Keyblock) {
        self.blocks.push(kb);
    }

    pub fn add_secret(&mut self, sk: SecretKey) {
        self.secrets.push(sk);
    }

    pub fn keyblocks(&self) -> &[Keyblock] {
        &self.blocks
    }

    /// Enumerate the operator's secret keys.
    pub fn enum_secret_keys(&self) -> impl Iterator<Item = &SecretKey> {
        self.secrets.iter()
    }

    /// Look up a public key (primary or subkey) by key id.
    pub fn get_pubkey(&self, keyid: KeyId) -> Option<PublicKey> {
        self.blocks
            .iter()
            .flat_map(|kb| kb.keys())
            .find(|pk| pk.keyid() == keyid)
            .cloned()
    }

    /// Look up a public key by exact fingerprint.
    pub fn get_pubkey_byfprint(&self, fpr: &[u8]) -> Option<PublicKey> {
        self.blocks
            .iter()
            .flat_map(|kb| kb.keys())
            .find(|pk| pk.fingerprint() == fpr)
            .cloned()
    }

    /// Look up a primary key by user-id substring.
    pub fn get_pubkey_byname(&self, name: &str) -> Option<PublicKey> {
        self.blocks
            .iter()
            .find(|kb| kb.user_ids().any(|u| u.name.contains(name)))
            .and_then(|kb| kb.primary())
            .cloned()
    }

    /// Look up the keyblock holding a key with the given fingerprint.
    pub fn get_keyblock_byfprint(&self, fpr: &[u8]) -> Option<&Keyblock> {
        self.blocks
            .iter()
            .find(|kb| kb.keys().any(|pk| pk.fingerprint() == fpr))
    }

    /// Check the signature packet at `sig_index` of `kb` against the key
    /// material this keyring knows. Returns the verdict and whether the
    /// signature was made by the keyblock's own primary key.
    pub fn check_key_signature(&self, kb: &Keyblock, sig_index: usize) -> (SigCheck, bool) {
        let sig = match kb.packets.get(sig_index) {
            Some(crate::packet::Packet::Signature(s)) => s,
            _ => return (SigCheck::Bad, false),
        };
        let primary = match kb.primary() {
            Some(pk) => pk,
            None => return (SigCheck::Bad, false),
        };
        let is_selfsig = sig.signer_keyid == primary.keyid();

        let target = match kb.sig_target(sig_index) {
            Some(t) => t,
            None => return (SigCheck::Bad, is_selfsig),
        };
        let target_bytes: &[u8] = match &target {
            SigTarget::Uid(nh) => nh,
            SigTarget::Key(fpr) => fpr,
            SigTarget::Primary => &[],
        };

        let signer_key = if is_selfsig {
            primary.key
        } else {
            match self.get_pubkey(sig.signer_keyid) {
                Some(pk) => pk.key,
                None => return (SigCheck::NoPubkey, is_selfsig),
            }
        };

        let fpr = primary.fingerprint();
        if sig.verify_over(&fpr, target_bytes, &signer_key) {
            (SigCheck::Good, is_selfsig)
        } else {
            (SigCheck::Bad, is_selfsig)
        }
    }

    /// Load a keyring from a CBOR file.
    pub fn load(path: &Path) -> Result<Self, KeyringError> {
        let data = fs::read(path)?;
        Ok(serde_cbor::from_slice(&data)?)
    }

    /// Save this keyring to a CBOR file.
    pub fn save(&self, path: &Path) -> Result<(), KeyringError> {
        let data = serde_cbor::to_vec(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, SigPacket, UserId, SIG_CLASS_CERT};

    fn signed_block(name: &str, ts: u64) -> (SigningKey, Keyblock) {
        let secret = SecretKey::generate(ts);
        let sk = secret.signing_key();
        let pk = secret.pk.clone();
        let uid = UserId::new(name);
        let fpr = pk.fingerprint();
        let keyid = pk.keyid();
        let mut kb = Keyblock::new(pk);
        kb.push(Packet::UserId(uid.clone()));
        kb.push(Packet::Signature(SigPacket::sign_over(
            &fpr,
            &uid.namehash(),
            SIG_CLASS_CERT,
            &sk,
            keyid,
            vec![],
            ts,
        )));
        (sk, kb)
    }

    #[test]
    fn lookups_by_keyid_fpr_and_name() {
        let (_, kb) = signed_block("alice <alice@example.org>", 1_000);
        let pk = kb.primary().unwrap().clone();
        let mut ring = Keyring::new();
        ring.add_keyblock(kb);

        assert_eq!(ring.get_pubkey(pk.keyid()).unwrap().key, pk.key);
        assert_eq!(
            ring.get_pubkey_byfprint(&pk.fingerprint()).unwrap().key,
            pk.key
        );
        assert_eq!(ring.get_pubkey_byname("alice").unwrap().key, pk.key);
        assert!(ring.get_pubkey_byname("nobody").is_none());
        assert!(ring.get_keyblock_byfprint(&pk.fingerprint()).is_some());
    }

    #[test]
    fn self_signature_checks_without_ring_lookup() {
        let (_, kb) = signed_block("alice", 1_000);
        let ring = Keyring::new();
        let (check, selfsig) = ring.check_key_signature(&kb, 2);
        assert_eq!(check, SigCheck::Good);
        assert!(selfsig);
    }

    #[test]
    fn foreign_signature_needs_signer_in_ring() {
        let (_, mut kb) = signed_block("alice", 1_000);
        let (signer_sk, signer_kb) = signed_block("bob", 1_001);
        let signer_pk = signer_kb.primary().unwrap().clone();

        let fpr = kb.primary().unwrap().fingerprint();
        let uid_hash = crate::crypto::namehash("alice");
        kb.push(Packet::Signature(SigPacket::sign_over(
            &fpr,
            &uid_hash,
            SIG_CLASS_CERT,
            &signer_sk,
            signer_pk.keyid(),
            vec![],
            1_002,
        )));
        let sig_index = kb.packets.len() - 1;

        let mut ring = Keyring::new();
        let (check, selfsig) = ring.check_key_signature(&kb, sig_index);
        assert_eq!(check, SigCheck::NoPubkey);
        assert!(!selfsig);

        ring.add_keyblock(signer_kb);
        let (check, _) = ring.check_key_signature(&kb, sig_index);
        assert_eq!(check, SigCheck::Good);
    }

    #[test]
    fn cbor_file_roundtrip() {
        let (sk, kb) = signed_block("alice", 1_000);
        let mut ring = Keyring::new();
        ring.add_secret(SecretKey::new(&sk, 1_000));
        ring.add_keyblock(kb);

        let dir = std::env::temp_dir().join("trustdb-keyring-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ring.cbor");
        ring.save(&path).unwrap();
        let back = Keyring::load(&path).unwrap();
        assert_eq!(back.keyblocks().len(), 1);
        assert_eq!(back.enum_secret_keys().count(), 1);
        std::fs::remove_file(&path).ok();
    }
}
