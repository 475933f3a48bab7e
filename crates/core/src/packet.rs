//! In-memory keyblock model: packets in canonical order and the digest rules
//! for certification signatures.
//!
//! A keyblock is one primary public key followed by user ids, subkeys, and
//! signatures; a signature packet applies to the nearest preceding user id
//! (certification classes) or key (binding/revocation classes). What gets
//! signed is a domain-separated digest over the primary fingerprint, the
//! target, the class, the signer's key id, and the hashed subpackets.

use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{key_fingerprint, keyid_from_fingerprint, namehash, KeyId, PublicKeyBytes};

/// Domain separator for the digest a certification signature covers.
const CERT_DOMAIN: &[u8] = b"TRUSTDB_CERT_V1";

/// Ed25519 public key algorithm id.
pub const PUBKEY_ALGO_EDDSA: u8 = 22;

/// Certification classes are 0x10..=0x13.
pub const SIG_CLASS_CERT: u8 = 0x10;
pub const SIG_CLASS_SUBKEY_BIND: u8 = 0x18;
pub const SIG_CLASS_KEY_REVOKE: u8 = 0x20;
pub const SIG_CLASS_SUBKEY_REVOKE: u8 = 0x28;
pub const SIG_CLASS_CERT_REVOKE: u8 = 0x30;

/// True for the four user-id certification classes.
pub fn is_certification_class(sig_class: u8) -> bool {
    sig_class & !0x03 == SIG_CLASS_CERT
}

/// A public key packet (primary or subkey).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKey {
    pub pubkey_algo: u8,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
    /// Expiration time; 0 = never.
    pub expires_at: u64,
    pub key: PublicKeyBytes,
    /// Cached LID of the owning directory record; 0 = not yet resolved.
    /// Runtime-only, never serialized.
    #[serde(skip)]
    pub local_id: u64,
}

impl PublicKey {
    pub fn new(key: PublicKeyBytes, created_at: u64) -> Self {
        PublicKey {
            pubkey_algo: PUBKEY_ALGO_EDDSA,
            created_at,
            expires_at: 0,
            key,
            local_id: 0,
        }
    }

    /// 20-byte fingerprint over (algo, creation time, key material).
    pub fn fingerprint(&self) -> [u8; 20] {
        key_fingerprint(self.pubkey_algo, self.created_at, &self.key)
    }

    pub fn keyid(&self) -> KeyId {
        keyid_from_fingerprint(&self.fingerprint())
    }
}

/// A user identity packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserId {
    pub name: String,
}

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        UserId { name: name.into() }
    }

    pub fn namehash(&self) -> [u8; 20] {
        namehash(&self.name)
    }
}

/// Hashed subpacket types carried by self-signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubpktType {
    PrefSym,
    PrefHash,
    PrefCompr,
}

impl SubpktType {
    /// Wire tag hashed into the certification digest.
    fn tag(self) -> u8 {
        match self {
            SubpktType::PrefSym => 1,
            SubpktType::PrefHash => 2,
            SubpktType::PrefCompr => 3,
        }
    }
}

/// A signature packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigPacket {
    pub sig_class: u8,
    pub signer_keyid: KeyId,
    pub pubkey_algo: u8,
    pub created_at: u64,
    pub subpackets: Vec<(SubpktType, Vec<u8>)>,
    /// Ed25519 signature bytes over the certification digest.
    pub sig: Vec<u8>,
}

impl SigPacket {
    /// First subpacket of the given type, if present.
    pub fn subpacket(&self, t: SubpktType) -> Option<&[u8]> {
        self.subpackets
            .iter()
            .find(|(pt, _)| *pt == t)
            .map(|(_, data)| data.as_slice())
    }

    /// The digest a certification signature covers: primary fingerprint,
    /// class, signer key id, length-framed target, then the hashed
    /// subpackets.
    pub fn cert_digest(
        primary_fpr: &[u8; 20],
        target: &[u8],
        sig_class: u8,
        signer_keyid: KeyId,
        subpackets: &[(SubpktType, Vec<u8>)],
    ) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(CERT_DOMAIN);
        hasher.update(primary_fpr);
        hasher.update(&[sig_class]);
        hasher.update(&signer_keyid.to_be_bytes());
        hasher.update(&(target.len() as u16).to_be_bytes());
        hasher.update(target);
        for (pt, data) in subpackets {
            hasher.update(&[pt.tag()]);
            hasher.update(&(data.len() as u16).to_be_bytes());
            hasher.update(data);
        }
        *hasher.finalize().as_bytes()
    }

    /// Build and sign a certification over `target` (a user-id name hash for
    /// classes 0x10..=0x13, a subkey fingerprint for 0x18/0x28, empty for
    /// key-level classes).
    pub fn sign_over(
        primary_fpr: &[u8; 20],
        target: &[u8],
        sig_class: u8,
        signer: &SigningKey,
        signer_keyid: KeyId,
        subpackets: Vec<(SubpktType, Vec<u8>)>,
        created_at: u64,
    ) -> SigPacket {
        let digest =
            Self::cert_digest(primary_fpr, target, sig_class, signer_keyid, &subpackets);
        let sig = signer.sign(&digest).to_bytes().to_vec();
        SigPacket {
            sig_class,
            signer_keyid,
            pubkey_algo: PUBKEY_ALGO_EDDSA,
            created_at,
            subpackets,
            sig,
        }
    }

    /// Verify this signature against the signer's key material.
    pub fn verify_over(
        &self,
        primary_fpr: &[u8; 20],
        target: &[u8],
        signer_key: &PublicKeyBytes,
    ) -> bool {
        let digest = Self::cert_digest(
            primary_fpr,
            target,
            self.sig_class,
            self.signer_keyid,
            &self.subpackets,
        );
        let Ok(vk) = VerifyingKey::from_bytes(signer_key) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&self.sig) else {
            return false;
        };
        vk.verify(&digest, &sig).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    Primary(PublicKey),
    Subkey(PublicKey),
    UserId(UserId),
    Signature(SigPacket),
}

/// What a signature packet applies to, resolved from keyblock order.
#[derive(Debug, Clone, PartialEq)]
pub enum SigTarget {
    /// Name hash of the preceding user id.
    Uid([u8; 20]),
    /// Fingerprint of the preceding key packet.
    Key([u8; 20]),
    /// Key-level signature with no per-packet target.
    Primary,
}

/// An ordered packet sequence for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyblock {
    pub packets: Vec<Packet>,
}

impl Keyblock {
    pub fn new(primary: PublicKey) -> Self {
        Keyblock {
            packets: vec![Packet::Primary(primary)],
        }
    }

    pub fn push(&mut self, pkt: Packet) {
        self.packets.push(pkt);
    }

    pub fn primary(&self) -> Option<&PublicKey> {
        self.packets.iter().find_map(|p| match p {
            Packet::Primary(pk) => Some(pk),
            _ => None,
        })
    }

    /// All key packets, primary first.
    pub fn keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.packets.iter().filter_map(|p| match p {
            Packet::Primary(pk) | Packet::Subkey(pk) => Some(pk),
            _ => None,
        })
    }

    pub fn user_ids(&self) -> impl Iterator<Item = &UserId> {
        self.packets.iter().filter_map(|p| match p {
            Packet::UserId(u) => Some(u),
            _ => None,
        })
    }

    /// Resolve what the signature at `sig_index` applies to, per canonical
    /// keyblock order. Returns None for an index that is not a signature or
    /// a certification with no preceding user id.
    pub fn sig_target(&self, sig_index: usize) -> Option<SigTarget> {
        let sig = match self.packets.get(sig_index) {
            Some(Packet::Signature(s)) => s,
            _ => return None,
        };
        let mut cur_uid: Option<[u8; 20]> = None;
        let mut cur_key: Option<[u8; 20]> = None;
        for pkt in &self.packets[..sig_index] {
            match pkt {
                Packet::Primary(pk) | Packet::Subkey(pk) => {
                    cur_key = Some(pk.fingerprint());
                    cur_uid = None;
                }
                Packet::UserId(u) => cur_uid = Some(u.namehash()),
                Packet::Signature(_) => {}
            }
        }
        if is_certification_class(sig.sig_class) {
            cur_uid.map(SigTarget::Uid)
        } else if sig.sig_class == SIG_CLASS_SUBKEY_BIND
            || sig.sig_class == SIG_CLASS_SUBKEY_REVOKE
        {
            cur_key.map(SigTarget::Key)
        } else {
            Some(SigTarget::Primary)
        }
    }
}
