//! Digests and key-id derivation for the trust database.
//!
//! Everything the record graph keys on is a domain-separated BLAKE3 digest:
//! the 20-byte key fingerprint stored in KEY records and the 20-byte user-id
//! name hash stored in UID records. (The 32-byte digest a certification
//! signature covers lives with the signature packets.) Key ids are the
//! trailing 64 bits of a fingerprint.

use blake3::Hasher;

pub type PublicKeyBytes = [u8; 32];
pub type KeyId = u64;

const FPR_DOMAIN: &[u8] = b"TRUSTDB_FPR_V1";
const NAME_DOMAIN: &[u8] = b"TRUSTDB_UID_V1";

fn hash20(domain: &[u8], parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Hasher::new();
    hasher.update(domain);
    for p in parts {
        hasher.update(p);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..20]);
    out
}

/// 20-byte fingerprint over a key's algorithm, creation time, and material.
pub fn key_fingerprint(pubkey_algo: u8, created_at: u64, key: &PublicKeyBytes) -> [u8; 20] {
    hash20(
        FPR_DOMAIN,
        &[&[pubkey_algo], &created_at.to_be_bytes(), key],
    )
}

/// 20-byte hash of a user-id string, the matching key for UID records.
pub fn namehash(name: &str) -> [u8; 20] {
    hash20(NAME_DOMAIN, &[name.as_bytes()])
}

/// Key id from a fingerprint: trailing 8 bytes, big-endian.
/// Shorter fingerprints are zero-extended on the left.
pub fn keyid_from_fingerprint(fpr: &[u8]) -> KeyId {
    let mut buf = [0u8; 8];
    let n = fpr.len().min(8);
    buf[8 - n..].copy_from_slice(&fpr[fpr.len() - n..]);
    u64::from_be_bytes(buf)
}
