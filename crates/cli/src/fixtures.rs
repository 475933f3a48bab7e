//! Deterministic demo keyring: one local key plus a small certification web,
//! handy for trying the commands without real key material.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;

use trustdb_core::keyring::{Keyring, SecretKey};
use trustdb_core::packet::{
    Keyblock, Packet, PublicKey, SigPacket, SubpktType, UserId, SIG_CLASS_CERT,
};

/// Keys are derived from fixed seeds so repeated runs produce the same ring.
fn demo_key(seed_byte: u8, created_at: u64) -> (SigningKey, PublicKey) {
    let sk = SigningKey::from_bytes(&[seed_byte; 32]);
    let pk = PublicKey::new(sk.verifying_key().to_bytes(), created_at);
    (sk, pk)
}

fn signed_block(
    pk: &PublicKey,
    sk: &SigningKey,
    name: &str,
    certifiers: &[(&SigningKey, &PublicKey)],
) -> Keyblock {
    let uid = UserId::new(name);
    let fpr = pk.fingerprint();
    let mut kb = Keyblock::new(pk.clone());
    kb.push(Packet::UserId(uid.clone()));
    kb.push(Packet::Signature(SigPacket::sign_over(
        &fpr,
        &uid.namehash(),
        SIG_CLASS_CERT,
        sk,
        pk.keyid(),
        vec![
            (SubpktType::PrefSym, vec![9, 8, 7]),
            (SubpktType::PrefHash, vec![10, 8]),
        ],
        pk.created_at,
    )));
    for (csk, cpk) in certifiers {
        kb.push(Packet::Signature(SigPacket::sign_over(
            &fpr,
            &uid.namehash(),
            SIG_CLASS_CERT,
            csk,
            cpk.keyid(),
            vec![],
            pk.created_at + 1,
        )));
    }
    kb
}

pub fn cmd_gen_fixtures(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let (alice_sk, alice_pk) = demo_key(1, 1_000_000);
    let (bob_sk, bob_pk) = demo_key(2, 1_000_100);
    let (carol_sk, carol_pk) = demo_key(3, 1_000_200);
    let (dave_sk, dave_pk) = demo_key(4, 1_000_300);

    let mut ring = Keyring::new();
    // alice is the local operator key
    ring.add_secret(SecretKey::new(&alice_sk, 1_000_000));
    ring.add_keyblock(signed_block(&alice_pk, &alice_sk, "alice <alice@example.org>", &[]));
    // alice certifies bob, bob certifies carol, carol certifies dave
    ring.add_keyblock(signed_block(
        &bob_pk,
        &bob_sk,
        "bob <bob@example.org>",
        &[(&alice_sk, &alice_pk)],
    ));
    ring.add_keyblock(signed_block(
        &carol_pk,
        &carol_sk,
        "carol <carol@example.org>",
        &[(&bob_sk, &bob_pk)],
    ));
    ring.add_keyblock(signed_block(
        &dave_pk,
        &dave_sk,
        "dave <dave@example.org>",
        &[(&carol_sk, &carol_pk)],
    ));

    let path = dir.join("keyring.cbor");
    ring.save(&path)
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    println!("try: trustdb --keyring {} init", path.display());
    Ok(())
}
