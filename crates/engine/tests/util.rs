//! Shared fixture builders for the engine tests: deterministic actors with
//! real Ed25519 keys, keyblock assembly, and read-back helpers over the
//! record graph.
#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use tempfile::TempDir;

use trustdb_core::keyring::{Keyring, SecretKey};
use trustdb_core::packet::{
    Keyblock, Packet, PublicKey, SigPacket, SubpktType, UserId, SIG_CLASS_CERT,
};
use trustdb_core::record::Lid;
use trustdb_engine::{TrustDb, TrustOptions};
use trustdb_store::{Store, StoreOptions};

/// One participant: signing key, public key packet, and uid string.
pub struct Actor {
    pub sk: SigningKey,
    pub pk: PublicKey,
    pub name: String,
}

pub fn actor(seed: u8, created_at: u64, name: &str) -> Actor {
    let sk = SigningKey::from_bytes(&[seed; 32]);
    let pk = PublicKey::new(sk.verifying_key().to_bytes(), created_at);
    Actor {
        sk,
        pk,
        name: name.to_string(),
    }
}

impl Actor {
    pub fn fpr(&self) -> [u8; 20] {
        self.pk.fingerprint()
    }

    pub fn keyid(&self) -> u64 {
        self.pk.keyid()
    }

    pub fn secret(&self) -> SecretKey {
        SecretKey::new(&self.sk, self.pk.created_at)
    }
}

/// Keyblock with one uid, a self-signature carrying preference subpackets,
/// and one certification per listed signer.
pub fn block_with_certs(owner: &Actor, certifiers: &[&Actor]) -> Keyblock {
    block_with_prefs_and_certs(
        owner,
        &[(SubpktType::PrefSym, vec![9, 8]), (SubpktType::PrefHash, vec![10])],
        certifiers,
    )
}

pub fn block_with_prefs_and_certs(
    owner: &Actor,
    prefs: &[(SubpktType, Vec<u8>)],
    certifiers: &[&Actor],
) -> Keyblock {
    let uid = UserId::new(owner.name.clone());
    let fpr = owner.pk.fingerprint();
    let mut kb = Keyblock::new(owner.pk.clone());
    kb.push(Packet::UserId(uid.clone()));
    kb.push(Packet::Signature(SigPacket::sign_over(
        &fpr,
        &uid.namehash(),
        SIG_CLASS_CERT,
        &owner.sk,
        owner.pk.keyid(),
        prefs.to_vec(),
        owner.pk.created_at,
    )));
    for c in certifiers {
        kb.push(Packet::Signature(SigPacket::sign_over(
            &fpr,
            &uid.namehash(),
            SIG_CLASS_CERT,
            &c.sk,
            c.pk.keyid(),
            vec![],
            owner.pk.created_at + 5,
        )));
    }
    kb
}

pub fn self_signed_block(owner: &Actor) -> Keyblock {
    block_with_certs(owner, &[])
}

/// A database over a temp directory; the directory lives as long as this.
pub struct TestDb {
    pub tmp: TempDir,
    pub db: TrustDb,
}

pub fn open_db(ring: Keyring) -> TestDb {
    open_db_with(ring, TrustOptions::default())
}

pub fn open_db_with(ring: Keyring, opts: TrustOptions) -> TestDb {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = Store::open(&tmp.path().join("tdb"), StoreOptions::default()).expect("open store");
    TestDb {
        tmp,
        db: TrustDb::new(store, ring, opts),
    }
}

/// Every non-deleted `(signer_lid, flag)` slot under a directory, walk order.
pub fn slots_of(db: &TrustDb, lid: Lid) -> Vec<(u64, u8)> {
    let store = db.store();
    let dir = store.read_dir(lid).expect("dir record");
    let mut out = Vec::new();
    let mut uid_rn = dir.uidlist;
    while uid_rn != 0 {
        let urec = store.read_uid(uid_rn).expect("uid record");
        let mut sig_rn = urec.siglist;
        while sig_rn != 0 {
            let srec = store.read_sig(sig_rn).expect("sig record");
            for slot in &srec.sigs {
                if slot.lid != 0 {
                    out.push((slot.lid, slot.flag));
                }
            }
            sig_rn = srec.next;
        }
        uid_rn = urec.next;
    }
    out
}

/// Packed preference payloads under a directory, uid order then chain order.
pub fn prefs_of(db: &TrustDb, lid: Lid) -> Vec<Vec<u8>> {
    let store = db.store();
    let dir = store.read_dir(lid).expect("dir record");
    let mut out = Vec::new();
    let mut uid_rn = dir.uidlist;
    while uid_rn != 0 {
        let urec = store.read_uid(uid_rn).expect("uid record");
        let mut recno = urec.prefrec;
        while recno != 0 {
            let prec = store.read_pref(recno).expect("pref record");
            out.push(prec.data.to_vec());
            recno = prec.next;
        }
        uid_rn = urec.next;
    }
    out
}

/// All LIDs noted in a shadow directory's hint list.
pub fn hints_of(db: &TrustDb, sdir_recno: u64) -> Vec<u64> {
    let store = db.store();
    let sdir = store.read_sdir(sdir_recno).expect("sdir record");
    let mut out = Vec::new();
    let mut recno = sdir.hintlist;
    while recno != 0 {
        let hlst = store.read_hlst(recno).expect("hlst record");
        out.extend(hlst.rnum.iter().copied().filter(|r| *r != 0));
        recno = hlst.next;
    }
    out
}

/// Record numbers of the UID records under a directory, list order.
pub fn uids_of(db: &TrustDb, lid: Lid) -> Vec<u64> {
    let store = db.store();
    let dir = store.read_dir(lid).expect("dir record");
    let mut out = Vec::new();
    let mut uid_rn = dir.uidlist;
    while uid_rn != 0 {
        out.push(uid_rn);
        uid_rn = store.read_uid(uid_rn).expect("uid record").next;
    }
    out
}

/// Record numbers of the KEY records under a directory, list order.
pub fn keys_of(db: &TrustDb, lid: Lid) -> Vec<u64> {
    let store = db.store();
    let dir = store.read_dir(lid).expect("dir record");
    let mut out = Vec::new();
    let mut recno = dir.keylist;
    while recno != 0 {
        out.push(recno);
        recno = store.read_key(recno).expect("key record").next;
    }
    out
}
