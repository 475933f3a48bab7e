//! Structural invariants of the update engine and the evaluator: LID
//! stability, orphan sweeps, preference rebuilds, hint-list completeness,
//! depth bounds, and repeatability.

mod util;

use pretty_assertions::assert_eq;

use trustdb_core::keyring::Keyring;
use trustdb_core::packet::{Packet, SigPacket, SubpktType, SIG_CLASS_CERT};
use trustdb_core::record::{
    RecordKind, PREFTYPE_HASH, PREFTYPE_SYM, SIGF_CHECKED, SIGF_NOPUBKEY, SIGF_VALID,
};
use trustdb_core::trust::{TRUST_FULLY, TRUST_ULTIMATE, TRUST_UNDEFINED};
use trustdb_engine::TrustOptions;

use util::{
    actor, block_with_certs, block_with_prefs_and_certs, hints_of, keys_of, open_db,
    open_db_with, self_signed_block, slots_of, uids_of,
};

const NOW: u64 = 2_000_000;

#[test]
fn lid_is_stable_across_updates() {
    let alice = actor(1, 1_000_000, "alice");
    let bob = actor(2, 1_000_100, "bob");
    let mut ring = Keyring::new();
    ring.add_keyblock(self_signed_block(&bob));

    let mut t = open_db(ring);
    t.db.update_trustdb().unwrap();
    let lid = t.db.store().search_dir_byfpr(&bob.fpr()).unwrap().unwrap();
    assert_eq!(t.db.store().read_dir(lid).unwrap().lid, lid);

    // grow the keyblock: new certifier, then update again
    t.db.keyring_mut().add_keyblock(self_signed_block(&alice));
    let kb2 = block_with_certs(&bob, &[&alice]);
    t.db.update_trust_record(&kb2).unwrap();

    assert_eq!(
        t.db.store().search_dir_byfpr(&bob.fpr()).unwrap(),
        Some(lid)
    );
    assert_eq!(t.db.store().read_dir(lid).unwrap().lid, lid);
}

#[test]
fn hint_list_covers_every_waiting_directory() {
    // carol (absent) certifies bob and dave; one of the two signatures is
    // a forgery that must settle as checked-but-invalid after promotion
    let bob = actor(2, 1_000_100, "bob");
    let dave = actor(4, 1_000_300, "dave");
    let carol = actor(3, 1_000_200, "carol");
    let mallory = actor(66, 1_000_400, "mallory");

    let mut ring = Keyring::new();
    ring.add_keyblock(block_with_certs(&bob, &[&carol]));

    // dave's block carries a signature claiming carol's key id but made
    // with mallory's key
    let mut dave_kb = self_signed_block(&dave);
    let dave_uid_hash = trustdb_core::crypto::namehash(&dave.name);
    let forged = SigPacket::sign_over(
        &dave.fpr(),
        &dave_uid_hash,
        SIG_CLASS_CERT,
        &mallory.sk,
        carol.keyid(),
        vec![],
        1_000_500,
    );
    dave_kb.push(Packet::Signature(forged));
    ring.add_keyblock(dave_kb);

    let mut t = open_db(ring);
    t.db.update_trustdb().unwrap();

    let b_lid = t.db.store().search_dir_byfpr(&bob.fpr()).unwrap().unwrap();
    let d_lid = t.db.store().search_dir_byfpr(&dave.fpr()).unwrap().unwrap();
    let sdir = t
        .db
        .store()
        .search_sdir(carol.keyid(), carol.pk.pubkey_algo)
        .unwrap()
        .unwrap();

    let mut hinted = hints_of(&t.db, sdir);
    hinted.sort_unstable();
    let mut expect = vec![b_lid, d_lid];
    expect.sort_unstable();
    assert_eq!(hinted, expect);
    assert_eq!(slots_of(&t.db, b_lid), vec![(sdir, SIGF_NOPUBKEY)]);
    assert_eq!(slots_of(&t.db, d_lid), vec![(sdir, SIGF_NOPUBKEY)]);

    // promotion settles every deferred slot; none stays unflagged
    t.db.keyring_mut().add_keyblock(self_signed_block(&carol));
    let mut pk = carol.pk.clone();
    t.db.insert_trust_record(&mut pk).unwrap();

    assert_eq!(
        slots_of(&t.db, b_lid),
        vec![(sdir, SIGF_CHECKED | SIGF_VALID)]
    );
    assert_eq!(slots_of(&t.db, d_lid), vec![(sdir, SIGF_CHECKED)]);
}

#[test]
fn invalid_signature_by_known_signer_gets_a_shadow_slot() {
    // alice is present with a real directory; a tampered certification
    // claiming her key id must not leave a slot pointing at that directory
    let alice = actor(1, 1_000_000, "alice");
    let bob = actor(2, 1_000_100, "bob");
    let mallory = actor(66, 1_000_400, "mallory");

    let mut ring = Keyring::new();
    ring.add_keyblock(self_signed_block(&alice));
    let mut bob_kb = self_signed_block(&bob);
    let forged = SigPacket::sign_over(
        &bob.fpr(),
        &trustdb_core::crypto::namehash(&bob.name),
        SIG_CLASS_CERT,
        &mallory.sk,
        alice.keyid(),
        vec![],
        1_000_500,
    );
    bob_kb.push(Packet::Signature(forged));
    ring.add_keyblock(bob_kb);

    let mut t = open_db(ring);
    t.db.update_trustdb().unwrap();

    let a_lid = t.db.store().search_dir_byfpr(&alice.fpr()).unwrap().unwrap();
    let b_lid = t.db.store().search_dir_byfpr(&bob.fpr()).unwrap().unwrap();
    let sdir = t
        .db
        .store()
        .search_sdir(alice.keyid(), alice.pk.pubkey_algo)
        .unwrap()
        .expect("shadow entry stands in for the bad signature");
    assert_ne!(sdir, a_lid);
    assert_eq!(slots_of(&t.db, b_lid), vec![(sdir, SIGF_CHECKED)]);
    assert_eq!(hints_of(&t.db, sdir), vec![b_lid]);

    // the checked-invalid slot contributes nothing to bob's verdict
    let mut pk = bob.pk.clone();
    assert_eq!(t.db.check_trust_at(&mut pk, NOW).unwrap(), TRUST_UNDEFINED);
}

#[test]
fn orphan_sweep_removes_dropped_uids_and_subkeys() {
    let bob = actor(2, 1_000_100, "bob");
    let subkey = actor(20, 1_000_150, "ignored").pk;

    // first version: two uids and a subkey
    let mut kb1 = self_signed_block(&bob);
    let second_uid = trustdb_core::packet::UserId::new("bob-work");
    kb1.push(Packet::UserId(second_uid.clone()));
    kb1.push(Packet::Signature(SigPacket::sign_over(
        &bob.fpr(),
        &second_uid.namehash(),
        SIG_CLASS_CERT,
        &bob.sk,
        bob.keyid(),
        vec![(SubpktType::PrefSym, vec![7])],
        1_000_160,
    )));
    kb1.push(Packet::Subkey(subkey.clone()));

    let mut ring = Keyring::new();
    ring.add_keyblock(kb1);
    let mut t = open_db(ring);
    t.db.update_trustdb().unwrap();

    let lid = t.db.store().search_dir_byfpr(&bob.fpr()).unwrap().unwrap();
    assert_eq!(uids_of(&t.db, lid).len(), 2);
    assert_eq!(keys_of(&t.db, lid).len(), 2);
    let dropped_uid = uids_of(&t.db, lid)[1];
    let dropped_uid_rec = t.db.store().read_uid(dropped_uid).unwrap();
    let dropped_pref = dropped_uid_rec.prefrec;
    let dropped_key = keys_of(&t.db, lid)[1];
    assert_ne!(dropped_pref, 0);

    // second version drops the extra uid and the subkey
    let kb2 = self_signed_block(&bob);
    assert!(t.db.update_trust_record(&kb2).unwrap());

    assert_eq!(uids_of(&t.db, lid).len(), 1);
    assert_eq!(keys_of(&t.db, lid).len(), 1);
    assert_eq!(
        t.db.store().read(dropped_uid).unwrap().kind(),
        RecordKind::Free
    );
    assert_eq!(
        t.db.store().read(dropped_pref).unwrap().kind(),
        RecordKind::Free
    );
    assert_eq!(
        t.db.store().read(dropped_key).unwrap().kind(),
        RecordKind::Free
    );
}

#[test]
fn preference_rebuild_is_idempotent() {
    let bob = actor(2, 1_000_100, "bob");
    let prefs = [
        (SubpktType::PrefSym, vec![9u8, 8, 7]),
        (SubpktType::PrefHash, vec![10u8, 8]),
    ];
    let mut ring = Keyring::new();
    ring.add_keyblock(block_with_prefs_and_certs(&bob, &prefs, &[]));

    let mut t = open_db(ring);
    t.db.update_trustdb().unwrap();
    let lid = t.db.store().search_dir_byfpr(&bob.fpr()).unwrap().unwrap();
    let first = util::prefs_of(&t.db, lid);
    assert_eq!(first.len(), 1);
    assert_eq!(
        &first[0][..10],
        &[
            PREFTYPE_SYM, 9, PREFTYPE_SYM, 8, PREFTYPE_SYM, 7, PREFTYPE_HASH, 10, PREFTYPE_HASH,
            8
        ]
    );

    // a second pass over the same keyblock changes nothing
    let kb = block_with_prefs_and_certs(&bob, &prefs, &[]);
    assert!(!t.db.update_trust_record(&kb).unwrap());
    assert_eq!(util::prefs_of(&t.db, lid), first);

    // an independent store ends up with the same preference bytes even
    // though record numbers differ
    let mut ring2 = Keyring::new();
    ring2.add_keyblock(block_with_prefs_and_certs(&bob, &prefs, &[]));
    let mut t2 = open_db(ring2);
    t2.db.update_trustdb().unwrap();
    let lid2 = t2.db.store().search_dir_byfpr(&bob.fpr()).unwrap().unwrap();
    assert_eq!(util::prefs_of(&t2.db, lid2), first);

    // the engine answers preference queries from the rebuilt chain
    assert!(t.db.is_algo_in_prefs(lid, PREFTYPE_SYM, 9).unwrap());
    assert!(!t.db.is_algo_in_prefs(lid, PREFTYPE_SYM, 1).unwrap());
    assert!(t.db.get_pref_data(lid, None).unwrap().is_some());
}

#[test]
fn keyblock_lid_resolution_and_checked_flag() {
    use trustdb_core::record::{RecordBody, TrustRecord, DIRF_CHECKED};

    let bob = actor(2, 1_000_100, "bob");
    let kb = self_signed_block(&bob);
    let mut ring = Keyring::new();
    ring.add_keyblock(kb.clone());

    let mut t = open_db(ring);
    t.db.update_trustdb().unwrap();
    let lid = t.db.store().search_dir_byfpr(&bob.fpr()).unwrap().unwrap();
    assert_eq!(t.db.lid_from_keyblock(&kb).unwrap(), lid);

    // plant the checked flag, then clear it through the engine
    let mut dir = t.db.store().read_dir(lid).unwrap();
    dir.dirflags |= DIRF_CHECKED;
    t.db.store_mut()
        .write(&TrustRecord::new(lid, RecordBody::Dir(dir)))
        .unwrap();

    let mut pk = bob.pk.clone();
    t.db.clear_trust_checked_flag(&mut pk).unwrap();
    assert_eq!(
        t.db.store().read_dir(lid).unwrap().dirflags & DIRF_CHECKED,
        0
    );
    // a second clear is a no-op
    let mut pk = bob.pk.clone();
    t.db.clear_trust_checked_flag(&mut pk).unwrap();
}

#[test]
fn repeated_checks_are_monotonic() {
    let alice = actor(1, 1_000_000, "alice");
    let bob = actor(2, 1_000_100, "bob");
    let mut ring = Keyring::new();
    ring.add_secret(alice.secret());
    ring.add_keyblock(self_signed_block(&alice));
    ring.add_keyblock(block_with_certs(&bob, &[&alice]));

    let mut t = open_db(ring);
    t.db.init(1).unwrap();
    t.db.update_trustdb().unwrap();
    let a_lid = t.db.store().search_dir_byfpr(&alice.fpr()).unwrap().unwrap();
    t.db.update_ownertrust(a_lid, TRUST_FULLY).unwrap();

    let mut pk = bob.pk.clone();
    let first = t.db.check_trust_at(&mut pk, NOW).unwrap();
    for _ in 0..5 {
        let mut pk = bob.pk.clone();
        assert_eq!(t.db.check_trust_at(&mut pk, NOW).unwrap(), first);
    }
}

#[test]
fn ultimate_root_short_circuits_the_graph() {
    let alice = actor(1, 1_000_000, "alice");
    let bob = actor(2, 1_000_100, "bob");
    let mut ring = Keyring::new();
    ring.add_secret(alice.secret());
    // alice's own block carries a certification by bob, which must not
    // matter for her verdict
    ring.add_keyblock(block_with_certs(&alice, &[&bob]));
    ring.add_keyblock(self_signed_block(&bob));

    let mut t = open_db(ring);
    t.db.init(1).unwrap();
    t.db.update_trustdb().unwrap();

    let mut pk = alice.pk.clone();
    assert_eq!(t.db.check_trust_at(&mut pk, NOW).unwrap(), TRUST_ULTIMATE);
}

#[test]
fn trust_stops_at_the_depth_bound() {
    // chain: alice (ultimate) signs k1, k1 signs k2, ... a key three hops
    // out is still reachable, four hops out is beyond max_cert_depth = 5
    let alice = actor(1, 1_000_000, "alice");
    let k1 = actor(31, 1_000_100, "k1");
    let k2 = actor(32, 1_000_200, "k2");
    let k3 = actor(33, 1_000_300, "k3");
    let k4 = actor(34, 1_000_400, "k4");

    let mut ring = Keyring::new();
    ring.add_secret(alice.secret());
    ring.add_keyblock(self_signed_block(&alice));
    ring.add_keyblock(block_with_certs(&k1, &[&alice]));
    ring.add_keyblock(block_with_certs(&k2, &[&k1]));
    ring.add_keyblock(block_with_certs(&k3, &[&k2]));
    ring.add_keyblock(block_with_certs(&k4, &[&k3]));

    let mut t = open_db(ring);
    t.db.init(1).unwrap();
    t.db.update_trustdb().unwrap();
    let a_lid = t.db.store().search_dir_byfpr(&alice.fpr()).unwrap().unwrap();
    t.db.update_ownertrust(a_lid, TRUST_ULTIMATE).unwrap();

    let mut pk = k3.pk.clone();
    assert_eq!(t.db.check_trust_at(&mut pk, NOW).unwrap(), TRUST_FULLY);
    let mut pk = k4.pk.clone();
    assert_eq!(t.db.check_trust_at(&mut pk, NOW).unwrap(), TRUST_UNDEFINED);
}

#[test]
fn certification_cycles_terminate() {
    let alice = actor(1, 1_000_000, "alice");
    let bob = actor(2, 1_000_100, "bob");
    let mut ring = Keyring::new();
    ring.add_keyblock(block_with_certs(&alice, &[&bob]));
    ring.add_keyblock(block_with_certs(&bob, &[&alice]));

    let mut t = open_db(ring);
    t.db.update_trustdb().unwrap();
    // a second pass over the settled cycle changes nothing
    let sum = t.db.update_trustdb().unwrap();
    assert_eq!(sum.updated, 0);

    let mut pk = bob.pk.clone();
    assert_eq!(t.db.check_trust_at(&mut pk, NOW).unwrap(), TRUST_UNDEFINED);
}

#[test]
fn duplicate_secret_keys_register_once() {
    let alice = actor(1, 1_000_000, "alice");
    let mut ring = Keyring::new();
    ring.add_secret(alice.secret());
    ring.add_secret(alice.secret());
    ring.add_keyblock(self_signed_block(&alice));

    let mut t = open_db(ring);
    t.db.init(1).unwrap();
    assert_eq!(t.db.ultimate_key_count(), 1);
}

#[test]
fn thresholds_use_completes_needed() {
    // two fully trusted certification paths with completes_needed = 2
    let alice = actor(1, 1_000_000, "alice");
    let bernd = actor(40, 1_000_100, "bernd");
    let mut ring = Keyring::new();
    ring.add_secret(alice.secret());
    ring.add_secret(bernd.secret());
    ring.add_keyblock(self_signed_block(&alice));
    ring.add_keyblock(self_signed_block(&bernd));
    let tara = actor(41, 1_000_200, "tara");
    let ulf = actor(42, 1_000_300, "ulf");
    ring.add_keyblock(block_with_certs(&tara, &[&alice]));
    ring.add_keyblock(block_with_certs(&ulf, &[&bernd]));
    let victim = actor(43, 1_000_400, "victim");
    ring.add_keyblock(block_with_certs(&victim, &[&tara, &ulf]));

    let mut t = open_db_with(
        ring,
        TrustOptions {
            marginals_needed: 3,
            completes_needed: 2,
            max_cert_depth: 5,
        },
    );
    t.db.init(1).unwrap();
    t.db.update_trustdb().unwrap();
    for who in [&alice, &bernd] {
        let lid = t.db.store().search_dir_byfpr(&who.fpr()).unwrap().unwrap();
        t.db.update_ownertrust(lid, TRUST_FULLY).unwrap();
    }

    let mut pk = victim.pk.clone();
    assert_eq!(t.db.check_trust_at(&mut pk, NOW).unwrap(), TRUST_FULLY);
}
