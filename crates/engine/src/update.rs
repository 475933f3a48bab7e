//! Rebuilding a directory sub-graph from an in-memory keyblock.
//!
//! `update_trust_record` reconciles the stored KEY/UID/SIG/PREF graph of one
//! key against the keyblock: surviving records are matched by content
//! (fingerprint, name hash), missing ones are created, stale ones are swept
//! with their children. Self-signatures validate user ids and rebuild their
//! preference chains; foreign certifications land in signature slots, with a
//! shadow directory standing in for signers we do not hold yet.
//! `insert_trust_record` bootstraps the directory record, promoting a shadow
//! directory in place when one exists, and then drains its hint list.
//!
//! Everything for one update happens inside a single store transaction.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use trustdb_core::keyring::SigCheck;
use trustdb_core::packet::{
    is_certification_class, Keyblock, Packet, PublicKey, SigPacket, SubpktType, UserId,
    SIG_CLASS_CERT_REVOKE, SIG_CLASS_KEY_REVOKE, SIG_CLASS_SUBKEY_BIND, SIG_CLASS_SUBKEY_REVOKE,
};
use trustdb_core::record::{
    DirRecord, HlstRecord, KeyRecord, Lid, PrefRecord, RecNum, RecordBody, RecordKind, SdirRecord,
    SigRecord, SigSlot, UidRecord, DIRF_CHECKED, ITEMS_PER_HLST_RECORD, ITEMS_PER_PREF_RECORD,
    PREFTYPE_COMPR, PREFTYPE_HASH, PREFTYPE_SYM, SIGF_CHECKED, SIGF_NOPUBKEY, SIGF_VALID,
};

use crate::{EngineError, Result, TrustDb};

/// Cursor for the user id the packet walk is currently under.
struct CurUid {
    recno: RecNum,
    namehash: [u8; 20],
}

impl TrustDb {
    /// Update all graph records for the keyblock's key. The key must already
    /// have a directory record (`EngineError::NotFound` otherwise); callers
    /// that hit `NotFound` go through [`TrustDb::insert_trust_record`] first.
    /// Returns whether anything changed.
    pub fn update_trust_record(&mut self, kb: &Keyblock) -> Result<bool> {
        let primary = kb.primary().ok_or(EngineError::NoPrimaryKey)?;
        let mut pk = primary.clone();
        let drec = self.get_dir_record(&mut pk)?;

        self.store.begin_transaction()?;
        match self.update_within_txn(kb, drec) {
            Ok(()) => {
                let modified = self.store.is_dirty();
                self.store.commit_transaction()?;
                Ok(modified)
            }
            Err(e) => {
                let _ = self.store.cancel_transaction();
                Err(e)
            }
        }
    }

    /// Insert a directory record for a primary key and build its sub-graph.
    /// Reuses the record number of an existing shadow directory, then runs
    /// the hint-list resolver over the signatures that were waiting for this
    /// key. One transaction covers promotion, update, and hint processing.
    pub fn insert_trust_record(&mut self, pk: &mut PublicKey) -> Result<()> {
        if pk.local_id != 0 {
            return Err(EngineError::Corrupt(format!(
                "insert called for already-resolved lid {}",
                pk.local_id
            )));
        }
        let fpr = pk.fingerprint();
        let kb = match self.keyring.get_keyblock_byfprint(&fpr) {
            Some(kb) => kb.clone(),
            None => {
                warn!(
                    "key {:016X}: insert: keyblock not found in keyring",
                    pk.keyid()
                );
                return Err(EngineError::NoPubkey);
            }
        };
        let primary = kb.primary().ok_or(EngineError::NoPrimaryKey)?;
        if primary.keyid() != pk.keyid() {
            warn!("insert was not given the primary key");
            return Err(EngineError::NotPrimary);
        }

        self.store.begin_transaction()?;
        match self.insert_within_txn(&kb, pk.keyid(), pk.pubkey_algo) {
            Ok(lid) => {
                self.store.commit_transaction()?;
                pk.local_id = lid;
                self.store.sync()?;
                debug!(lid, "key inserted into trust database");
                Ok(())
            }
            Err(e) => {
                let _ = self.store.cancel_transaction();
                Err(e)
            }
        }
    }

    fn insert_within_txn(&mut self, kb: &Keyblock, keyid: u64, pubkey_algo: u8) -> Result<Lid> {
        // A shadow directory for this key means it has already signed other
        // keys; take over its record number so every signature slot pointing
        // at it stays valid, and remember the hint list for later.
        let (recnum, hintlist) = match self.store.search_sdir(keyid, pubkey_algo)? {
            Some(recno) => {
                let sdir = self.req_sdir(recno)?;
                info!(lid = recno, "promoting shadow directory");
                (recno, sdir.hintlist)
            }
            None => (self.store.new_recnum()?, 0),
        };
        let drec = DirRecord {
            lid: recnum,
            ..Default::default()
        };
        self.write_dir(recnum, drec.clone())?;

        self.update_within_txn(kb, drec)?;
        if hintlist != 0 {
            self.process_hintlist(hintlist, recnum)?;
        }
        Ok(recnum)
    }

    pub(crate) fn update_within_txn(&mut self, kb: &Keyblock, mut drec: DirRecord) -> Result<()> {
        let primary = kb.primary().ok_or(EngineError::NoPrimaryKey)?;
        let keyid = primary.keyid();
        let lid = drec.lid;

        let mut visited: HashSet<(RecordKind, RecNum)> = HashSet::new();
        let mut dir_dirty = false;
        let mut cur_uid: Option<CurUid> = None;

        for (idx, pkt) in kb.packets.iter().enumerate() {
            match pkt {
                Packet::Primary(k) | Packet::Subkey(k) => {
                    cur_uid = None;
                    self.upd_key_record(k, &mut drec, &mut dir_dirty, &mut visited)?;
                }
                Packet::UserId(u) => {
                    cur_uid =
                        Some(self.upd_uid_record(u, &mut drec, &mut dir_dirty, &mut visited)?);
                }
                Packet::Signature(sig) => {
                    self.upd_sig_record(kb, idx, sig, lid, keyid, cur_uid.as_ref())?;
                }
            }
        }

        self.sweep_keylist(&mut drec, &mut dir_dirty, &visited)?;
        self.sweep_uidlist(&mut drec, &mut dir_dirty, &visited)?;

        if dir_dirty || self.store.is_dirty() {
            drec.dirflags &= !DIRF_CHECKED;
            self.write_dir(lid, drec)?;
        }
        Ok(())
    }

    /// Match-or-create the KEY record for one key packet.
    fn upd_key_record(
        &mut self,
        k: &PublicKey,
        drec: &mut DirRecord,
        dir_dirty: &mut bool,
        visited: &mut HashSet<(RecordKind, RecNum)>,
    ) -> Result<()> {
        let fpr = k.fingerprint().to_vec();
        let mut recno = drec.keylist;
        while recno != 0 {
            let krec = self.req_key(recno)?;
            if krec.fingerprint == fpr {
                visited.insert((RecordKind::Key, recno));
                return Ok(());
            }
            recno = krec.next;
        }

        let newrec = self.store.new_recnum()?;
        self.write_key(
            newrec,
            KeyRecord {
                lid: drec.lid,
                pubkey_algo: k.pubkey_algo,
                fingerprint: fpr,
                next: 0,
            },
        )?;
        visited.insert((RecordKind::Key, newrec));
        self.append_to_keylist(drec, dir_dirty, newrec)
    }

    fn append_to_keylist(
        &mut self,
        drec: &mut DirRecord,
        dir_dirty: &mut bool,
        newrec: RecNum,
    ) -> Result<()> {
        if drec.keylist == 0 {
            drec.keylist = newrec;
            *dir_dirty = true;
            return Ok(());
        }
        let mut recno = drec.keylist;
        loop {
            let mut krec = self.req_key(recno)?;
            if krec.next == 0 {
                krec.next = newrec;
                return self.write_key(recno, krec);
            }
            recno = krec.next;
        }
    }

    /// Match-or-create the UID record for one user id packet.
    fn upd_uid_record(
        &mut self,
        u: &UserId,
        drec: &mut DirRecord,
        dir_dirty: &mut bool,
        visited: &mut HashSet<(RecordKind, RecNum)>,
    ) -> Result<CurUid> {
        let namehash = u.namehash();
        let mut recno = drec.uidlist;
        while recno != 0 {
            let urec = self.req_uid(recno)?;
            if urec.namehash == namehash {
                visited.insert((RecordKind::Uid, recno));
                return Ok(CurUid { recno, namehash });
            }
            recno = urec.next;
        }

        let newrec = self.store.new_recnum()?;
        self.write_uid(
            newrec,
            UidRecord {
                lid: drec.lid,
                namehash,
                uidflags: 0,
                siglist: 0,
                prefrec: 0,
                next: 0,
            },
        )?;
        visited.insert((RecordKind::Uid, newrec));

        if drec.uidlist == 0 {
            drec.uidlist = newrec;
            *dir_dirty = true;
        } else {
            let mut recno = drec.uidlist;
            loop {
                let mut urec = self.req_uid(recno)?;
                if urec.next == 0 {
                    urec.next = newrec;
                    self.write_uid(recno, urec)?;
                    break;
                }
                recno = urec.next;
            }
        }
        Ok(CurUid {
            recno: newrec,
            namehash,
        })
    }

    /// Dispatch one signature packet on (signer relationship, class).
    /// A signature made with a secondary key is not a self-signature.
    fn upd_sig_record(
        &mut self,
        kb: &Keyblock,
        sig_index: usize,
        sig: &SigPacket,
        lid: Lid,
        keyid: u64,
        cur_uid: Option<&CurUid>,
    ) -> Result<()> {
        let Some(cur) = cur_uid else {
            match sig.sig_class {
                SIG_CLASS_SUBKEY_BIND | SIG_CLASS_KEY_REVOKE | SIG_CLASS_SUBKEY_REVOKE => {
                    // key-level signatures are acknowledged but not yet
                    // materialized in the graph
                    debug!(class = sig.sig_class,
                           "key-level signature noted, not stored");
                }
                _ => {
                    warn!(
                        "key {keyid:016X}: signature (class {:02x}) without user id - skipped",
                        sig.sig_class
                    );
                }
            }
            return Ok(());
        };

        if sig.signer_keyid == keyid {
            if is_certification_class(sig.sig_class) {
                self.upd_self_sig(kb, sig_index, sig, cur, lid)
            } else {
                debug!(class = sig.sig_class,
                       "self signature of unhandled class - skipped");
                Ok(())
            }
        } else if is_certification_class(sig.sig_class) {
            self.upd_nonself_sig(kb, sig_index, sig, cur, lid)
        } else {
            match sig.sig_class {
                SIG_CLASS_SUBKEY_BIND => {
                    info!(
                        "key {keyid:016X}: bogus key binding by {:016X} - skipped",
                        sig.signer_keyid
                    );
                }
                SIG_CLASS_KEY_REVOKE => {
                    info!(
                        "key {keyid:016X}: bogus key revocation by {:016X} - skipped",
                        sig.signer_keyid
                    );
                }
                SIG_CLASS_SUBKEY_REVOKE => {
                    info!(
                        "key {keyid:016X}: bogus subkey revocation by {:016X} - skipped",
                        sig.signer_keyid
                    );
                }
                SIG_CLASS_CERT_REVOKE => {
                    debug!("certification revocation not stored");
                }
                other => {
                    debug!(class = other, "unrecognized signature class - skipped");
                }
            }
            Ok(())
        }
    }

    /// Self-signature on a user id: verify once, mark the uid, and rebuild
    /// its preference chain from the signature's subpackets.
    fn upd_self_sig(
        &mut self,
        kb: &Keyblock,
        sig_index: usize,
        sig: &SigPacket,
        cur: &CurUid,
        lid: Lid,
    ) -> Result<()> {
        use trustdb_core::record::{UIDF_CHECKED, UIDF_VALID};

        let mut urec = self.req_uid(cur.recno)?;
        if urec.uidflags & UIDF_CHECKED != 0 {
            return Ok(());
        }
        let (check, _) = self.keyring.check_key_signature(kb, sig_index);
        match check {
            SigCheck::Good => {
                debug!(
                    "lid {lid}, uid {:02X}{:02X}: good self-signature",
                    cur.namehash[18], cur.namehash[19]
                );
                self.upd_pref_record(sig, lid, &mut urec)?;
                urec.uidflags = UIDF_CHECKED | UIDF_VALID;
            }
            _ => {
                info!(
                    "lid {lid}, uid {:02X}{:02X}: invalid self-signature",
                    cur.namehash[18], cur.namehash[19]
                );
                urec.uidflags = UIDF_CHECKED;
            }
        }
        self.write_uid(cur.recno, urec)
    }

    /// Replace the uid's preference chain with the pairs carried by the
    /// self-signature's subpackets.
    fn upd_pref_record(&mut self, sig: &SigPacket, lid: Lid, urec: &mut UidRecord) -> Result<()> {
        // dropping and rewriting is simpler than diffing the old chain
        let mut recno = urec.prefrec;
        while recno != 0 {
            let prec = self.req_pref(recno)?;
            self.store.delete(recno)?;
            recno = prec.next;
        }

        let mut pairs: Vec<(u8, u8)> = Vec::new();
        for (spt, preftype) in [
            (SubpktType::PrefSym, PREFTYPE_SYM),
            (SubpktType::PrefHash, PREFTYPE_HASH),
            (SubpktType::PrefCompr, PREFTYPE_COMPR),
        ] {
            if let Some(data) = sig.subpacket(spt) {
                for &algo in data {
                    pairs.push((preftype, algo));
                }
            }
        }

        let mut chunks: Vec<(RecNum, [u8; ITEMS_PER_PREF_RECORD])> = Vec::new();
        for chunk in pairs.chunks(ITEMS_PER_PREF_RECORD / 2) {
            let recno = self.store.new_recnum()?;
            let mut data = [0u8; ITEMS_PER_PREF_RECORD];
            for (i, (t, a)) in chunk.iter().enumerate() {
                data[2 * i] = *t;
                data[2 * i + 1] = *a;
            }
            chunks.push((recno, data));
        }
        for (i, (recno, data)) in chunks.iter().enumerate() {
            let next = chunks.get(i + 1).map(|(r, _)| *r).unwrap_or(0);
            self.write_pref(
                *recno,
                PrefRecord {
                    lid,
                    next,
                    data: *data,
                },
            )?;
        }
        urec.prefrec = chunks.first().map(|(r, _)| *r).unwrap_or(0);
        Ok(())
    }

    /// Certification by another key: reconcile it into the uid's signature
    /// slots. Checking happens now if the signer's key is present; otherwise
    /// a shadow directory records the dependency for later.
    fn upd_nonself_sig(
        &mut self,
        kb: &Keyblock,
        sig_index: usize,
        sig: &SigPacket,
        cur: &CurUid,
        lid: Lid,
    ) -> Result<()> {
        // LID of the signer, if we can resolve one
        let pk_lid: Option<Lid> = match self.keyring.get_pubkey(sig.signer_keyid) {
            Some(spk) => match self.store.search_dir_bypk(&spk)? {
                Some(recno) => Some(recno),
                None => self.store.search_sdir(spk.keyid(), spk.pubkey_algo)?,
            },
            None => None,
        };

        let mut urec = self.req_uid(cur.recno)?;
        let mut empty_slot: Option<(RecNum, usize)> = None;
        let mut found_sig = false;

        // Walk the existing slots: find our signature, drop duplicates, and
        // settle any slot that can be checked now.
        let mut recno = urec.siglist;
        while recno != 0 {
            let mut srec = self.req_sig(recno)?;
            if srec.lid != lid {
                return Err(EngineError::Corrupt(format!(
                    "sig record {recno} has a wrong owner"
                )));
            }
            let next = srec.next;
            let mut dirty = false;
            for i in 0..srec.sigs.len() {
                let slot = srec.sigs[i];
                if slot.lid == 0 {
                    if empty_slot.is_none() {
                        empty_slot = Some((recno, i));
                    }
                    continue;
                }
                if Some(slot.lid) == pk_lid {
                    if found_sig {
                        info!(
                            "lid {lid}, sig {:016X}: duplicated signature - deleted",
                            sig.signer_keyid
                        );
                        srec.sigs[i] = SigSlot::default();
                        dirty = true;
                        continue;
                    }
                    found_sig = true;
                }
                if slot.flag & SIGF_CHECKED != 0 {
                    continue;
                }
                if slot.flag & SIGF_NOPUBKEY != 0 {
                    continue;
                }
                let target = self.req_any(slot.lid)?;
                match &target.body {
                    RecordBody::Dir(_) => {
                        let (check, _) = self.keyring.check_key_signature(kb, sig_index);
                        srec.sigs[i].flag = match check {
                            SigCheck::Good => {
                                debug!(lid, "good signature");
                                SIGF_CHECKED | SIGF_VALID
                            }
                            SigCheck::NoPubkey => {
                                info!(lid, "weird: no public key");
                                SIGF_NOPUBKEY
                            }
                            SigCheck::Bad => {
                                info!(lid, "invalid signature");
                                SIGF_CHECKED
                            }
                        };
                        dirty = true;
                    }
                    RecordBody::Sdir(sd) => {
                        if sd.keyid == sig.signer_keyid
                            && (sd.pubkey_algo == 0 || sd.pubkey_algo == sig.pubkey_algo)
                        {
                            info!(lid, sdir = target.recnum,
                                  "has shadow dir but slot not yet marked");
                            srec.sigs[i].flag = SIGF_NOPUBKEY;
                            dirty = true;
                        }
                    }
                    _ => {
                        return Err(EngineError::Corrupt(format!(
                            "sig slot {recno}[{i}] points to a {} record",
                            target.kind()
                        )));
                    }
                }
            }
            if dirty {
                self.write_sig(recno, srec)?;
            }
            recno = next;
        }

        if found_sig {
            return Ok(());
        }

        // The signature is new: check it if we can, shadow it if we cannot.
        let (newlid, newflag) = match pk_lid {
            None => (self.create_shadow_dir(sig, lid)?, SIGF_NOPUBKEY),
            Some(signer_lid) => {
                let (check, _) = self.keyring.check_key_signature(kb, sig_index);
                match check {
                    SigCheck::Good => {
                        debug!("lid {lid}, sig {:016X}: good signature", sig.signer_keyid);
                        (signer_lid, SIGF_CHECKED | SIGF_VALID)
                    }
                    SigCheck::NoPubkey => {
                        info!("lid {lid}, sig {:016X}: no public key", sig.signer_keyid);
                        (self.create_shadow_dir(sig, lid)?, SIGF_NOPUBKEY)
                    }
                    SigCheck::Bad => {
                        info!("lid {lid}, sig {:016X}: invalid signature", sig.signer_keyid);
                        // a failed check must not leave a pointer to the
                        // signer's real directory; park it on a shadow entry
                        (self.create_shadow_dir(sig, lid)?, SIGF_CHECKED)
                    }
                }
            }
        };

        if let Some((recno, i)) = empty_slot {
            let mut srec = self.req_sig(recno)?;
            srec.sigs[i] = SigSlot {
                lid: newlid,
                flag: newflag,
            };
            self.write_sig(recno, srec)
        } else {
            let newrec = self.store.new_recnum()?;
            let mut srec = SigRecord {
                lid,
                next: urec.siglist,
                sigs: Default::default(),
            };
            srec.sigs[0] = SigSlot {
                lid: newlid,
                flag: newflag,
            };
            self.write_sig(newrec, srec)?;
            urec.siglist = newrec;
            self.write_uid(cur.recno, urec)
        }
    }

    /// Create or reuse the shadow directory for a signature's signer and
    /// note `signed_lid` in its hint list. Returns the shadow LID.
    pub(crate) fn create_shadow_dir(&mut self, sig: &SigPacket, signed_lid: Lid) -> Result<Lid> {
        let (mut sdir, sdir_recno) =
            match self.store.search_sdir(sig.signer_keyid, sig.pubkey_algo)? {
                Some(recno) => (self.req_sdir(recno)?, recno),
                None => {
                    let recno = self.store.new_recnum()?;
                    let sdir = SdirRecord {
                        lid: recno,
                        keyid: sig.signer_keyid,
                        pubkey_algo: sig.pubkey_algo,
                        hintlist: 0,
                    };
                    self.write_sdir(recno, sdir.clone())?;
                    (sdir, recno)
                }
            };

        let mut free_slot: Option<(RecNum, usize)> = None;
        let mut recno = sdir.hintlist;
        while recno != 0 {
            let hlst = self.req_hlst(recno)?;
            for (i, rnum) in hlst.rnum.iter().enumerate() {
                if *rnum == 0 {
                    if free_slot.is_none() {
                        free_slot = Some((recno, i));
                    }
                } else if *rnum == signed_lid {
                    // already hinted
                    return Ok(sdir.lid);
                }
            }
            recno = hlst.next;
        }

        if let Some((recno, i)) = free_slot {
            let mut hlst = self.req_hlst(recno)?;
            hlst.rnum[i] = signed_lid;
            self.write_hlst(recno, hlst)?;
        } else {
            let newrec = self.store.new_recnum()?;
            let mut hlst = HlstRecord {
                next: sdir.hintlist,
                rnum: [0; ITEMS_PER_HLST_RECORD],
            };
            hlst.rnum[0] = signed_lid;
            self.write_hlst(newrec, hlst)?;
            sdir.hintlist = newrec;
            self.write_sdir(sdir_recno, sdir.clone())?;
        }
        Ok(sdir.lid)
    }

    /// Delete KEY records that no packet claimed, unlinking them from the
    /// keylist.
    fn sweep_keylist(
        &mut self,
        drec: &mut DirRecord,
        dir_dirty: &mut bool,
        visited: &HashSet<(RecordKind, RecNum)>,
    ) -> Result<()> {
        let mut prev: RecNum = 0;
        let mut recno = drec.keylist;
        while recno != 0 {
            let krec = self.req_key(recno)?;
            let next = krec.next;
            if visited.contains(&(RecordKind::Key, recno)) {
                prev = recno;
            } else {
                debug!(lid = drec.lid, recno, "dropping stale key record");
                if prev == 0 {
                    drec.keylist = next;
                    *dir_dirty = true;
                } else {
                    let mut p = self.req_key(prev)?;
                    p.next = next;
                    self.write_key(prev, p)?;
                }
                self.store.delete(recno)?;
            }
            recno = next;
        }
        Ok(())
    }

    /// Delete UID records that no packet claimed, along with their PREF and
    /// SIG chains.
    fn sweep_uidlist(
        &mut self,
        drec: &mut DirRecord,
        dir_dirty: &mut bool,
        visited: &HashSet<(RecordKind, RecNum)>,
    ) -> Result<()> {
        let mut prev: RecNum = 0;
        let mut recno = drec.uidlist;
        while recno != 0 {
            let urec = self.req_uid(recno)?;
            let next = urec.next;
            if visited.contains(&(RecordKind::Uid, recno)) {
                prev = recno;
            } else {
                debug!(lid = drec.lid, recno, "dropping stale uid record");
                if prev == 0 {
                    drec.uidlist = next;
                    *dir_dirty = true;
                } else {
                    let mut p = self.req_uid(prev)?;
                    p.next = next;
                    self.write_uid(prev, p)?;
                }
                let mut r2 = urec.prefrec;
                while r2 != 0 {
                    let prec = self.req_pref(r2)?;
                    self.store.delete(r2)?;
                    r2 = prec.next;
                }
                let mut r2 = urec.siglist;
                while r2 != 0 {
                    let srec = self.req_sig(r2)?;
                    self.store.delete(r2)?;
                    r2 = srec.next;
                }
                self.store.delete(recno)?;
            }
            recno = next;
        }
        Ok(())
    }
}
