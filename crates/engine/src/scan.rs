//! Bulk maintenance and listing: re-checking the whole database against the
//! keyring, inserting everything the keyring holds, dumping records, and the
//! recursive signature listing with loop detection.

use std::io::Write;

use tracing::{debug, error, info};

use trustdb_core::crypto::keyid_from_fingerprint;
use trustdb_core::lidtab::LidTable;
use trustdb_core::packet::{Keyblock, PublicKey};
use trustdb_core::record::{
    DirRecord, Lid, RecordBody, DIRF_CHECKED, ITEMS_PER_PREF_RECORD, SIGF_CHECKED, SIGF_EXPIRED,
    SIGF_NOPUBKEY, SIGF_REVOKED, SIGF_VALID,
};
use trustdb_core::trust::{
    clamp_certifier, ownertrust_letter, trust_letter, TRUST_FULLY, TRUST_MARGINAL, TRUST_MASK,
    TRUST_ULTIMATE, TRUST_UNDEFINED,
};
use trustdb_store::dump_record;

use crate::sigwalk::SigrecIter;
use crate::{is_fatal, EngineError, Result, TrustDb};

/// Listing recursion bound for the signature tree.
const MAX_LIST_SIGS_DEPTH: usize = 20;

/// Counters reported by the bulk operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub processed: u64,
    pub updated: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl TrustDb {
    /// Walk every keyblock in the keyring and update-or-insert its trust
    /// records. Per-key recoverable failures are counted; corruption aborts.
    pub fn update_trustdb(&mut self) -> Result<ScanSummary> {
        let blocks: Vec<Keyblock> = self.keyring.keyblocks().to_vec();
        let mut sum = ScanSummary::default();
        for kb in &blocks {
            match self.update_trust_record(kb) {
                Ok(true) => {
                    debug!("keyblock updated");
                    sum.updated += 1;
                }
                Ok(false) => {}
                Err(EngineError::NotFound) => match kb.primary() {
                    Some(primary) => {
                        let mut pk = primary.clone();
                        match self.insert_trust_record(&mut pk) {
                            Ok(()) => {
                                debug!(lid = pk.local_id, "keyblock inserted");
                                sum.inserted += 1;
                            }
                            Err(e) if is_fatal(&e) => return Err(e),
                            Err(e) => {
                                error!("insert failed: {e}");
                                sum.errors += 1;
                            }
                        }
                    }
                    None => {
                        error!("keyblock without primary key");
                        sum.errors += 1;
                    }
                },
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    error!("update failed: {e}");
                    sum.errors += 1;
                }
            }
            sum.processed += 1;
            if sum.processed % 100 == 0 {
                info!(count = sum.processed, "keys so far processed");
            }
        }
        info!(processed = sum.processed, updated = sum.updated,
              inserted = sum.inserted, errors = sum.errors, "update done");
        Ok(sum)
    }

    /// Re-verify the stored graph: one key by name, or every directory
    /// record against the keyring.
    pub fn check_trustdb(&mut self, username: Option<&str>) -> Result<ScanSummary> {
        let mut sum = ScanSummary::default();
        if let Some(name) = username {
            let Some(pk) = self.keyring.get_pubkey_byname(name) else {
                error!(name, "user not found in keyring");
                return Err(EngineError::NotFound);
            };
            let fpr = pk.fingerprint();
            let Some(kb) = self.keyring.get_keyblock_byfprint(&fpr).cloned() else {
                error!(name, "keyblock read problem");
                return Err(EngineError::NoPubkey);
            };
            sum.processed = 1;
            match self.update_trust_record(&kb) {
                Ok(true) => {
                    info!(name, "updated");
                    sum.updated = 1;
                }
                Ok(false) => info!(name, "okay"),
                Err(EngineError::NotFound) => {
                    let mut pk = pk;
                    self.insert_trust_record(&mut pk)?;
                    info!(name, lid = pk.local_id, "inserted");
                    sum.inserted = 1;
                }
                Err(e) => return Err(e),
            }
            return Ok(sum);
        }

        for recno in self.store.iter_recnums()? {
            let rec = self.req_any(recno)?;
            let RecordBody::Dir(dir) = rec.body else {
                continue;
            };
            sum.processed += 1;
            if dir.keylist == 0 {
                info!(lid = dir.lid, "dir record without key - skipped");
                sum.skipped += 1;
                continue;
            }
            let krec = self.req_key(dir.keylist)?;
            let Some(kb) = self.keyring.get_keyblock_byfprint(&krec.fingerprint).cloned() else {
                error!(lid = dir.lid, "keyblock not found - skipped");
                sum.skipped += 1;
                continue;
            };
            match self.update_trust_record(&kb) {
                Ok(true) => {
                    debug!(lid = dir.lid, "updated");
                    sum.updated += 1;
                }
                Ok(false) => debug!(lid = dir.lid, "okay"),
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    error!(lid = dir.lid, "update failed: {e}");
                    sum.errors += 1;
                }
            }
            if sum.processed % 100 == 0 {
                info!(count = sum.processed, "keys so far processed");
            }
        }
        info!(processed = sum.processed, skipped = sum.skipped,
              errors = sum.errors, updated = sum.updated, "check done");
        Ok(sum)
    }

    /// Dump records: everything, one key by `#LID`, or one key by name
    /// (records plus its signature listing).
    pub fn list_trustdb<W: Write>(&mut self, out: &mut W, username: Option<&str>) -> Result<()> {
        match username {
            Some(spec) if spec.starts_with('#') => {
                let Ok(lid) = spec[1..].parse::<Lid>() else {
                    error!(spec, "bad lid specifier");
                    return Err(EngineError::NotFound);
                };
                self.list_records(out, lid)?;
                self.list_sigs(out, lid)
            }
            Some(name) => {
                let Some(mut pk) = self.keyring.get_pubkey_byname(name) else {
                    error!(name, "user not found");
                    return Err(EngineError::NotFound);
                };
                match self.get_dir_record(&mut pk) {
                    Ok(_) => {}
                    Err(EngineError::NotFound) => {
                        error!(name, "user not in trust database");
                        return Err(EngineError::NotFound);
                    }
                    Err(e) => return Err(e),
                }
                self.list_records(out, pk.local_id)?;
                self.list_sigs(out, pk.local_id)
            }
            None => {
                writeln!(out, "trust database records:")?;
                for recno in self.store.iter_recnums()? {
                    let rec = self.req_any(recno)?;
                    writeln!(out, "{}", dump_record(&rec))?;
                }
                Ok(())
            }
        }
    }

    /// Dump all records of one directory entry.
    fn list_records<W: Write>(&self, out: &mut W, lid: Lid) -> Result<()> {
        let dir = match self.store.read_dir(lid) {
            Ok(d) => d,
            Err(e @ trustdb_store::StoreError::NotFound(_))
            | Err(e @ trustdb_store::StoreError::TypeMismatch { .. }) => {
                error!(lid, "read dir record failed: {e}");
                return Err(EngineError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(out, "{}", dump_record(&self.req_any(lid)?))?;

        let mut recno = dir.keylist;
        while recno != 0 {
            let krec = self.req_key(recno)?;
            writeln!(out, "{}", dump_record(&self.req_any(recno)?))?;
            recno = krec.next;
        }
        let mut uid_rn = dir.uidlist;
        while uid_rn != 0 {
            let urec = self.req_uid(uid_rn)?;
            writeln!(out, "{}", dump_record(&self.req_any(uid_rn)?))?;
            let mut recno = urec.prefrec;
            while recno != 0 {
                let prec = self.req_pref(recno)?;
                writeln!(out, "{}", dump_record(&self.req_any(recno)?))?;
                recno = prec.next;
            }
            let mut recno = urec.siglist;
            while recno != 0 {
                let srec = self.req_sig(recno)?;
                writeln!(out, "{}", dump_record(&self.req_any(recno)?))?;
                recno = srec.next;
            }
            uid_rn = urec.next;
        }
        Ok(())
    }

    /// List the signature tree of a key, with back-references instead of
    /// repeated subtrees.
    pub fn list_sigs<W: Write>(&self, out: &mut W, lid: Lid) -> Result<()> {
        let keyid = self.keyid_from_lid(lid)?;
        writeln!(out, "Signatures of {keyid:016X}.{lid}")?;
        writeln!(out, "----------------------")?;
        let mut lids = LidTable::new();
        let mut lineno: u32 = 1;
        self.do_list_sigs(out, lid, lid, 0, &mut lids, &mut lineno)?;
        writeln!(out)?;
        Ok(())
    }

    fn do_list_sigs<W: Write>(
        &self,
        out: &mut W,
        root: Lid,
        pk_lid: Lid,
        depth: usize,
        lids: &mut LidTable,
        lineno: &mut u32,
    ) -> Result<()> {
        let mut walker = SigrecIter::new(&self.store, pk_lid);
        while let Some((sig_lid, flag)) = walker.next_sig()? {
            let flags = sigflag_str(flag);
            match self.keyid_from_lid(sig_lid) {
                Err(_) => {
                    writeln!(
                        out,
                        "{:6}: {:2$}????????.{sig_lid}: {flags}",
                        lineno,
                        "",
                        depth * 4
                    )?;
                    *lineno += 1;
                }
                Ok(kid) => {
                    write!(
                        out,
                        "{:6}: {:2$}{kid:016X}.{sig_lid}: {flags} ",
                        lineno,
                        "",
                        depth * 4
                    )?;
                    if self.ultikeys.contains(sig_lid) {
                        writeln!(out, "[ultimately trusted]")?;
                        *lineno += 1;
                    } else if sig_lid == pk_lid {
                        writeln!(out, "[self-signature]")?;
                        *lineno += 1;
                    } else if sig_lid == root {
                        writeln!(out, "[closed]")?;
                        *lineno += 1;
                    } else if lids.insert(sig_lid, *lineno) {
                        let refline = lids.lookup(sig_lid).unwrap_or(0);
                        writeln!(out, "[see line {refline}]")?;
                        *lineno += 1;
                    } else if depth + 1 >= MAX_LIST_SIGS_DEPTH {
                        writeln!(out, "[too deeply nested]")?;
                        *lineno += 1;
                    } else {
                        writeln!(out)?;
                        *lineno += 1;
                        self.do_list_sigs(out, root, sig_lid, depth + 1, lids, lineno)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Print the certification paths considered for a key, resolving it by
    /// name and inserting it first if necessary.
    pub fn list_trust_path<W: Write>(
        &mut self,
        out: &mut W,
        max_depth: i32,
        name: &str,
    ) -> Result<()> {
        let max_depth = max_depth.max(1) as u32;
        let Some(mut pk) = self.keyring.get_pubkey_byname(name) else {
            error!(name, "user not found");
            return Err(EngineError::NotFound);
        };
        let drec = match self.get_dir_record(&mut pk) {
            Ok(d) => d,
            Err(EngineError::NotFound) => {
                info!(name, "user not in trust database - inserting");
                self.insert_trust_record(&mut pk)?;
                self.req_dir(pk.local_id)?
            }
            Err(e) => return Err(e),
        };
        let verdict = self.print_trust_path(out, 1, max_depth, &drec)?;
        writeln!(out, "trust level: {}", trust_letter(verdict))?;
        Ok(())
    }

    fn print_trust_path<W: Write>(
        &self,
        out: &mut W,
        depth: u32,
        max_depth: u32,
        drec: &DirRecord,
    ) -> Result<u8> {
        // running column position for continuation markers
        let mut col: usize = 0;

        let head = format!(
            "{:1$}{2}.{3} ot={4} -> ",
            "",
            (depth as usize - 1) * 3,
            match self.keyid_from_lid(drec.lid) {
                Ok(kid) => format!("{kid:016X}"),
                Err(_) => "????????".into(),
            },
            drec.lid,
            ownertrust_letter(drec.ownertrust)
        );
        col += head.len();
        write!(out, "{head}")?;

        if depth >= max_depth {
            writeln!(out, "undefined (too deep)")?;
            return Ok(TRUST_UNDEFINED);
        }
        if self.ultikeys.contains(drec.lid) {
            writeln!(out, "ultimate")?;
            return Ok(TRUST_ULTIMATE);
        }

        let mut marginal: u32 = 0;
        let mut fully: u32 = 0;

        let mut uid_rn = drec.uidlist;
        while uid_rn != 0 {
            let urec = self.req_uid(uid_rn)?;
            let mut sig_rn = urec.siglist;
            while sig_rn != 0 {
                let srec = self.req_sig(sig_rn)?;
                for slot in &srec.sigs {
                    if slot.lid == 0 || slot.flag & SIGF_CHECKED == 0 {
                        continue;
                    }
                    if slot.flag & SIGF_VALID == 0
                        || slot.flag & (SIGF_EXPIRED | SIGF_REVOKED) != 0
                    {
                        continue;
                    }
                    let signer = self.req_dir(slot.lid)?;
                    let ot = clamp_certifier(signer.ownertrust);
                    if ot < TRUST_MARGINAL {
                        write!(out, ". ")?;
                        col += 2;
                        continue;
                    }

                    writeln!(out)?;
                    let nt = self.print_trust_path(out, depth + 1, max_depth, &signer)?
                        & TRUST_MASK;
                    if nt < TRUST_MARGINAL {
                        write!(out, "{:1$}* ", "", col)?;
                        col += 2;
                        continue;
                    }
                    if nt == TRUST_ULTIMATE {
                        writeln!(out, "{:1$}{2} (first level)", "", col,
                                 trust_letter(ot))?;
                        return Ok(ot);
                    }
                    if nt >= TRUST_FULLY {
                        fully += 1;
                    }
                    marginal += 1;
                    if fully >= self.opts.completes_needed
                        || marginal >= self.opts.marginals_needed
                    {
                        writeln!(out, "{:1$}fully", "", col)?;
                        return Ok(TRUST_FULLY);
                    }
                }
                sig_rn = srec.next;
            }
            uid_rn = urec.next;
        }

        if marginal > 0 {
            writeln!(out, "{:1$}marginal", "", col)?;
            Ok(TRUST_MARGINAL)
        } else {
            writeln!(out, "{:1$}undefined", "", col)?;
            Ok(TRUST_UNDEFINED)
        }
    }

    /// Key id of the primary key behind a LID; a shadow directory answers
    /// with its stored key id.
    pub fn keyid_from_lid(&self, lid: Lid) -> Result<u64> {
        let rec = self.req_any(lid)?;
        match rec.body {
            RecordBody::Sdir(sdir) => Ok(sdir.keyid),
            RecordBody::Dir(dir) => {
                if dir.keylist == 0 {
                    return Err(EngineError::Corrupt(format!(
                        "no primary key for lid {lid}"
                    )));
                }
                let krec = self.req_key(dir.keylist)?;
                Ok(keyid_from_fingerprint(&krec.fingerprint))
            }
            other => Err(EngineError::Corrupt(format!(
                "lid {lid}: expected dir record, got {}",
                other.kind()
            ))),
        }
    }

    /// LID of a keyblock's primary key, resolving and caching it on demand.
    pub fn lid_from_keyblock(&mut self, kb: &Keyblock) -> Result<Lid> {
        let primary = kb.primary().ok_or(EngineError::NoPrimaryKey)?;
        let mut pk = primary.clone();
        self.get_dir_record(&mut pk)?;
        Ok(pk.local_id)
    }

    /// Drop the checked flag from a key's directory record.
    pub fn clear_trust_checked_flag(&mut self, pk: &mut PublicKey) -> Result<()> {
        let mut dir = self.get_dir_record(pk)?;
        if dir.dirflags & DIRF_CHECKED == 0 {
            return Ok(());
        }
        dir.dirflags &= !DIRF_CHECKED;
        self.write_dir(pk.local_id, dir)?;
        self.store.sync()?;
        Ok(())
    }

    /// Raw preference bytes for a uid (or the first uid with preferences
    /// when no name hash is given).
    pub fn get_pref_data(&self, lid: Lid, namehash: Option<&[u8; 20]>) -> Result<Option<Vec<u8>>> {
        let dir = self.req_dir(lid)?;
        let mut uid_rn = dir.uidlist;
        while uid_rn != 0 {
            let urec = self.req_uid(uid_rn)?;
            if urec.prefrec != 0 && namehash.map(|nh| *nh == urec.namehash).unwrap_or(true) {
                let prec = self.req_pref(urec.prefrec)?;
                if prec.next != 0 {
                    info!(lid, "warning: can't yet handle long pref records");
                }
                return Ok(Some(prec.data.to_vec()));
            }
            uid_rn = urec.next;
        }
        Ok(None)
    }

    /// Whether `(preftype, algo)` appears in any preference record of a key.
    pub fn is_algo_in_prefs(&self, lid: Lid, preftype: u8, algo: u8) -> Result<bool> {
        let dir = self.req_dir(lid)?;
        let mut uid_rn = dir.uidlist;
        while uid_rn != 0 {
            let urec = self.req_uid(uid_rn)?;
            if urec.prefrec != 0 {
                let prec = self.req_pref(urec.prefrec)?;
                if prec.next != 0 {
                    info!(lid, "warning: can't yet handle long pref records");
                }
                let mut i = 0;
                while i + 1 < ITEMS_PER_PREF_RECORD {
                    if prec.data[i] == preftype && prec.data[i + 1] == algo {
                        return Ok(true);
                    }
                    i += 2;
                }
            }
            uid_rn = urec.next;
        }
        Ok(false)
    }
}

/// Three-character slot flag display: checked slots show valid/expired/
/// revoked, unresolved signers show `?--`.
fn sigflag_str(flag: u8) -> &'static str {
    if flag & SIGF_CHECKED != 0 {
        match (
            flag & SIGF_VALID != 0,
            flag & SIGF_EXPIRED != 0,
            flag & SIGF_REVOKED != 0,
        ) {
            (true, false, false) => "V--",
            (true, true, false) => "VE-",
            (true, false, true) => "V-R",
            (true, true, true) => "VER",
            (false, false, false) => "---",
            (false, true, false) => "-E-",
            (false, false, true) => "--R",
            (false, true, true) => "-ER",
        }
    } else if flag & SIGF_NOPUBKEY != 0 {
        "?--"
    } else {
        "---"
    }
}
