//! Record store for the trust database.
//!
//! Records are addressed by a monotonically allocated record number and held
//! in RocksDB column families: the records themselves, two search indexes
//! (directory-by-fingerprint and shadow-directory-by-keyid), and a meta family
//! for the schema guard and the allocator. Deleting a record leaves a `Free`
//! tombstone so record numbers are never reused.
//!
//! A single-level transaction accumulates writes in an in-memory overlay that
//! reads and searches consult first, so an update sees its own uncommitted
//! writes; commit materializes the overlay into one atomic `WriteBatch`.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    path::Path,
    sync::Arc,
};

use rocksdb::{
    ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    WriteBatch, WriteOptions,
};

use trustdb_core::packet::PublicKey;
use trustdb_core::record::{
    DirRecord, HlstRecord, KeyRecord, PrefRecord, RecNum, RecordBody, RecordKind, SdirRecord,
    SigRecord, TrustRecord, UidRecord,
};

mod error;
pub use error::{Result, StoreError};

type Db = DBWithThreadMode<MultiThreaded>;

const CF_RECORDS: &str = "records";
const CF_DIR_BY_FPR: &str = "dir_by_fpr";
const CF_SDIR_BY_KEYID: &str = "sdir_by_keyid";
const CF_META: &str = "meta";

const SCHEMA: &str = "trustdb:v1";
const META_SCHEMA: &[u8] = b"schema_version";
const META_NEXT_RECNUM: &[u8] = b"next_recnum";

#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub create_if_missing: bool,
    pub sync_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_writes: true,
        }
    }
}

/// Pending state of an open transaction (also used for one-shot writes).
#[derive(Default)]
struct Overlay {
    records: BTreeMap<RecNum, RecordBody>,
    fpr_put: BTreeMap<Vec<u8>, RecNum>,
    fpr_del: BTreeSet<Vec<u8>>,
    sdir_put: BTreeMap<Vec<u8>, RecNum>,
    sdir_del: BTreeSet<Vec<u8>>,
    dirty: bool,
}

pub struct Store {
    db: Arc<Db>,
    sync_writes: bool,
    next_recnum: RecNum,
    txn: Option<Overlay>,
}

fn sdir_index_key(keyid: u64, pubkey_algo: u8) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    k.extend_from_slice(&keyid.to_be_bytes());
    k.push(pubkey_algo);
    k
}

impl Store {
    pub fn open(path: &Path, opts: StoreOptions) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(opts.create_if_missing);
        db_opts.create_missing_column_families(true);
        db_opts.set_paranoid_checks(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_RECORDS, Options::default()),
            ColumnFamilyDescriptor::new(CF_DIR_BY_FPR, Options::default()),
            ColumnFamilyDescriptor::new(CF_SDIR_BY_KEYID, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = Db::open_cf_descriptors(&db_opts, path, cfs)?;
        let mut this = Self {
            db: Arc::new(db),
            sync_writes: opts.sync_writes,
            next_recnum: 1,
            txn: None,
        };

        // Schema guard
        match this.get_meta(META_SCHEMA)? {
            Some(v) if v == SCHEMA.as_bytes() => {}
            None => this.put_meta(META_SCHEMA, SCHEMA.as_bytes())?,
            Some(v) => {
                return Err(StoreError::Schema(
                    String::from_utf8_lossy(&v).into_owned(),
                ))
            }
        }

        // Allocator state; record number 0 is the nil link and never handed out.
        if let Some(v) = this.get_meta(META_NEXT_RECNUM)? {
            let mut arr = [0u8; 8];
            if v.len() != 8 {
                return Err(StoreError::Corrupt("bad allocator state".into()));
            }
            arr.copy_from_slice(&v);
            this.next_recnum = u64::from_be_bytes(arr);
        } else {
            this.put_meta(META_NEXT_RECNUM, &1u64.to_be_bytes())?;
        }
        Ok(this)
    }

    fn cf(&self, name: &str) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db.cf_handle(name).expect("missing column family")
    }

    fn write_opts(&self) -> WriteOptions {
        let mut w = WriteOptions::default();
        w.set_sync(self.sync_writes);
        w
    }

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(&self.cf(CF_META), key)?)
    }

    fn put_meta(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut b = WriteBatch::default();
        b.put_cf(&self.cf(CF_META), key, val);
        self.db.write_opt(b, &self.write_opts())?;
        Ok(())
    }

    /// Allocate a fresh record number. Numbers burned by a cancelled
    /// transaction stay burned; the sequence only moves forward.
    pub fn new_recnum(&mut self) -> Result<RecNum> {
        let n = self.next_recnum;
        self.next_recnum += 1;
        self.put_meta(META_NEXT_RECNUM, &self.next_recnum.to_be_bytes())?;
        Ok(n)
    }

    // --- record read path ----------------------------------------------------

    fn read_stored(&self, recno: RecNum) -> Result<Option<RecordBody>> {
        match self.db.get_cf(&self.cf(CF_RECORDS), recno.to_be_bytes())? {
            Some(bytes) => {
                let rec: TrustRecord = serde_cbor::from_slice(&bytes)?;
                if rec.recnum != recno {
                    return Err(StoreError::Corrupt(format!(
                        "record {} carries record number {}",
                        recno, rec.recnum
                    )));
                }
                Ok(Some(rec.body))
            }
            None => Ok(None),
        }
    }

    /// Read a record, overlay first. Deleted records read as `Free`.
    pub fn read(&self, recno: RecNum) -> Result<TrustRecord> {
        if let Some(txn) = &self.txn {
            if let Some(body) = txn.records.get(&recno) {
                return Ok(TrustRecord::new(recno, body.clone()));
            }
        }
        match self.read_stored(recno)? {
            Some(body) => Ok(TrustRecord::new(recno, body)),
            None => Err(StoreError::NotFound(recno)),
        }
    }

    fn expect_kind(&self, recno: RecNum, expected: RecordKind) -> Result<RecordBody> {
        let rec = self.read(recno)?;
        if rec.kind() != expected {
            return Err(StoreError::TypeMismatch {
                recnum: recno,
                expected,
                got: rec.kind(),
            });
        }
        Ok(rec.body)
    }

    pub fn read_dir(&self, recno: RecNum) -> Result<DirRecord> {
        match self.expect_kind(recno, RecordKind::Dir)? {
            RecordBody::Dir(d) => Ok(d),
            _ => unreachable!(),
        }
    }

    pub fn read_sdir(&self, recno: RecNum) -> Result<SdirRecord> {
        match self.expect_kind(recno, RecordKind::Sdir)? {
            RecordBody::Sdir(s) => Ok(s),
            _ => unreachable!(),
        }
    }

    pub fn read_key(&self, recno: RecNum) -> Result<KeyRecord> {
        match self.expect_kind(recno, RecordKind::Key)? {
            RecordBody::Key(k) => Ok(k),
            _ => unreachable!(),
        }
    }

    pub fn read_uid(&self, recno: RecNum) -> Result<UidRecord> {
        match self.expect_kind(recno, RecordKind::Uid)? {
            RecordBody::Uid(u) => Ok(u),
            _ => unreachable!(),
        }
    }

    pub fn read_sig(&self, recno: RecNum) -> Result<SigRecord> {
        match self.expect_kind(recno, RecordKind::Sig)? {
            RecordBody::Sig(s) => Ok(s),
            _ => unreachable!(),
        }
    }

    pub fn read_pref(&self, recno: RecNum) -> Result<PrefRecord> {
        match self.expect_kind(recno, RecordKind::Pref)? {
            RecordBody::Pref(p) => Ok(p),
            _ => unreachable!(),
        }
    }

    pub fn read_hlst(&self, recno: RecNum) -> Result<HlstRecord> {
        match self.expect_kind(recno, RecordKind::Hlst)? {
            RecordBody::Hlst(h) => Ok(h),
            _ => unreachable!(),
        }
    }

    // --- record write path ---------------------------------------------------

    /// Index deltas implied by replacing `old` with `new` at `recno`.
    fn index_delta(ov: &mut Overlay, recno: RecNum, old: Option<&RecordBody>, new: &RecordBody) {
        if let Some(old) = old {
            match old {
                RecordBody::Key(k) if !matches!(new, RecordBody::Key(nk) if nk.fingerprint == k.fingerprint) =>
                {
                    ov.fpr_put.remove(&k.fingerprint);
                    ov.fpr_del.insert(k.fingerprint.clone());
                }
                RecordBody::Sdir(s)
                    if !matches!(new, RecordBody::Sdir(ns) if ns.keyid == s.keyid && ns.pubkey_algo == s.pubkey_algo) =>
                {
                    let key = sdir_index_key(s.keyid, s.pubkey_algo);
                    ov.sdir_put.remove(&key);
                    ov.sdir_del.insert(key);
                }
                _ => {}
            }
        }
        match new {
            RecordBody::Key(k) => {
                ov.fpr_del.remove(&k.fingerprint);
                ov.fpr_put.insert(k.fingerprint.clone(), k.lid);
            }
            RecordBody::Sdir(s) => {
                let key = sdir_index_key(s.keyid, s.pubkey_algo);
                ov.sdir_del.remove(&key);
                ov.sdir_put.insert(key, recno);
            }
            _ => {}
        }
        ov.records.insert(recno, new.clone());
        ov.dirty = true;
    }

    fn effective(&self, recno: RecNum) -> Result<Option<RecordBody>> {
        if let Some(txn) = &self.txn {
            if let Some(body) = txn.records.get(&recno) {
                return Ok(Some(body.clone()));
            }
        }
        self.read_stored(recno)
    }

    /// Write a record by its record number.
    pub fn write(&mut self, rec: &TrustRecord) -> Result<()> {
        let old = self.effective(rec.recnum)?;
        match self.txn.as_mut() {
            Some(txn) => {
                Self::index_delta(txn, rec.recnum, old.as_ref(), &rec.body);
                Ok(())
            }
            None => {
                let mut ov = Overlay::default();
                Self::index_delta(&mut ov, rec.recnum, old.as_ref(), &rec.body);
                self.flush_overlay(ov)
            }
        }
    }

    /// Mark a record deleted. The record number stays allocated; the slot
    /// reads back as `Free`.
    pub fn delete(&mut self, recno: RecNum) -> Result<()> {
        let old = self.effective(recno)?;
        if old.is_none() {
            return Err(StoreError::NotFound(recno));
        }
        match self.txn.as_mut() {
            Some(txn) => {
                Self::index_delta(txn, recno, old.as_ref(), &RecordBody::Free);
                Ok(())
            }
            None => {
                let mut ov = Overlay::default();
                Self::index_delta(&mut ov, recno, old.as_ref(), &RecordBody::Free);
                self.flush_overlay(ov)
            }
        }
    }

    fn flush_overlay(&mut self, ov: Overlay) -> Result<()> {
        let mut b = WriteBatch::default();
        for (recno, body) in &ov.records {
            let rec = TrustRecord::new(*recno, body.clone());
            b.put_cf(
                &self.cf(CF_RECORDS),
                recno.to_be_bytes(),
                serde_cbor::to_vec(&rec)?,
            );
        }
        for fpr in &ov.fpr_del {
            b.delete_cf(&self.cf(CF_DIR_BY_FPR), fpr);
        }
        for (fpr, lid) in &ov.fpr_put {
            b.put_cf(&self.cf(CF_DIR_BY_FPR), fpr, lid.to_be_bytes());
        }
        for key in &ov.sdir_del {
            b.delete_cf(&self.cf(CF_SDIR_BY_KEYID), key);
        }
        for (key, recno) in &ov.sdir_put {
            b.put_cf(&self.cf(CF_SDIR_BY_KEYID), key, recno.to_be_bytes());
        }
        self.db.write_opt(b, &self.write_opts())?;
        Ok(())
    }

    // --- transactions --------------------------------------------------------

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(StoreError::NestedTransaction);
        }
        self.txn = Some(Overlay::default());
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        let ov = self.txn.take().ok_or(StoreError::NoTransaction)?;
        self.flush_overlay(ov)
    }

    pub fn cancel_transaction(&mut self) -> Result<()> {
        if self.txn.take().is_none() {
            return Err(StoreError::NoTransaction);
        }
        Ok(())
    }

    /// Whether the open transaction has written anything.
    pub fn is_dirty(&self) -> bool {
        self.txn.as_ref().map(|t| t.dirty).unwrap_or(false)
    }

    /// Flush everything to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // --- searches ------------------------------------------------------------

    /// Find the DIR owning a key with this exact fingerprint.
    pub fn search_dir_byfpr(&self, fpr: &[u8]) -> Result<Option<RecNum>> {
        if let Some(txn) = &self.txn {
            if let Some(lid) = txn.fpr_put.get(fpr) {
                return Ok(Some(*lid));
            }
            if txn.fpr_del.contains(fpr) {
                return Ok(None);
            }
        }
        match self.db.get_cf(&self.cf(CF_DIR_BY_FPR), fpr)? {
            Some(v) => {
                let mut arr = [0u8; 8];
                if v.len() != 8 {
                    return Err(StoreError::Corrupt("bad fingerprint index entry".into()));
                }
                arr.copy_from_slice(&v);
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Find the DIR for any key of this public key packet.
    pub fn search_dir_bypk(&self, pk: &PublicKey) -> Result<Option<RecNum>> {
        self.search_dir_byfpr(&pk.fingerprint())
    }

    /// Find a shadow directory by key id; `pubkey_algo == 0` matches any
    /// algorithm.
    pub fn search_sdir(&self, keyid: u64, pubkey_algo: u8) -> Result<Option<RecNum>> {
        if pubkey_algo != 0 {
            let key = sdir_index_key(keyid, pubkey_algo);
            if let Some(txn) = &self.txn {
                if let Some(recno) = txn.sdir_put.get(&key) {
                    return Ok(Some(*recno));
                }
                if txn.sdir_del.contains(&key) {
                    return Ok(None);
                }
            }
            return match self.db.get_cf(&self.cf(CF_SDIR_BY_KEYID), &key)? {
                Some(v) => {
                    let mut arr = [0u8; 8];
                    if v.len() != 8 {
                        return Err(StoreError::Corrupt("bad key-id index entry".into()));
                    }
                    arr.copy_from_slice(&v);
                    Ok(Some(u64::from_be_bytes(arr)))
                }
                None => Ok(None),
            };
        }

        // wildcard: any algo under this key id
        let prefix = keyid.to_be_bytes();
        if let Some(txn) = &self.txn {
            for (k, recno) in txn.sdir_put.range(prefix.to_vec()..) {
                if !k.starts_with(&prefix) {
                    break;
                }
                return Ok(Some(*recno));
            }
        }
        let iter = self.db.iterator_cf(
            &self.cf(CF_SDIR_BY_KEYID),
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for kv in iter {
            let (k, v) = kv?;
            if !k.starts_with(&prefix) {
                break;
            }
            if let Some(txn) = &self.txn {
                if txn.sdir_del.contains(k.as_ref()) {
                    continue;
                }
            }
            let mut arr = [0u8; 8];
            if v.len() != 8 {
                return Err(StoreError::Corrupt("bad key-id index entry".into()));
            }
            arr.copy_from_slice(&v);
            return Ok(Some(u64::from_be_bytes(arr)));
        }
        Ok(None)
    }

    /// Ascending record numbers of everything ever written (free slots
    /// included), merged with the open transaction.
    pub fn iter_recnums(&self) -> Result<Vec<RecNum>> {
        let mut out: BTreeSet<RecNum> = BTreeSet::new();
        let iter = self
            .db
            .iterator_cf(&self.cf(CF_RECORDS), IteratorMode::Start);
        for kv in iter {
            let (k, _) = kv?;
            if k.len() != 8 {
                return Err(StoreError::Corrupt("bad record key".into()));
            }
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&k);
            out.insert(u64::from_be_bytes(arr));
        }
        if let Some(txn) = &self.txn {
            out.extend(txn.records.keys().copied());
        }
        Ok(out.into_iter().collect())
    }
}

/// Debug pretty-printer for a record.
pub fn dump_record(rec: &TrustRecord) -> String {
    let mut s = String::new();
    let _ = write!(s, "rec {:6} {:4}", rec.recnum, rec.kind());
    match &rec.body {
        RecordBody::Free => {}
        RecordBody::Dir(d) => {
            let _ = write!(
                s,
                " lid={} ownertrust={:02x} flags={:02x} keylist={} uidlist={}",
                d.lid, d.ownertrust, d.dirflags, d.keylist, d.uidlist
            );
        }
        RecordBody::Sdir(sd) => {
            let _ = write!(
                s,
                " lid={} keyid={:016X} algo={} hintlist={}",
                sd.lid, sd.keyid, sd.pubkey_algo, sd.hintlist
            );
        }
        RecordBody::Key(k) => {
            let _ = write!(
                s,
                " lid={} algo={} fpr={} next={}",
                k.lid,
                k.pubkey_algo,
                hex::encode_upper(&k.fingerprint),
                k.next
            );
        }
        RecordBody::Uid(u) => {
            let _ = write!(
                s,
                " lid={} namehash={} flags={:02x} siglist={} prefrec={} next={}",
                u.lid,
                hex::encode_upper(&u.namehash[16..]),
                u.uidflags,
                u.siglist,
                u.prefrec,
                u.next
            );
        }
        RecordBody::Sig(sg) => {
            let _ = write!(s, " lid={} next={} slots=[", sg.lid, sg.next);
            for (i, slot) in sg.sigs.iter().enumerate() {
                if i > 0 {
                    s.push(' ');
                }
                let _ = write!(s, "{}/{:02x}", slot.lid, slot.flag);
            }
            s.push(']');
        }
        RecordBody::Pref(p) => {
            let _ = write!(
                s,
                " lid={} next={} data={}",
                p.lid,
                p.next,
                hex::encode_upper(p.data)
            );
        }
        RecordBody::Hlst(h) => {
            let _ = write!(s, " next={} rnums={:?}", h.next, h.rnum);
        }
    }
    s
}
