//! The trust engine: maintains the record graph behind a web of trust and
//! derives per-key trust levels from it.
//!
//! A [`TrustDb`] owns the record store, the keyring it reconciles against,
//! the registry of ultimately trusted keys, and the evaluation thresholds.
//! All state lives here; nothing is process-global.

use thiserror::Error;
use tracing::{error, info};

use trustdb_core::keyring::Keyring;
use trustdb_core::lidtab::LidTable;
use trustdb_core::packet::PublicKey;
use trustdb_core::record::{
    DirRecord, HlstRecord, KeyRecord, Lid, PrefRecord, RecNum, RecordBody, SdirRecord, SigRecord,
    TrustRecord, UidRecord,
};
use trustdb_store::{Store, StoreError};

pub mod check;
pub mod hints;
pub mod ownertrust;
pub mod scan;
pub mod sigwalk;
pub mod update;

pub use scan::ScanSummary;
pub use sigwalk::SigrecIter;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The key has no directory record yet.
    #[error("key not found in trust database")]
    NotFound,

    /// The required public key material is not available.
    #[error("public key not available")]
    NoPubkey,

    /// The key's creation time lies in the future.
    #[error("key was created in the future (time warp or clock problem)")]
    TimeConflict,

    /// The keyblock carries no primary key packet.
    #[error("keyblock has no primary key")]
    NoPrimaryKey,

    /// Insert was handed a subkey instead of the primary key.
    #[error("insert requires the primary key")]
    NotPrimary,

    /// A malformed owner-trust stream that cannot be resumed.
    #[error("malformed owner-trust input: {0}")]
    BadOwnertrust(&'static str),

    /// The record graph is inconsistent; the database must be repaired
    /// before it can be trusted again.
    #[error("trust database is corrupted ({0}); run a database check/repair")]
    Corrupt(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Map a store-level failure on a record that must exist into the
/// corruption family.
pub(crate) fn corrupt(e: impl std::fmt::Display) -> EngineError {
    EngineError::Corrupt(e.to_string())
}

/// True for errors that poison the database as a whole; bulk scans stop on
/// these instead of counting them against a single key.
pub fn is_fatal(e: &EngineError) -> bool {
    matches!(e, EngineError::Corrupt(_) | EngineError::Store(_))
}

/// Evaluation thresholds for the trust walk.
#[derive(Debug, Clone, Copy)]
pub struct TrustOptions {
    /// Marginally trusted certifiers needed to consider a key fully valid.
    pub marginals_needed: u32,
    /// Fully trusted certifiers needed to consider a key fully valid.
    pub completes_needed: u32,
    /// Maximum certification-chain depth for the trust walk.
    pub max_cert_depth: u32,
}

impl Default for TrustOptions {
    fn default() -> Self {
        Self {
            marginals_needed: 3,
            completes_needed: 1,
            max_cert_depth: 5,
        }
    }
}

/// The trust database: record store + keyring + ultimate-root registry.
pub struct TrustDb {
    pub(crate) store: Store,
    pub(crate) keyring: Keyring,
    pub(crate) ultikeys: LidTable,
    pub(crate) opts: TrustOptions,
}

impl TrustDb {
    pub fn new(store: Store, keyring: Keyring, opts: TrustOptions) -> Self {
        TrustDb {
            store,
            keyring,
            ultikeys: LidTable::new(),
            opts,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Mutable store access, for maintenance tooling that edits records
    /// directly.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Mutable keyring access, for callers that receive new key material
    /// while the database is open.
    pub fn keyring_mut(&mut self) -> &mut Keyring {
        &mut self.keyring
    }

    pub fn options(&self) -> TrustOptions {
        self.opts
    }

    /// Whether a LID is registered as an ultimate root.
    pub fn is_ultimately_trusted(&self, lid: Lid) -> bool {
        self.ultikeys.contains(lid)
    }

    pub fn ultimate_key_count(&self) -> usize {
        self.ultikeys.len()
    }

    /// Initialize the database. Level 0 only opens it; level 1 additionally
    /// makes sure every local secret key has a directory record and registers
    /// it as an ultimate root.
    pub fn init(&mut self, level: u8) -> Result<()> {
        match level {
            0 => Ok(()),
            1 => self.verify_own_keys(),
            other => Err(EngineError::Corrupt(format!(
                "unsupported init level {other}"
            ))),
        }
    }

    /// Make sure all our own public keys are in the database and remember
    /// their LIDs as trust-path terminals.
    fn verify_own_keys(&mut self) -> Result<()> {
        let secrets: Vec<_> = self.keyring.enum_secret_keys().cloned().collect();
        for sk in secrets {
            let keyid = sk.keyid();
            let Some(mut pk) = self.keyring.get_pubkey(keyid) else {
                info!("key {keyid:016X}: secret key without public key - skipped");
                continue;
            };
            if pk.key != sk.pk.key {
                info!("key {keyid:016X}: secret and public key don't match - skipped");
                continue;
            }
            match self.query_trust_record(&mut pk) {
                Ok(()) => {}
                Err(EngineError::NotFound) => {
                    if let Err(e) = self.insert_trust_record(&mut pk) {
                        error!("key {keyid:016X}: can't put it into the trust database: {e}");
                        continue;
                    }
                }
                Err(e) => {
                    error!("key {keyid:016X}: query of directory record failed: {e}");
                    continue;
                }
            }
            if self.ultikeys.insert(pk.local_id, 0) {
                error!("key {keyid:016X}: already in secret key table");
            } else {
                info!(
                    "key {keyid:016X}.{}: accepted as ultimately trusted key",
                    pk.local_id
                );
            }
        }
        Ok(())
    }

    /// Locate the directory record for a key and cache its LID on the packet.
    /// `NotFound` is recoverable: the key simply is not in the database yet.
    pub fn query_trust_record(&mut self, pk: &mut PublicKey) -> Result<()> {
        self.get_dir_record(pk).map(|_| ())
    }

    pub(crate) fn get_dir_record(&mut self, pk: &mut PublicKey) -> Result<DirRecord> {
        if pk.local_id != 0 {
            return self.req_dir(pk.local_id);
        }
        match self.store.search_dir_bypk(pk)? {
            Some(recno) => {
                pk.local_id = recno;
                self.req_dir(recno)
            }
            None => Err(EngineError::NotFound),
        }
    }

    // --- required record reads: failure means the graph is inconsistent -----

    pub(crate) fn req_any(&self, recno: RecNum) -> Result<TrustRecord> {
        self.store.read(recno).map_err(corrupt)
    }

    pub(crate) fn req_dir(&self, recno: RecNum) -> Result<DirRecord> {
        self.store.read_dir(recno).map_err(corrupt)
    }

    pub(crate) fn req_sdir(&self, recno: RecNum) -> Result<SdirRecord> {
        self.store.read_sdir(recno).map_err(corrupt)
    }

    pub(crate) fn req_key(&self, recno: RecNum) -> Result<KeyRecord> {
        self.store.read_key(recno).map_err(corrupt)
    }

    pub(crate) fn req_uid(&self, recno: RecNum) -> Result<UidRecord> {
        self.store.read_uid(recno).map_err(corrupt)
    }

    pub(crate) fn req_sig(&self, recno: RecNum) -> Result<SigRecord> {
        self.store.read_sig(recno).map_err(corrupt)
    }

    pub(crate) fn req_pref(&self, recno: RecNum) -> Result<PrefRecord> {
        self.store.read_pref(recno).map_err(corrupt)
    }

    pub(crate) fn req_hlst(&self, recno: RecNum) -> Result<HlstRecord> {
        self.store.read_hlst(recno).map_err(corrupt)
    }

    // --- typed writes --------------------------------------------------------

    pub(crate) fn write_rec(&mut self, recnum: RecNum, body: RecordBody) -> Result<()> {
        self.store
            .write(&TrustRecord::new(recnum, body))
            .map_err(Into::into)
    }

    pub(crate) fn write_dir(&mut self, recnum: RecNum, d: DirRecord) -> Result<()> {
        self.write_rec(recnum, RecordBody::Dir(d))
    }

    pub(crate) fn write_sdir(&mut self, recnum: RecNum, s: SdirRecord) -> Result<()> {
        self.write_rec(recnum, RecordBody::Sdir(s))
    }

    pub(crate) fn write_key(&mut self, recnum: RecNum, k: KeyRecord) -> Result<()> {
        self.write_rec(recnum, RecordBody::Key(k))
    }

    pub(crate) fn write_uid(&mut self, recnum: RecNum, u: UidRecord) -> Result<()> {
        self.write_rec(recnum, RecordBody::Uid(u))
    }

    pub(crate) fn write_sig(&mut self, recnum: RecNum, s: SigRecord) -> Result<()> {
        self.write_rec(recnum, RecordBody::Sig(s))
    }

    pub(crate) fn write_pref(&mut self, recnum: RecNum, p: PrefRecord) -> Result<()> {
        self.write_rec(recnum, RecordBody::Pref(p))
    }

    pub(crate) fn write_hlst(&mut self, recnum: RecNum, h: HlstRecord) -> Result<()> {
        self.write_rec(recnum, RecordBody::Hlst(h))
    }
}
