//! On-disk record model: a tagged union over the seven record types that make
//! up the trust graph, addressed by a monotonically allocated record number.
//!
//! Directory records (and shadow directories) are the graph roots; their own
//! record number doubles as the key's stable local id (LID). KEY, UID, SIG and
//! PREF records carry the owning directory's LID as a back-pointer, used only
//! as a consistency check, never for navigation. Links are record numbers with
//! 0 meaning "none".

use serde::{Deserialize, Serialize};

pub type RecNum = u64;
pub type Lid = u64;

/// Signature slots per SIG record.
pub const SIGS_PER_RECORD: usize = 4;
/// Packed preference bytes per PREF record (pairs of type, algo).
pub const ITEMS_PER_PREF_RECORD: usize = 30;
/// Directory LIDs per hint-list record.
pub const ITEMS_PER_HLST_RECORD: usize = 6;
/// Upper bound on stored fingerprint length.
pub const MAX_FINGERPRINT_LEN: usize = 20;

/// Directory flags.
pub const DIRF_CHECKED: u8 = 0x01;
pub const DIRF_REVOKED: u8 = 0x02;

/// User-id flags.
pub const UIDF_CHECKED: u8 = 0x01;
pub const UIDF_VALID: u8 = 0x02;

/// Signature-slot flags.
pub const SIGF_CHECKED: u8 = 0x01;
pub const SIGF_VALID: u8 = 0x02;
pub const SIGF_EXPIRED: u8 = 0x04;
pub const SIGF_REVOKED: u8 = 0x08;
pub const SIGF_NOPUBKEY: u8 = 0x10;

/// Preference types stored in PREF records.
pub const PREFTYPE_SYM: u8 = 1;
pub const PREFTYPE_HASH: u8 = 2;
pub const PREFTYPE_COMPR: u8 = 3;

/// Record type tags, used for typed reads and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Free,
    Dir,
    Sdir,
    Key,
    Uid,
    Sig,
    Pref,
    Hlst,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordKind::Free => "free",
            RecordKind::Dir => "dir",
            RecordKind::Sdir => "sdir",
            RecordKind::Key => "key",
            RecordKind::Uid => "uid",
            RecordKind::Sig => "sig",
            RecordKind::Pref => "pref",
            RecordKind::Hlst => "hlst",
        };
        f.pad(s)
    }
}

/// Root record for a known public key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirRecord {
    /// Equal to the record's own record number, always.
    pub lid: Lid,
    pub ownertrust: u8,
    pub dirflags: u8,
    /// Head of the KEY chain (primary key first).
    pub keylist: RecNum,
    /// Head of the UID chain.
    pub uidlist: RecNum,
}

/// Placeholder root for a key we have seen signatures from but do not hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdirRecord {
    pub lid: Lid,
    pub keyid: u64,
    pub pubkey_algo: u8,
    /// Head of the hint-list chain.
    pub hintlist: RecNum,
}

/// A public key (primary or subkey) under a directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Owning directory's LID.
    pub lid: Lid,
    pub pubkey_algo: u8,
    pub fingerprint: Vec<u8>,
    pub next: RecNum,
}

/// A user identity under a directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UidRecord {
    /// Owning directory's LID.
    pub lid: Lid,
    pub namehash: [u8; 20],
    pub uidflags: u8,
    /// Head of the SIG chain for this user id.
    pub siglist: RecNum,
    /// Head of the PREF chain for this user id.
    pub prefrec: RecNum,
    pub next: RecNum,
}

/// One certification: who signed (by LID) and what we know about it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SigSlot {
    /// LID of the signer's DIR or SDIR; 0 marks a deleted slot.
    pub lid: Lid,
    pub flag: u8,
}

/// A block of signature slots belonging to one user id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SigRecord {
    /// Owning directory's LID.
    pub lid: Lid,
    pub next: RecNum,
    pub sigs: [SigSlot; SIGS_PER_RECORD],
}

/// Packed (preference type, algorithm) byte pairs for one user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefRecord {
    /// Owning directory's LID.
    pub lid: Lid,
    pub next: RecNum,
    pub data: [u8; ITEMS_PER_PREF_RECORD],
}

impl Default for PrefRecord {
    fn default() -> Self {
        PrefRecord {
            lid: 0,
            next: 0,
            data: [0; ITEMS_PER_PREF_RECORD],
        }
    }
}

/// LIDs of directories whose signatures wait on the shadowed key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HlstRecord {
    pub next: RecNum,
    pub rnum: [u64; ITEMS_PER_HLST_RECORD],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordBody {
    Free,
    Dir(DirRecord),
    Sdir(SdirRecord),
    Key(KeyRecord),
    Uid(UidRecord),
    Sig(SigRecord),
    Pref(PrefRecord),
    Hlst(HlstRecord),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Free => RecordKind::Free,
            RecordBody::Dir(_) => RecordKind::Dir,
            RecordBody::Sdir(_) => RecordKind::Sdir,
            RecordBody::Key(_) => RecordKind::Key,
            RecordBody::Uid(_) => RecordKind::Uid,
            RecordBody::Sig(_) => RecordKind::Sig,
            RecordBody::Pref(_) => RecordKind::Pref,
            RecordBody::Hlst(_) => RecordKind::Hlst,
        }
    }
}

/// One stored record: its record number plus the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub recnum: RecNum,
    pub body: RecordBody,
}

impl TrustRecord {
    pub fn new(recnum: RecNum, body: RecordBody) -> Self {
        TrustRecord { recnum, body }
    }

    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }
}
