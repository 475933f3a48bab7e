//! Lazy walk over every signature slot owned by a directory entry.
//!
//! Yields `(signer_lid, flag)` pairs in user-id order, then signature-record
//! order, then slot order, skipping deleted slots. A chained SIG record whose
//! owner back-pointer does not match the walked directory is corruption.

use trustdb_core::record::{Lid, RecNum, RecordBody, SigRecord, SIGS_PER_RECORD};
use trustdb_store::Store;

use crate::{corrupt, EngineError, Result};

pub struct SigrecIter<'a> {
    store: &'a Store,
    lid: Lid,
    init_done: bool,
    eof: bool,
    next_uid: RecNum,
    rec: Option<SigRecord>,
    index: usize,
}

impl<'a> SigrecIter<'a> {
    pub fn new(store: &'a Store, lid: Lid) -> Self {
        SigrecIter {
            store,
            lid,
            init_done: false,
            eof: false,
            next_uid: 0,
            rec: None,
            index: 0,
        }
    }

    /// Restart the walk from the beginning.
    pub fn reset(&mut self) {
        self.init_done = false;
        self.eof = false;
        self.next_uid = 0;
        self.rec = None;
        self.index = 0;
    }

    /// Next non-deleted signature slot, or None at end of stream.
    pub fn next_sig(&mut self) -> Result<Option<(Lid, u8)>> {
        if self.eof {
            return Ok(None);
        }
        if !self.init_done {
            self.init_done = true;
            let rec = self.store.read(self.lid).map_err(corrupt)?;
            match rec.body {
                RecordBody::Dir(d) => self.next_uid = d.uidlist,
                _ => {
                    self.eof = true;
                    return Ok(None);
                }
            }
            self.rec = None;
            self.index = SIGS_PER_RECORD;
        }

        loop {
            if self.rec.is_none() || self.index >= SIGS_PER_RECORD {
                let mut rnum = self.rec.as_ref().map(|r| r.next).unwrap_or(0);
                while rnum == 0 && self.next_uid != 0 {
                    let urec = self.store.read_uid(self.next_uid).map_err(corrupt)?;
                    self.next_uid = urec.next;
                    rnum = urec.siglist;
                }
                if rnum == 0 {
                    self.eof = true;
                    return Ok(None);
                }
                let srec = self.store.read_sig(rnum).map_err(corrupt)?;
                if srec.lid != self.lid {
                    self.eof = true;
                    return Err(EngineError::Corrupt(format!(
                        "chained sig record {rnum} has a wrong owner"
                    )));
                }
                self.rec = Some(srec);
                self.index = 0;
            }
            if let Some(rec) = &self.rec {
                while self.index < SIGS_PER_RECORD {
                    let slot = rec.sigs[self.index];
                    self.index += 1;
                    if slot.lid != 0 {
                        return Ok(Some((slot.lid, slot.flag)));
                    }
                }
            }
        }
    }
}
