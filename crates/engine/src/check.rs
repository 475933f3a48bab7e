//! Deriving a trust level: a bounded-depth walk of the signature graph from
//! the key in question toward the ultimate roots.
//!
//! The walk has no cycle detection; the hard depth bound keeps it finite.
//! One hop away from an ultimate root the signer's own trust value decides
//! the verdict outright, with the needed-certifier counts treated as one.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use trustdb_core::packet::PublicKey;
use trustdb_core::record::{
    DirRecord, DIRF_REVOKED, SIGF_CHECKED, SIGF_EXPIRED, SIGF_REVOKED, SIGF_VALID,
};
use trustdb_core::trust::{
    clamp_certifier, trust_letter, TRUST_EXPIRED, TRUST_FLAG_REVOKED, TRUST_FULLY, TRUST_MARGINAL,
    TRUST_MASK, TRUST_ULTIMATE, TRUST_UNDEFINED,
};

use crate::{EngineError, Result, TrustDb};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TrustDb {
    /// Compute the trust level for a key, inserting it into the database
    /// first if it is not there yet. Does not ask any questions.
    pub fn check_trust(&mut self, pk: &mut PublicKey) -> Result<u8> {
        self.check_trust_at(pk, unix_now())
    }

    /// Like [`TrustDb::check_trust`] with an explicit notion of "now".
    pub fn check_trust_at(&mut self, pk: &mut PublicKey, now: u64) -> Result<u8> {
        let keyid = pk.keyid();

        let drec = match self.get_dir_record(pk) {
            Ok(d) => d,
            Err(EngineError::NotFound) => {
                self.insert_trust_record(pk)?;
                info!(
                    "key {keyid:016X}.{}: inserted into trust database",
                    pk.local_id
                );
                self.req_dir(pk.local_id)?
            }
            Err(e) => return Err(e),
        };

        if pk.created_at > now {
            info!(
                "key {keyid:016X}.{}: created in future (time warp or clock problem)",
                pk.local_id
            );
            return Err(EngineError::TimeConflict);
        }

        let trustlevel = if pk.expires_at != 0 && pk.expires_at <= now {
            info!(
                "key {keyid:016X}.{}: expired at {}",
                pk.local_id, pk.expires_at
            );
            TRUST_EXPIRED
        } else {
            self.do_check(&drec)?
        };

        debug!("check_trust returns trustlevel {trustlevel:#04x}");
        Ok(trustlevel)
    }

    /// Display code for a key's computed trust; '?' when the check fails.
    pub fn query_trust_info(&mut self, pk: &mut PublicKey) -> char {
        match self.check_trust(pk) {
            Ok(level) => trust_letter(level),
            Err(_) => '?',
        }
    }

    fn do_check(&self, drec: &DirRecord) -> Result<u8> {
        if drec.keylist == 0 {
            return Err(EngineError::Corrupt(format!(
                "directory {} has no keys",
                drec.lid
            )));
        }
        if drec.uidlist == 0 {
            return Err(EngineError::Corrupt(format!(
                "directory {} has no user ids",
                drec.lid
            )));
        }

        let mut trustlevel = self.verify_key(1, self.opts.max_cert_depth, drec)?;
        if drec.dirflags & DIRF_REVOKED != 0 {
            trustlevel |= TRUST_FLAG_REVOKED;
        }
        Ok(trustlevel)
    }

    /// Walk the signature graph looking for a path to an ultimately trusted
    /// key, aggregating marginal and complete certifications.
    pub(crate) fn verify_key(
        &self,
        depth: u32,
        max_depth: u32,
        drec: &DirRecord,
    ) -> Result<u8> {
        if depth >= max_depth {
            return Ok(TRUST_UNDEFINED);
        }
        if self.ultikeys.contains(drec.lid) {
            // end of a path
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
                    if slot.lid == 0 {
                        continue;
                    }
                    if slot.flag & SIGF_CHECKED == 0 {
                        continue;
                    }
                    if slot.flag & SIGF_VALID == 0 {
                        continue;
                    }
                    if slot.flag & SIGF_EXPIRED != 0 {
                        continue;
                    }
                    if slot.flag & SIGF_REVOKED != 0 {
                        continue;
                    }

                    let signer = self.req_dir(slot.lid)?;
                    let ot = clamp_certifier(signer.ownertrust);

                    let nt = self.verify_key(depth + 1, max_depth, &signer)? & TRUST_MASK;
                    if nt < TRUST_MARGINAL {
                        continue;
                    }
                    if nt == TRUST_ULTIMATE {
                        // we have signed this key ourselves; only here the
                        // needed-certifier counts collapse to one, and the
                        // signer's own trust value is the verdict - even
                        // when that value is still unset
                        debug!(lid = drec.lid, signer = signer.lid,
                               ot = %trust_letter(ot), "first-level verdict");
                        return Ok(ot);
                    }

                    if nt >= TRUST_FULLY {
                        fully += 1;
                    }
                    if nt >= TRUST_MARGINAL {
                        marginal += 1;
                    }
                    if fully >= self.opts.completes_needed
                        || marginal >= self.opts.marginals_needed
                    {
                        return Ok(TRUST_FULLY);
                    }
                }
                sig_rn = srec.next;
            }
            uid_rn = urec.next;
        }

        if marginal > 0 {
            Ok(TRUST_MARGINAL)
        } else {
            Ok(TRUST_UNDEFINED)
        }
    }
}
