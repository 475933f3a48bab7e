//! Resolving deferred signature checks after a shadow directory is promoted.
//!
//! The hint list of a promoted shadow directory names every directory with at
//! least one signature slot pointing at the newly-known key. For each hinted
//! directory the owning keyblock is reloaded, the matching signature packets
//! are located by uid name hash and signer key id, and the slots are settled
//! the same way the update engine settles them. Processed hint-list records
//! are deleted; the whole resolver runs inside the promotion transaction.

use tracing::{error, info, warn};

use trustdb_core::crypto::keyid_from_fingerprint;
use trustdb_core::keyring::SigCheck;
use trustdb_core::packet::{is_certification_class, Keyblock, Packet};
use trustdb_core::record::{
    Lid, RecNum, RecordBody, SigRecord, SIGF_CHECKED, SIGF_NOPUBKEY, SIGF_VALID,
};

use crate::{EngineError, Result, TrustDb};

impl TrustDb {
    /// Re-check every deferred signature hanging off `hintlist`, where
    /// `hint_owner` is the LID of the freshly promoted directory. Diagnostic
    /// conditions are logged and skipped; only database corruption aborts.
    pub(crate) fn process_hintlist(&mut self, hintlist: RecNum, hint_owner: Lid) -> Result<()> {
        let mut hlst_rn = hintlist;
        while hlst_rn != 0 {
            let hlst = self.req_hlst(hlst_rn)?;

            for (hlst_idx, &lid) in hlst.rnum.iter().enumerate() {
                if lid == 0 {
                    continue;
                }
                let dirrec = match self.req_any(lid)?.body {
                    RecordBody::Dir(d) => d,
                    other => {
                        error!(hlst = hlst_rn, idx = hlst_idx, owner = hint_owner,
                               "hint entry does not point to a dir record (got {})",
                               other.kind());
                        continue;
                    }
                };
                if dirrec.keylist == 0 {
                    error!(lid, "hinted directory has no key");
                    continue;
                }

                let krec = self.req_key(dirrec.keylist)?;
                let kb = match self.keyring.get_keyblock_byfprint(&krec.fingerprint) {
                    Some(kb) => kb.clone(),
                    None => {
                        error!(lid, "can't get keyblock for hinted directory");
                        continue;
                    }
                };

                // check every slot of every uid that waits on the new key
                let mut uid_rn = dirrec.uidlist;
                while uid_rn != 0 {
                    let urec = self.req_uid(uid_rn)?;
                    let mut sig_rn = urec.siglist;
                    while sig_rn != 0 {
                        let mut sigrec = self.req_sig(sig_rn)?;
                        let next = sigrec.next;
                        let mut dirty = false;
                        for i in 0..sigrec.sigs.len() {
                            if sigrec.sigs[i].lid == 0 {
                                continue;
                            }
                            if sigrec.sigs[i].lid != hint_owner {
                                continue;
                            }
                            dirty |= self.check_hint_sig(
                                lid,
                                &kb,
                                &urec.namehash,
                                &mut sigrec,
                                sig_rn,
                                i,
                                hint_owner,
                            )?;
                        }
                        if dirty {
                            self.write_sig(sig_rn, sigrec)?;
                        }
                        sig_rn = next;
                    }
                    uid_rn = urec.next;
                }
            }

            let next = hlst.next;
            self.store.delete(hlst_rn)?;
            hlst_rn = next;
        }
        Ok(())
    }

    /// Settle one deferred slot. Returns whether the slot changed.
    #[allow(clippy::too_many_arguments)]
    fn check_hint_sig(
        &mut self,
        lid: Lid,
        kb: &Keyblock,
        uid_namehash: &[u8; 20],
        sigrec: &mut SigRecord,
        sigrec_rn: RecNum,
        sigidx: usize,
        hint_owner: Lid,
    ) -> Result<bool> {
        if sigrec.sigs[sigidx].flag & SIGF_CHECKED != 0 {
            info!(rec = sigrec_rn, idx = sigidx, owner = hint_owner,
                  "slot in hintlist but already marked as checked");
        }
        if sigrec.sigs[sigidx].flag & SIGF_NOPUBKEY == 0 {
            info!(rec = sigrec_rn, idx = sigidx, owner = hint_owner,
                  "slot in hintlist but not marked as waiting");
        }

        // the signer is the promoted directory itself
        let signer_dir = match self.req_any(sigrec.sigs[sigidx].lid)?.body {
            RecordBody::Dir(d) => d,
            other => {
                return Err(EngineError::Corrupt(format!(
                    "sig slot {sigrec_rn}[{sigidx}] points to a {} record",
                    other.kind()
                )))
            }
        };
        if signer_dir.keylist == 0 {
            error!(lid = signer_dir.lid, "signer directory has no primary key");
            return Ok(false);
        }
        let signer_key = self.req_key(signer_dir.keylist)?;
        let signer_keyid = keyid_from_fingerprint(&signer_key.fingerprint);

        // locate the matching signature packet: the hinted uid, then the
        // first certification by the signer
        let mut found_uid = false;
        let mut sig_index = None;
        for (i, pkt) in kb.packets.iter().enumerate() {
            match pkt {
                Packet::UserId(u) => {
                    if found_uid {
                        break;
                    }
                    if u.namehash() == *uid_namehash {
                        found_uid = true;
                    }
                }
                Packet::Signature(s) if found_uid => {
                    if s.signer_keyid == signer_keyid && is_certification_class(s.sig_class) {
                        sig_index = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        if !found_uid {
            info!(lid, "user id not found in keyblock");
            return Ok(false);
        }
        let Some(sig_index) = sig_index else {
            info!(lid, "user id without matching signature");
            return Ok(false);
        };

        let (check, is_selfsig) = self.keyring.check_key_signature(kb, sig_index);
        if is_selfsig {
            error!(lid, "self-signature found through a hintlist");
            return Ok(false);
        }
        sigrec.sigs[sigidx].flag = match check {
            SigCheck::Good => {
                info!(
                    "lid {lid}, uid {:02X}{:02X}, sig {signer_keyid:016X}: \
                     good signature (deferred check)",
                    uid_namehash[18], uid_namehash[19]
                );
                SIGF_CHECKED | SIGF_VALID
            }
            SigCheck::NoPubkey => {
                warn!(
                    "lid {lid}, sig {signer_keyid:016X}: \
                     very strange: no public key for a promoted directory"
                );
                SIGF_NOPUBKEY
            }
            SigCheck::Bad => {
                info!(
                    "lid {lid}, sig {signer_keyid:016X}: invalid signature (deferred check)"
                );
                SIGF_CHECKED
            }
        };
        Ok(true)
    }
}
