//! Export and import of assigned owner-trust values.
//!
//! The exchange format is line-based ASCII: `<HEX-FINGERPRINT>:<OTRUST>:`
//! with 32- or 40-digit fingerprints. Comment and empty lines are skipped;
//! a line without its trailing newline, or an overlong line, aborts the
//! stream because the rest cannot be framed reliably.

use std::io::{BufRead, Write};

use tracing::{error, info};

use trustdb_core::record::{Lid, RecordBody};
use trustdb_core::trust::ownertrust_letter;

use crate::{EngineError, Result, TrustDb};

const MAX_LINE: usize = 255;

impl TrustDb {
    /// Print every assigned owner-trust value, one record line per key.
    pub fn export_ownertrust<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "# List of assigned trustvalues")?;
        writeln!(out, "# (Use import-ownertrust to restore them)")?;
        for recno in self.store.iter_recnums()? {
            let rec = self.req_any(recno)?;
            let RecordBody::Dir(dir) = rec.body else {
                continue;
            };
            if dir.keylist == 0 {
                error!(lid = dir.lid, "directory record without primary key");
                continue;
            }
            if dir.ownertrust == 0 {
                continue;
            }
            let krec = self.req_key(dir.keylist)?;
            writeln!(
                out,
                "{}:{}:",
                hex::encode_upper(&krec.fingerprint),
                dir.ownertrust
            )?;
        }
        Ok(())
    }

    /// Read owner-trust record lines and apply them: update the directory
    /// when the fingerprint is known, otherwise fetch the key from the ring,
    /// insert it, and retry. Zero values are no-ops. Syncs on completion.
    pub fn import_ownertrust<R: BufRead>(&mut self, input: &mut R) -> Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = input.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            if n > MAX_LINE {
                error!("owner-trust line too long");
                return Err(EngineError::BadOwnertrust("line too long"));
            }
            if !line.ends_with('\n') {
                error!("owner-trust line without newline");
                return Err(EngineError::BadOwnertrust("missing trailing newline"));
            }
            let text = line.trim_end_matches(['\n', '\r']);
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let Some(colon) = text.find(':') else {
                error!("owner-trust line: missing colon");
                continue;
            };
            let fpr_hex = &text[..colon];
            if !fpr_hex.bytes().all(|b| b.is_ascii_hexdigit()) || fpr_hex.is_empty() {
                error!("owner-trust line: missing colon after fingerprint");
                continue;
            }
            if fpr_hex.len() != 32 && fpr_hex.len() != 40 {
                error!(len = fpr_hex.len(), "owner-trust line: invalid fingerprint");
                continue;
            }
            let rest = &text[colon + 1..];
            let Some(value) = rest.strip_suffix(':') else {
                error!("owner-trust line: no trust value");
                continue;
            };
            let Ok(otrust) = value.parse::<u8>() else {
                error!("owner-trust line: no trust value");
                continue;
            };
            if otrust == 0 {
                // nothing assigned, nothing to update or insert
                continue;
            }
            let fpr = hex::decode(fpr_hex).map_err(|_| {
                // all-hex-digits was checked above; even length is implied by 32/40
                EngineError::BadOwnertrust("fingerprint decode")
            })?;

            loop {
                match self.store.search_dir_byfpr(&fpr)? {
                    Some(recno) => {
                        let mut dir = self.req_dir(recno)?;
                        if dir.ownertrust != 0 {
                            info!(lid = recno, from = dir.ownertrust, to = otrust,
                                  "changing trust");
                        } else {
                            info!(lid = recno, to = otrust, "setting trust");
                        }
                        dir.ownertrust = otrust;
                        self.write_dir(recno, dir)?;
                        break;
                    }
                    None => {
                        info!("key not in trust database, searching ring");
                        let Some(mut pk) = self.keyring.get_pubkey_byfprint(&fpr) else {
                            info!("key not in ring - skipped");
                            break;
                        };
                        match self.insert_trust_record(&mut pk) {
                            Ok(()) => continue, // retry the update
                            Err(e) => {
                                error!("insert trust record failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.store.sync()?;
        Ok(())
    }

    /// The assigned owner-trust value for a LID.
    pub fn get_ownertrust(&self, lid: Lid) -> Result<u8> {
        Ok(self.req_dir(lid)?.ownertrust)
    }

    /// Display code for the assigned owner trust.
    pub fn get_ownertrust_info(&self, lid: Lid) -> Result<char> {
        Ok(ownertrust_letter(self.get_ownertrust(lid)?))
    }

    /// Assign a new owner-trust value and sync.
    pub fn update_ownertrust(&mut self, lid: Lid, new_trust: u8) -> Result<()> {
        let mut dir = self.req_dir(lid)?;
        dir.ownertrust = new_trust;
        self.write_dir(lid, dir)?;
        self.store.sync()?;
        Ok(())
    }
}
