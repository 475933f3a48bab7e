//! Command bodies: open the store, load the keyring, dispatch into the
//! engine, and print what the user asked for.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use trustdb_core::keyring::Keyring;
use trustdb_core::trust::trust_letter;
use trustdb_engine::{TrustDb, TrustOptions};
use trustdb_store::{Store, StoreOptions};

pub struct Ctx {
    pub db: PathBuf,
    pub keyring: PathBuf,
    pub marginals_needed: u32,
    pub completes_needed: u32,
    pub max_cert_depth: u32,
}

impl Ctx {
    fn options(&self) -> TrustOptions {
        TrustOptions {
            marginals_needed: self.marginals_needed,
            completes_needed: self.completes_needed,
            max_cert_depth: self.max_cert_depth,
        }
    }

    /// Open everything and register the ultimate roots, the normal startup.
    fn open(&self) -> Result<TrustDb> {
        let mut db = self.open_without_init()?;
        db.init(1).context("initialize trust database")?;
        Ok(db)
    }

    fn open_without_init(&self) -> Result<TrustDb> {
        let store = Store::open(&self.db, StoreOptions::default())
            .with_context(|| format!("open trust database {}", self.db.display()))?;
        let keyring = Keyring::load(&self.keyring)
            .with_context(|| format!("load keyring {}", self.keyring.display()))?;
        Ok(TrustDb::new(store, keyring, self.options()))
    }
}

pub fn cmd_init(ctx: &Ctx) -> Result<()> {
    let db = ctx.open()?;
    println!(
        "{} ultimately trusted key(s) registered",
        db.ultimate_key_count()
    );
    Ok(())
}

pub fn cmd_update(ctx: &Ctx) -> Result<()> {
    let mut db = ctx.open()?;
    let sum = db.update_trustdb()?;
    println!(
        "{} keys processed ({} updated, {} inserted, {} errors)",
        sum.processed, sum.updated, sum.inserted, sum.errors
    );
    Ok(())
}

pub fn cmd_check(ctx: &Ctx, name: Option<&str>) -> Result<()> {
    let mut db = ctx.open()?;
    let sum = db.check_trustdb(name)?;
    println!(
        "{} keys processed ({} updated, {} skipped, {} errors)",
        sum.processed, sum.updated, sum.skipped, sum.errors
    );
    Ok(())
}

pub fn cmd_trust(ctx: &Ctx, name: &str) -> Result<()> {
    let mut db = ctx.open()?;
    let Some(mut pk) = db.keyring().get_pubkey_byname(name) else {
        bail!("user '{name}' not found in keyring");
    };
    let level = db.check_trust(&mut pk)?;
    println!(
        "{:016X}.{}: trust {}",
        pk.keyid(),
        pk.local_id,
        trust_letter(level)
    );
    Ok(())
}

pub fn cmd_list(ctx: &Ctx, spec: Option<&str>) -> Result<()> {
    let mut db = ctx.open()?;
    let mut out = io::stdout().lock();
    db.list_trustdb(&mut out, spec)?;
    Ok(())
}

pub fn cmd_path(ctx: &Ctx, name: &str, max_depth: i32) -> Result<()> {
    let mut db = ctx.open()?;
    let mut out = io::stdout().lock();
    db.list_trust_path(&mut out, max_depth, name)?;
    Ok(())
}

pub fn cmd_export_ownertrust(ctx: &Ctx) -> Result<()> {
    let db = ctx.open_without_init()?;
    let mut out = io::stdout().lock();
    db.export_ownertrust(&mut out)?;
    Ok(())
}

pub fn cmd_import_ownertrust(ctx: &Ctx, file: &Path) -> Result<()> {
    let mut db = ctx.open_without_init()?;
    if file.as_os_str() == "-" {
        let stdin = io::stdin();
        let mut reader = stdin.lock();
        db.import_ownertrust(&mut reader)?;
    } else {
        let mut reader: BufReader<File> = BufReader::new(
            File::open(file).with_context(|| format!("open {}", file.display()))?,
        );
        db.import_ownertrust(&mut reader)?;
    }
    Ok(())
}

pub fn cmd_set_ownertrust(ctx: &Ctx, fpr_hex: &str, value: u8) -> Result<()> {
    let mut db = ctx.open_without_init()?;
    let fpr = hex::decode(fpr_hex).context("fingerprint is not valid hex")?;
    let Some(lid) = db.store().search_dir_byfpr(&fpr)? else {
        bail!("fingerprint {fpr_hex} not in trust database");
    };
    db.update_ownertrust(lid, value)?;
    println!("lid {lid}: owner trust set to {value}");
    Ok(())
}
