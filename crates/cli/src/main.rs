//! Trust database CLI.
//!
//! Commands:
//!   1) init
//!      - Opens (creating if needed) the database and registers every local
//!        secret key as an ultimately trusted root.
//!   2) update / check [NAME]
//!      - Reconciles the stored graph against the keyring, whole-ring or
//!        per key.
//!   3) trust NAME
//!      - Computes and prints the trust level for one key.
//!   4) list [#LID | NAME] / path NAME
//!      - Record dumps, signature listings, and certification paths.
//!   5) export-ownertrust / import-ownertrust FILE / set-ownertrust FPR N
//!      - Owner-trust round-trips ('-' reads stdin on import).
//!   6) gen-fixtures DIR
//!      - Writes a small deterministic demo keyring.

mod commands;
mod fixtures;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI definition
#[derive(Parser)]
#[command(name = "trustdb", version)]
struct Cli {
    /// Database directory
    #[arg(long, default_value = "trustdb.d")]
    db: PathBuf,

    /// Keyring file (CBOR)
    #[arg(long, default_value = "keyring.cbor")]
    keyring: PathBuf,

    /// Marginally trusted certifiers needed for full validity
    #[arg(long, default_value_t = 3)]
    marginals_needed: u32,

    /// Fully trusted certifiers needed for full validity
    #[arg(long, default_value_t = 1)]
    completes_needed: u32,

    /// Maximum certification chain depth
    #[arg(long, default_value_t = 5)]
    max_cert_depth: u32,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Open the database and register local secret keys as ultimate roots
    Init,

    /// Update trust records for every keyblock in the keyring
    Update,

    /// Re-check the stored graph, for one name or everything
    Check {
        /// User-id substring
        name: Option<String>,
    },

    /// Compute the trust level for one key
    Trust {
        /// User-id substring
        name: String,
    },

    /// Dump records: everything, "#LID", or a name (with signature listing)
    List {
        /// "#LID" or user-id substring
        spec: Option<String>,
    },

    /// Print the certification paths for one key
    Path {
        /// User-id substring
        name: String,
        /// Override the chain depth for this listing
        #[arg(long, default_value_t = 5)]
        max_depth: i32,
    },

    /// Print all assigned owner-trust values
    ExportOwnertrust,

    /// Read owner-trust values ('-' = stdin)
    ImportOwnertrust {
        /// Input file
        file: PathBuf,
    },

    /// Assign an owner-trust value by hex fingerprint
    SetOwnertrust {
        /// 40-digit hex fingerprint
        fpr: String,
        /// Trust value (0..=6)
        value: u8,
    },

    /// Write a deterministic demo keyring into a directory
    GenFixtures {
        /// Output directory
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = commands::Ctx {
        db: cli.db,
        keyring: cli.keyring,
        marginals_needed: cli.marginals_needed,
        completes_needed: cli.completes_needed,
        max_cert_depth: cli.max_cert_depth,
    };

    match cli.cmd {
        Cmd::Init => commands::cmd_init(&ctx)?,
        Cmd::Update => commands::cmd_update(&ctx)?,
        Cmd::Check { name } => commands::cmd_check(&ctx, name.as_deref())?,
        Cmd::Trust { name } => commands::cmd_trust(&ctx, &name)?,
        Cmd::List { spec } => commands::cmd_list(&ctx, spec.as_deref())?,
        Cmd::Path { name, max_depth } => commands::cmd_path(&ctx, &name, max_depth)?,
        Cmd::ExportOwnertrust => commands::cmd_export_ownertrust(&ctx)?,
        Cmd::ImportOwnertrust { file } => commands::cmd_import_ownertrust(&ctx, &file)?,
        Cmd::SetOwnertrust { fpr, value } => commands::cmd_set_ownertrust(&ctx, &fpr, value)?,
        Cmd::GenFixtures { dir } => fixtures::cmd_gen_fixtures(&dir)?,
    }
    Ok(())
}
