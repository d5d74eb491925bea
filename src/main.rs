//! proclineage - offline lineage audit tool
//!
//! Everything here works from logged data alone:
//! 1. `verify-chain`: check a token chain against a genesis key
//! 2. `verify-journal`: re-verify every registration in an audit journal
//! 3. `show-tree`: rebuild the process tree from a journal and print a
//!    subtree, orphans reattached
//!
//! Exit status is non-zero whenever a lineage fails to verify.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};

use proclineage::audit::{rebuild_tracker, verify_journal};
use proclineage::journal::Journal;
use proclineage::{verify_chain, LineageConfig, ProcessId, ProcessToken, PublicKey};

#[derive(Parser)]
#[command(name = "proclineage", version, about = "Offline process lineage audit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a JSON array of tokens, leaf first, against a genesis key
    VerifyChain {
        /// Genesis public key, hex
        #[arg(long)]
        genesis: String,
        file: PathBuf,
    },
    /// Verify every registered lineage in an audit journal
    VerifyJournal {
        #[arg(long)]
        config: PathBuf,
        journal: PathBuf,
    },
    /// Print the reattached subtree under a process id as JSON
    ShowTree {
        #[arg(long)]
        journal: PathBuf,
        root: String,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::VerifyChain { genesis, file } => verify_chain_file(&genesis, &file),
        Command::VerifyJournal { config, journal } => verify_journal_file(&config, &journal),
        Command::ShowTree { journal, root } => show_tree(&journal, &root),
    }
}

fn verify_chain_file(genesis: &str, file: &Path) -> anyhow::Result<ExitCode> {
    let genesis = PublicKey::from_hex(genesis).context("parsing genesis key")?;
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let chain: Vec<ProcessToken> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    match verify_chain(&chain, &genesis) {
        Ok(()) => {
            info!("chain of {} token(s) verifies to genesis {}", chain.len(), genesis);
            println!("valid");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            warn!("chain rejected: {}", e);
            println!("invalid: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn verify_journal_file(config: &Path, journal: &Path) -> anyhow::Result<ExitCode> {
    let config = LineageConfig::from_file(config)
        .with_context(|| format!("loading config {}", config.display()))?;
    let genesis = config.genesis_key()?;
    let records = Journal::read_all(journal)
        .with_context(|| format!("reading journal {}", journal.display()))?;
    info!("auditing {} journal record(s)", records.len());

    let audit = verify_journal(&records, &genesis);
    println!("{}", serde_json::to_string_pretty(&audit)?);
    if audit.is_clean() {
        info!("all {} lineage(s) verify", audit.verified.len());
        Ok(ExitCode::SUCCESS)
    } else {
        warn!("{} lineage(s) failed verification", audit.failures.len());
        Ok(ExitCode::FAILURE)
    }
}

fn show_tree(journal: &Path, root: &str) -> anyhow::Result<ExitCode> {
    let records = Journal::read_all(journal)
        .with_context(|| format!("reading journal {}", journal.display()))?;
    let tracker = rebuild_tracker(&records);
    let root = ProcessId::new(root);
    match tracker.get_tree(&root) {
        Some(tree) => {
            println!("{}", serde_json::to_string_pretty(&tree)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            warn!("{} does not appear in the journal", root);
            Ok(ExitCode::FAILURE)
        }
    }
}
