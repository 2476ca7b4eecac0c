//! FairSign Party CLI
//!
//! Command-line interface for fair contract signing:
//! - Key generation for a party
//! - Key inspection
//! - In-process signing session, optionally with a party that stops early

use anyhow::Result;
use clap::{Parser, Subcommand};
use fairsign_core::{
    Arbitrator, ArbitratorConfig, Conduct, Contract, ContractTerms, Establisher, EstablisherConfig,
    KeyPair, MemoryTransport, Party, Status,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use uuid::Uuid;

/// FairSign Party - contract signing node
#[derive(Parser)]
#[command(name = "fairsign-party")]
#[command(about = "Optimistic fair contract signing party")]
#[command(version)]
struct Cli {
    /// Data directory for keys and signed contracts
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and store a party key pair
    Keygen {
        /// Party ID
        #[arg(short, long, env = "PARTY_ID")]
        id: String,
    },

    /// Show a stored key
    Info {
        /// Party ID
        #[arg(short, long, env = "PARTY_ID")]
        id: String,
    },

    /// Run a signing session between local parties
    Simulate {
        /// Number of parties
        #[arg(short, long, default_value_t = 2)]
        parties: usize,

        /// Contract clauses
        #[arg(short, long = "clause", default_value = "The parties agree")]
        clauses: Vec<String>,

        /// Last party stops sending after this promise round
        #[arg(long)]
        fail_after: Option<u32>,

        /// Contract id (random when omitted)
        #[arg(long)]
        contract_id: Option<Uuid>,

        /// Per-stage timeout in milliseconds
        #[arg(long, env = "ROUND_TIMEOUT_MS", default_value_t = 2_000)]
        round_timeout_ms: u64,

        /// Arbitrator verdict timeout in milliseconds
        #[arg(long, env = "VERDICT_TIMEOUT_MS", default_value_t = 10_000)]
        verdict_timeout_ms: u64,
    },
}

#[derive(Serialize)]
struct Outcome {
    party: String,
    status: Option<Status>,
    signatures: usize,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    // Ensure data directory exists
    std::fs::create_dir_all(&cli.dest)?;

    match cli.command {
        Commands::Keygen { ref id } => run_keygen(&cli.dest, id)?,
        Commands::Info { ref id } => show_info(&cli.dest, id)?,
        Commands::Simulate {
            parties,
            ref clauses,
            fail_after,
            contract_id,
            round_timeout_ms,
            verdict_timeout_ms,
        } => {
            let config = EstablisherConfig::default()
                .with_round_timeout(Duration::from_millis(round_timeout_ms))
                .with_verdict_timeout(Duration::from_millis(verdict_timeout_ms));
            run_simulation(&cli.dest, parties, clauses.clone(), fail_after, contract_id, config).await?;
        }
    }

    Ok(())
}

fn run_keygen(dest: &Path, id: &str) -> Result<()> {
    let keypair = KeyPair::generate();
    let path = save_key(dest, id, &keypair)?;

    info!(
        party = id,
        public_key = hex::encode(keypair.public().to_bytes()),
        path = ?path,
        "Key pair generated"
    );

    println!("Public Key: {}", hex::encode(keypair.public().to_bytes()));

    Ok(())
}

fn show_info(dest: &Path, id: &str) -> Result<()> {
    let keypair = load_key(dest, id)?;

    println!("Key Info:");
    println!("  Party ID: {}", id);
    println!("  Public Key: {}", hex::encode(keypair.public().to_bytes()));
    println!("  Private Key: {}", if keypair.has_secret() { "present" } else { "absent" });

    Ok(())
}

async fn run_simulation(
    dest: &Path,
    n: usize,
    clauses: Vec<String>,
    fail_after: Option<u32>,
    contract_id: Option<Uuid>,
    config: EstablisherConfig,
) -> Result<()> {
    anyhow::ensure!(n > 0, "at least one party is required");
    config.validate()?;

    // Reuse stored keys, generate the rest
    let mut keys = Vec::with_capacity(n);
    for i in 0..n {
        let id = format!("party-{}", i);
        let keypair = match load_key(dest, &id) {
            Ok(keypair) if keypair.has_secret() => keypair,
            _ => {
                let keypair = KeyPair::generate();
                save_key(dest, &id, &keypair)?;
                keypair
            }
        };
        keys.push((id, keypair));
    }

    let parties = keys
        .iter()
        .map(|(id, keypair)| Party::new(id.clone(), *keypair.public()))
        .collect();
    let trent = KeyPair::generate();
    let terms = ContractTerms::new(
        contract_id.unwrap_or_else(Uuid::new_v4),
        clauses,
        parties,
        *trent.public(),
    )?;
    let contract = Contract::new(terms);

    info!(
        contract_id = %contract.id(),
        parties = n,
        fail_after = ?fail_after,
        content_hash = hex::encode(contract.content_hash()),
        "Starting signing session"
    );

    let transport = Arc::new(MemoryTransport::new());
    let arbitrator_config = ArbitratorConfig::default();
    let arbitrator = Arc::new(Arbitrator::new(trent.clone(), arbitrator_config.clone())?)
        .spawn(transport.clone());

    let mut handles = Vec::with_capacity(n);
    for (i, (id, keypair)) in keys.into_iter().enumerate() {
        let conduct = match fail_after {
            Some(limit) if i + 1 == n => Conduct::StopAfterRound(limit),
            _ => Conduct::Honest,
        };
        let mut establisher = Establisher::new(
            id.clone(),
            keypair,
            arbitrator_config.id.clone(),
            *trent.public(),
            transport.clone(),
            config.clone().with_conduct(conduct),
        );
        establisher.initialize(contract.clone())?;
        handles.push((id, establisher.start()?));
    }

    let (ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
    let results = futures_util::future::join_all(handles.into_iter().map(|h| h.join())).await;

    let mut outcomes = Vec::with_capacity(n);
    for (party, result) in ids.into_iter().zip(results) {
        let outcome = match result {
            Ok(signed) => {
                if signed.status() == Status::Finalized {
                    let path = dest.join(format!("contract.{}.{}.json", signed.id(), party));
                    std::fs::write(&path, serde_json::to_string_pretty(&signed.to_entity())?)?;
                }
                Outcome {
                    status: Some(signed.status()),
                    signatures: signed.signatures().len(),
                    error: None,
                    party,
                }
            }
            Err(e) => {
                warn!(party = %party, error = %e, "Party did not complete");
                Outcome {
                    status: None,
                    signatures: 0,
                    error: Some(e.to_string()),
                    party,
                }
            }
        };
        outcomes.push(outcome);
    }

    arbitrator.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    Ok(())
}

fn key_path(dest: &Path, id: &str) -> PathBuf {
    dest.join(format!("key.{}.json", id))
}

fn save_key(dest: &Path, id: &str, keypair: &KeyPair) -> Result<PathBuf> {
    let path = key_path(dest, id);
    std::fs::write(&path, serde_json::to_string_pretty(keypair)?)?;
    Ok(path)
}

fn load_key(dest: &Path, id: &str) -> Result<KeyPair> {
    let json = std::fs::read_to_string(key_path(dest, id))?;
    let keypair: KeyPair = serde_json::from_str(&json)?;
    Ok(keypair)
}
