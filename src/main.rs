use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use evidence_anchor::anchor::evm::{EvmAnchorClient, EvmLogReader};
use evidence_anchor::anchor::scan::LogScanner;
use evidence_anchor::bundle::{self, Packager, StatementRenderer};
use evidence_anchor::config::AppConfig;
use evidence_anchor::crypto::hash::ContentHash;
use evidence_anchor::crypto::sign::ServiceKey;
use evidence_anchor::error::{EvidenceError, Result};
use evidence_anchor::notify::{CallbackClient, Notifier};
use evidence_anchor::pipeline::{PipelineParts, ReceiptPipeline};
use evidence_anchor::server::{self, AppState};
use evidence_anchor::state::memory::MemoryReceiptStore;
use evidence_anchor::state::repository::PgReceiptStore;
use evidence_anchor::state::{Database, ReceiptStore};
use evidence_anchor::storage::local::LocalStorage;
use evidence_anchor::storage::StorageBackend;
use evidence_anchor::verify::Verifier;

#[derive(Parser)]
#[command(name = "evidence-anchor")]
#[command(about = "Signed evidence bundles for transfers, anchored on an EVM ledger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and receipt pipeline
    Serve,
    /// Check a hash or bundle file against the ledger
    Verify {
        /// 0x-prefixed SHA-256 content hash
        #[arg(long, conflicts_with = "bundle", required_unless_present = "bundle")]
        hash: Option<String>,
        /// Path to an evidence bundle
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
    /// Print the contents of a bundle after checking its signature
    Inspect {
        bundle: PathBuf,
    },
    /// Generate a bundle signing key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve(AppConfig::from_env()?).await,
        Commands::Verify { hash, bundle } => verify(AppConfig::from_env()?, hash, bundle).await,
        Commands::Inspect { bundle } => inspect(AppConfig::from_env()?, bundle),
        Commands::Keygen => {
            let key = ServiceKey::generate();
            println!("SERVICE_SIGNING_KEY={}", key.seed_hex().as_str());
            println!("TRUSTED_SIGNER={}", hex::encode(key.public_key()));
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    tracing::info!(config = ?config, "starting evidence-anchor");

    let store: Arc<dyn ReceiptStore> = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.migrate().await?;
            Arc::new(PgReceiptStore::new(&db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, receipts are kept in memory only");
            Arc::new(MemoryReceiptStore::new())
        }
    };

    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(config.artifacts_dir.clone()));

    let evm = config.evm_config()?;
    let private_key = config
        .anchor_private_key
        .as_ref()
        .ok_or_else(|| EvidenceError::Config("ANCHOR_PRIVATE_KEY is required".into()))?;
    let client = Arc::new(EvmAnchorClient::new(evm, private_key)?);
    tracing::info!(sender = %client.sender_address(), chain_id = config.chain_id, "ledger client ready");

    let scanner = Arc::new(LogScanner::new(client.clone(), config.lookback_blocks, config.chunk_size));

    let key = match config.load_signing_key()? {
        Some(key) => key,
        None => {
            tracing::warn!("SERVICE_SIGNING_KEY not set, using an ephemeral key; bundles will not verify after restart");
            ServiceKey::generate()
        }
    };
    let packager = Packager::new(key, Box::new(StatementRenderer));
    let trusted_signer = config.trusted_signer.or(Some(packager.public_key()));

    let callbacks = CallbackClient::new(config.callback_timeout, config.callback_max_attempts)?;
    let notifier = Arc::new(Notifier::new(Some(callbacks), config.callback_on_create));

    let pipeline = ReceiptPipeline::new(PipelineParts {
        store,
        packager,
        ledger: client,
        scanner: scanner.clone(),
        storage: storage.clone(),
        notifier,
        retry: config.retry.clone(),
        public_base_url: config.public_base_url.clone(),
    });

    let resumed = pipeline.resume_pending().await?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed pending receipts");
    }

    let state = AppState {
        pipeline,
        verifier: Arc::new(Verifier::new(scanner, storage, trusted_signer)),
        rpc_url: config.rpc_url.clone(),
        contract_address: config.contract_address.clone(),
    };
    server::serve(state, &config.listen_addr).await
}

async fn verify(config: AppConfig, hash: Option<String>, bundle: Option<PathBuf>) -> Result<()> {
    let reader = Arc::new(EvmLogReader::new(&config.evm_config()?)?);
    let scanner = Arc::new(LogScanner::new(reader, config.lookback_blocks, config.chunk_size));
    let storage = Arc::new(LocalStorage::new(config.artifacts_dir.clone()));
    let verifier = Verifier::new(scanner, storage, config.trusted_signer);

    let outcome = match (hash, bundle) {
        (Some(hash), _) => verifier.verify_hash(&ContentHash::parse(&hash)?).await,
        (None, Some(path)) => verifier.verify_bundle(&std::fs::read(path)?).await?,
        (None, None) => return Err(EvidenceError::Validation("pass --hash or --bundle".into())),
    };
    print_json(&outcome)
}

fn inspect(config: AppConfig, path: PathBuf) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let verified = bundle::verify_integrity(&bytes, config.trusted_signer.as_ref())?;
    print_json(&serde_json::json!({
        "content_hash": verified.content_hash,
        "signer": hex::encode(verified.signer),
        "facts": verified.facts,
        "manifest": verified.manifest,
    }))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| EvidenceError::Serialization(e.to_string()))?;
    println!("{text}");
    Ok(())
}
