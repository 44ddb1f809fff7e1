use std::{
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Duration,
};

use clap::Parser as _;
use color_eyre::eyre::{bail, Context as _};
use digivault::{hash_document, Ledger, Vault};
use tracing::{debug, info};

#[derive(Debug, clap::Parser)]
#[command(about = "Fingerprint documents into a tamper-evident ledger")]
struct Args {
    /// Where the ledger is kept
    #[arg(short, long, env = "DIGIVAULT_CHAIN", default_value = "digivault.json")]
    chain: PathBuf,
    /// Leading zero hex digits each new block must have. Only used when creating a ledger
    #[arg(short, long, env = "DIGIVAULT_DIFFICULTY", default_value_t = digivault::DEFAULT_DIFFICULTY)]
    difficulty: usize,
    /// Give up on a block if mining takes longer than this many seconds
    #[arg(short = 't', long, env = "DIGIVAULT_MINE_TIMEOUT")]
    mine_timeout: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Hash each file and append a block for it
    Add {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print where the document with this content hash lives
    Find { hash: String },
    /// Check every block in the ledger
    Verify,
    /// Print the ledger as JSON
    Show,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env()
        .context("couldn't parse RUST_LOG environment variable")?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    debug!(?args);

    let ledger = match args.chain.exists() {
        true => Ledger::load(&args.chain)
            .with_context(|| format!("couldn't load ledger from {}", args.chain.display()))?,
        false => {
            info!(path = %args.chain.display(), difficulty = args.difficulty, "starting a new ledger");
            Ledger::new(args.difficulty)?
        }
    };

    match args.command {
        Command::Add { files } => add_files(ledger, &files, args.mine_timeout, &args.chain)?,
        Command::Find { hash } => match ledger.find_by_document_hash(&hash) {
            Some(document_ref) => println!("{document_ref}"),
            None => bail!("no document with hash {hash}"),
        },
        Command::Verify => match ledger.validate() {
            Ok(()) => println!("valid ({} blocks)", ledger.len()),
            Err(error) => bail!("ledger is not valid: {error}"),
        },
        Command::Show => println!("{}", ledger.to_json()?),
    }

    Ok(())
}

/// Append a block per file, saving after each one so a later failure keeps earlier work.
fn add_files(
    ledger: Ledger,
    files: &[PathBuf],
    mine_timeout: Option<u64>,
    chain: &Path,
) -> color_eyre::Result<()> {
    if let Err(error) = ledger.validate() {
        bail!("refusing to extend a ledger that is not valid: {error}");
    }
    let vault = Vault::new(ledger);
    for file in files {
        // finish reading before any mining starts
        let document_hash = hash_document(file)?;
        let document_ref = file.display().to_string();
        let block = match mine_timeout {
            Some(secs) => vault
                .spawn_add_document(document_hash, document_ref)
                .join_timeout(Duration::from_secs(secs))
                .with_context(|| format!("couldn't add {}", file.display()))?,
            None => vault
                .add_document_until(document_hash, document_ref, &AtomicBool::new(false))
                .with_context(|| format!("couldn't add {}", file.display()))?,
        };
        vault
            .snapshot()
            .save(chain)
            .context("couldn't save ledger")?;
        println!("{} {} {}", block.index(), block.hash(), block.document_ref());
    }
    Ok(())
}
