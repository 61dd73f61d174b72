use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use hivesync_core::{ProtectionKeys, SyncClient, SyncConfig, SyncIndex, SyncOutcome};
use storage::{Key, LocalFiles, MemoryDht};

#[derive(Parser, Debug)]
#[command(name = "hivesync", version, about = "HiveSync versioned file synchronization")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for keys, config and the local DHT snapshot
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Upper bound for each network operation, in seconds
    #[arg(long, global = true, default_value_t = 120)]
    timeout: u64,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize keys and configuration
    Init {
        /// User id that owns the synchronized files
        #[arg(long)]
        user: String,

        /// Folder to keep in sync (defaults to the current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Serialize writes that target the same slot
        #[arg(long)]
        serialize_writes: bool,
    },

    /// Show user and store information
    Info,

    /// Publish the local content of a file as a new version
    Upload {
        /// Path relative to the sync root
        file: PathBuf,
    },

    /// Replace the local file with a stored version
    Download {
        /// Path relative to the sync root
        file: PathBuf,

        /// Version key in hex (defaults to the latest version)
        #[arg(long)]
        version: Option<String>,
    },

    /// List the versions of a file
    Versions {
        /// Path relative to the sync root
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reconcile local files with the network
    Sync {
        /// Paths relative to the sync root
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Summarize what the store holds for this user
    Digest {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hivesync")
    });
    let timeout = Duration::from_secs(cli.timeout);

    match cli.cmd {
        Commands::Init {
            user,
            root,
            serialize_writes,
        } => {
            let root = match root {
                Some(root) => root,
                None => std::env::current_dir().context("Failed to resolve current directory")?,
            };
            init(&data_dir, &user, root, serialize_writes)?;
        }

        Commands::Info => {
            let (cfg, dht, client) = open(&data_dir, timeout)?;
            println!("User Information:");
            println!("  User: {}", cfg.user_id);
            println!("  Location: {}", client.location());
            println!("  Fingerprint: {}", client.keys.fingerprint());
            println!("  Sync root: {}", cfg.sync_root.display());
            println!("  Data directory: {}", cfg.data_dir.display());
            println!("  Stored entries: {}", dht.len());
        }

        Commands::Upload { file } => {
            let (cfg, dht, client) = open(&data_dir, timeout)?;
            let handle = client.start_upload(&file)?;
            let ctx = handle.wait(timeout).await?.into_context()?;
            let version = ctx
                .new_version
                .context("Upload finished without a new version")?;
            dht.save(&cfg.dht_snapshot_path())?;
            record(&cfg, &file, version.version_key())?;

            println!("✓ Uploaded {}", file.display());
            println!("  Version: {}", version.version_key());
            println!("  Size: {} bytes in {} chunks", version.size(), version.chunk_count());
        }

        Commands::Download { file, version } => {
            let (cfg, _, client) = open(&data_dir, timeout)?;
            let version = version
                .map(|hex| Key::from_hex(&hex))
                .transpose()
                .context("Invalid version key")?;
            let handle = client.start_download(&file, version)?;
            let ctx = handle.wait(timeout).await?.into_context()?;
            let selected = ctx
                .selected
                .context("Download finished without a selected version")?;
            record(&cfg, &file, selected.version_key())?;

            println!("✓ Downloaded {}", file.display());
            println!("  Version: {}", selected.version_key());
        }

        Commands::Versions { file, json } => {
            let (_, _, client) = open(&data_dir, timeout)?;
            let versions = client.get_file_versions(&file).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&versions)?);
            } else {
                println!("{} version(s) of {}:", versions.len(), file.display());
                for v in &versions {
                    println!(
                        "  {}  {} bytes  hash {}",
                        v.version_key(),
                        v.size(),
                        hex::encode(&v.content_hash().0[..8])
                    );
                }
            }
        }

        Commands::Sync { files } => {
            let (cfg, dht, client) = open(&data_dir, timeout)?;
            let mut index = SyncIndex::load(&cfg.sync_index_path())?;
            let mut failed = 0;
            for file in &files {
                match client.sync_file(file, index.last_synced(file)).await {
                    Ok(SyncOutcome::Unchanged) => println!("  = {}", file.display()),
                    Ok(SyncOutcome::Uploaded(v)) => {
                        index.record(file, v.version_key());
                        println!("  ↑ {} ({})", file.display(), v.version_key().short());
                    }
                    Ok(SyncOutcome::Downloaded(v)) => {
                        index.record(file, v.version_key());
                        println!("  ↓ {} ({})", file.display(), v.version_key().short());
                    }
                    Err(failure) => {
                        failed += 1;
                        tracing::warn!("sync of {} failed at {:?}", file.display(), failure.path);
                        println!("  ✗ {}: {}", file.display(), failure);
                    }
                }
            }
            dht.save(&cfg.dht_snapshot_path())?;
            index.save(&cfg.sync_index_path())?;

            if failed > 0 {
                anyhow::bail!("{} of {} file(s) failed to sync", failed, files.len());
            }
            println!("✓ Synchronized {} file(s)", files.len());
        }

        Commands::Digest { json } => {
            let (cfg, _, client) = open(&data_dir, timeout)?;
            let digest = client.data().digest(client.location()).wait(timeout).await?;

            if json {
                let entries: Vec<_> = digest
                    .entries
                    .iter()
                    .map(|(key, based_on)| {
                        serde_json::json!({
                            "domain": key.domain.to_hex(),
                            "content": key.content.to_hex(),
                            "version": key.version.to_hex(),
                            "based_on": based_on.map(|k| k.to_hex()),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("{} stored entries for {}:", digest.len(), cfg.user_id);
                for key in digest.entries.keys() {
                    println!(
                        "  {} / {} @ {}",
                        key.domain.short(),
                        key.content.short(),
                        key.version.short()
                    );
                }
            }
        }
    }

    Ok(())
}

fn init(data_dir: &Path, user: &str, root: PathBuf, serialize_writes: bool) -> Result<()> {
    let mut cfg = SyncConfig::default().with_user(user);
    cfg.data_dir = data_dir.to_path_buf();
    cfg.sync_root = root;
    cfg.serialize_writes = serialize_writes;
    cfg.ensure_data_dir()?;

    let keys = ProtectionKeys::generate_and_store(&cfg.keys_path())?;
    cfg.save(&config_path(data_dir))?;

    println!("✓ User initialized");
    println!("  User: {}", cfg.user_id);
    println!("  Fingerprint: {}", keys.fingerprint());
    println!("  Sync root: {}", cfg.sync_root.display());
    println!("  Data directory: {}", data_dir.display());
    Ok(())
}

fn open(
    data_dir: &Path,
    timeout: Duration,
) -> Result<(SyncConfig, MemoryDht, SyncClient<LocalFiles>)> {
    let cfg = load_config(data_dir)?;
    let keys = ProtectionKeys::load(&cfg.keys_path())
        .context("User not initialized. Run 'hivesync init' first.")?;
    let dht = MemoryDht::load(&cfg.dht_snapshot_path())?;
    let files = LocalFiles::new(cfg.sync_root.clone())?;
    let client = SyncClient::new(cfg.clone(), keys, Arc::new(dht.clone()), files)
        .with_operation_timeout(timeout);
    Ok((cfg, dht, client))
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

fn load_config(data_dir: &Path) -> Result<SyncConfig> {
    let path = config_path(data_dir);
    if !path.exists() {
        anyhow::bail!("User not initialized. Run 'hivesync init' first.");
    }
    SyncConfig::load(&path)
}

fn record(cfg: &SyncConfig, file: &Path, version: Key) -> Result<()> {
    let mut index = SyncIndex::load(&cfg.sync_index_path())?;
    index.record(file, version);
    index.save(&cfg.sync_index_path())
}
