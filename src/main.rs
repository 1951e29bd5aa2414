use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
mod auth;
use keyward::{
    CancelToken, EncryptionAlgorithm, EncryptionService, HEADER_NAME, KdfParams, KeyProtection,
    KeyStore, ServiceConfig, Storage, default_key_dir,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "argon-mem")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "argon-time")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 1)
    #[arg(long = "argon-parallelism")]
    parallelism: Option<u32>,
}

impl Argon2Args {
    fn to_kdf_params(&self) -> Result<KdfParams> {
        let default = KdfParams::default();

        Ok(KdfParams::new(
            self.mem_cost_kib.unwrap_or(default.mem_cost_kib()),
            self.time_cost.unwrap_or(default.time_cost()),
            self.parallelism.unwrap_or(default.parallelism()),
        )?)
    }
}

#[derive(Debug, Parser)]
#[command(name = "keyward")]
#[command(
    version,
    about = "Key store and authenticated encryption for application data and files."
)]
struct Cli {
    /// Directory holding the key store
    #[arg(long, global = true, value_name = "PATH", env = "KEYWARD_KEY_DIR")]
    key_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true, value_name = "PATH", env = "KEYWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Default algorithm (aes_256_gcm, aes_256_cbc, chacha20_poly1305)
    #[arg(long, global = true, value_name = "ALG", env = "KEYWARD_DEFAULT_ALGORITHM")]
    algorithm: Option<EncryptionAlgorithm>,

    /// Create the store without a passphrase (key bytes stored in plain files)
    #[arg(long, global = true, default_value_t = false)]
    unprotected: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates the key store and its initial keys
    Init {
        #[command(flatten)]
        argon2: Argon2Args,
    },

    /// Lists all keys
    Keys,

    /// Rotates the encryption key
    Rotate {
        /// Rotate every key that is due under the rotation policy instead
        #[arg(long, default_value_t = false)]
        due: bool,
    },

    /// Deactivates a key; it can still decrypt
    #[command(arg_required_else_help = true)]
    Deactivate { key_id: String },

    /// Encrypts a file
    #[command(arg_required_else_help = true)]
    Encrypt {
        input: PathBuf,
        /// Output path (default: <INPUT>.encrypted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decrypts a file
    #[command(arg_required_else_help = true)]
    Decrypt {
        input: PathBuf,
        /// Output path (default: <INPUT> with .encrypted replaced by .decrypted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Prints service statistics as JSON
    Stats,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn resolve_config(args: &Cli) -> Result<ServiceConfig> {
    let config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => match &args.key_dir {
            Some(dir) => ServiceConfig::new(dir),
            None => ServiceConfig::new(default_key_dir()?),
        },
    };
    let mut config = config.apply_env().context("invalid KEYWARD_* environment")?;

    if let Some(dir) = &args.key_dir {
        config.key_dir = dir.clone();
    }
    if let Some(algorithm) = args.algorithm {
        config.default_algorithm = algorithm;
    }
    Ok(config)
}

fn open_service(config: ServiceConfig) -> Result<EncryptionService> {
    let storage = Storage::new(&config.key_dir);
    if !KeyStore::exists(&storage) {
        bail!(
            "no key store at {}; run `keyward init` first",
            config.key_dir.display()
        );
    }

    let protection = if storage.contains(HEADER_NAME) {
        KeyProtection::Passphrase {
            passphrase: auth::read_passphrase()?,
            kdf: KdfParams::default(),
        }
    } else {
        KeyProtection::Unprotected
    };

    EncryptionService::open(config, protection).context("failed to open key store")
}

fn cancel_on_ctrl_c() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || handler.cancel()).context("failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Cli::parse();
    let config = resolve_config(&args)?;

    match args.command {
        Commands::Init { argon2 } => {
            let storage = Storage::new(&config.key_dir);
            if KeyStore::exists(&storage) {
                bail!("key store already exists at {}", config.key_dir.display());
            }

            let protection = if args.unprotected {
                KeyProtection::Unprotected
            } else {
                KeyProtection::Passphrase {
                    passphrase: auth::read_new_passphrase_with_confirmation()?,
                    kdf: argon2.to_kdf_params()?,
                }
            };

            let service = EncryptionService::open(config, protection)
                .context("failed to create key store")?;
            println!(
                "key store initialized at {}",
                service.key_store().location().display()
            );
        }
        Commands::Keys => {
            let service = open_service(config)?;
            let keys = service.key_store().keys();

            let id_width = keys
                .iter()
                .map(|k| k.key_id().len())
                .chain(std::iter::once("Key ID".len()))
                .max()
                .unwrap_or_default();

            println!(
                "{:<id_width$}  {:<10}  {:<17}  {:<6}  Created",
                "Key ID", "Purpose", "Algorithm", "Active"
            );
            println!("{:-<id_width$}  {:-<10}  {:-<17}  {:-<6}  {:-<20}", "", "", "", "", "");

            for key in keys {
                println!(
                    "{:<id_width$}  {:<10}  {:<17}  {:<6}  {}",
                    key.key_id(),
                    key.purpose().as_str(),
                    key.algorithm().as_str(),
                    if key.is_active() { "yes" } else { "no" },
                    key.created_at().format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Rotate { due } => {
            let service = open_service(config)?;
            if due {
                let rotated = service.rotate_due_keys(Utc::now())?;
                if rotated.is_empty() {
                    println!("no keys due for rotation");
                }
                for key in rotated {
                    println!("rotated {} key: {}", key.purpose(), key.key_id());
                }
            } else {
                if !service.rotate_encryption_key() {
                    bail!("encryption key rotation failed");
                }
                if let Some(key) = service.key_store().get_active_key(keyward::KeyPurpose::Encryption) {
                    println!("rotated encryption key: {}", key.key_id());
                }
            }
        }
        Commands::Deactivate { key_id } => {
            let service = open_service(config)?;
            if !service.deactivate_key(&key_id)? {
                bail!("key '{key_id}' not found");
            }
            println!("key '{key_id}' deactivated");
        }
        Commands::Encrypt { input, output } => {
            let service = open_service(config)?;
            let cancel = cancel_on_ctrl_c()?;
            match service.encrypt_file_with(&input, output.as_deref(), &cancel)? {
                Some(path) => println!("{}", path.display()),
                None => bail!("input file '{}' does not exist", input.display()),
            }
        }
        Commands::Decrypt { input, output } => {
            let service = open_service(config)?;
            let cancel = cancel_on_ctrl_c()?;
            match service.decrypt_file_with(&input, output.as_deref(), &cancel)? {
                Some(path) => println!("{}", path.display()),
                None => bail!("input file '{}' does not exist", input.display()),
            }
        }
        Commands::Stats => {
            let service = open_service(config)?;
            let stats = service.get_encryption_stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
