mod metrics;
mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use stek_core::{
    to_unix, CipherAlgorithm, DigestAlgorithm, InMemoryKeyStore, KeyFile, KeyName, KeyRecord,
    ReseedingEntropy, RotationPolicy, SystemClock, KEY_NAME_LEN,
};
use stek_tls::{decode, TicketView};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stek",
    author,
    version,
    about = "Manage session ticket encryption keys and inspect tickets",
    propagate_version = true
)]
struct Cli {
    /// Increase output verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Output log format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a freshly generated key to a key file.
    Keygen(KeygenArgs),
    /// Drop expired keys from a key file and add a new current key.
    Rotate(RotateArgs),
    /// Print the layout of a base64 ticket, decrypting it when the key is known.
    Inspect(InspectArgs),
    /// Run concurrent handshakes against an in-memory store and report ticket stats.
    Simulate(simulate::SimulateArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CipherArg {
    #[value(name = "aes-128-gcm")]
    Aes128Gcm,
    #[value(name = "aes-256-gcm")]
    Aes256Gcm,
    #[value(name = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[value(name = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl From<CipherArg> for CipherAlgorithm {
    fn from(arg: CipherArg) -> Self {
        match arg {
            CipherArg::Aes128Gcm => CipherAlgorithm::Aes128Gcm,
            CipherArg::Aes256Gcm => CipherAlgorithm::Aes256Gcm,
            CipherArg::ChaCha20Poly1305 => CipherAlgorithm::ChaCha20Poly1305,
            CipherArg::XChaCha20Poly1305 => CipherAlgorithm::XChaCha20Poly1305,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DigestArg {
    Sha256,
    Sha384,
    Sha512,
    #[value(name = "sha3-256")]
    Sha3_256,
}

impl From<DigestArg> for DigestAlgorithm {
    fn from(arg: DigestArg) -> Self {
        match arg {
            DigestArg::Sha256 => DigestAlgorithm::Sha256,
            DigestArg::Sha384 => DigestAlgorithm::Sha384,
            DigestArg::Sha512 => DigestAlgorithm::Sha512,
            DigestArg::Sha3_256 => DigestAlgorithm::Sha3_256,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct KeyParams {
    /// Ticket cipher. Defaults to AES-256-GCM when the CPU has AES instructions.
    #[arg(long, value_enum)]
    cipher: Option<CipherArg>,

    /// HMAC digest for the ticket tag.
    #[arg(long, value_enum, default_value_t = DigestArg::Sha256)]
    digest: DigestArg,

    /// Key lifetime in seconds.
    #[arg(long, default_value_t = 12 * 60 * 60)]
    lifetime_secs: u64,
}

impl KeyParams {
    fn cipher(&self) -> CipherAlgorithm {
        self.cipher
            .map(CipherAlgorithm::from)
            .unwrap_or_else(CipherAlgorithm::preferred)
    }

    fn policy(&self) -> RotationPolicy {
        RotationPolicy::default()
            .with_lifetime(Duration::from_secs(self.lifetime_secs))
            .with_algorithms(self.cipher(), self.digest.into())
            .manual()
    }
}

#[derive(Args, Debug, Clone)]
struct KeygenArgs {
    /// Key file to append to. Created when missing.
    #[arg(long)]
    out: PathBuf,

    #[command(flatten)]
    params: KeyParams,
}

#[derive(Args, Debug, Clone)]
struct RotateArgs {
    /// Key file to rotate in place.
    #[arg(long)]
    keys: PathBuf,

    #[command(flatten)]
    params: KeyParams,
}

#[derive(Args, Debug, Clone)]
struct InspectArgs {
    /// Ticket bytes, base64 encoded.
    ticket: String,

    /// Key file used to authenticate and decrypt the ticket.
    #[arg(long)]
    keys: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct KeySummary {
    name: String,
    cipher: CipherAlgorithm,
    digest: DigestAlgorithm,
    created_at: u64,
    expires_at: u64,
}

impl KeySummary {
    fn of(record: &KeyRecord) -> Self {
        Self {
            name: record.name().to_string(),
            cipher: record.cipher(),
            digest: record.digest(),
            created_at: to_unix(record.created_at()),
            expires_at: to_unix(record.expires_at()),
        }
    }
}

#[derive(Serialize)]
struct Rotation {
    current: KeySummary,
    purged: usize,
    keys: Vec<KeySummary>,
}

#[derive(Debug, Serialize)]
struct TicketSummary {
    len: usize,
    key_name: String,
    iv_len: Option<usize>,
    ciphertext_len: Option<usize>,
    tag_len: Option<usize>,
    key: Option<KeySummary>,
    session_state: Option<String>,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Command::Keygen(args) => print_json(&run_keygen(&args)?)?,
        Command::Rotate(args) => print_json(&run_rotate(&args)?)?,
        Command::Inspect(args) => print_json(&run_inspect(&args)?)?,
        Command::Simulate(args) => simulate::run(args).await?,
    }

    Ok(())
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
}

fn load_key_file(path: &Path) -> Result<KeyFile> {
    KeyFile::load_or_default(path)
        .with_context(|| format!("failed to load key file {}", path.display()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{body}");
    Ok(())
}

fn run_keygen(args: &KeygenArgs) -> Result<KeySummary> {
    let entropy = ReseedingEntropy::new().context("entropy source unavailable")?;
    let mut file = load_key_file(&args.out)?;
    let record = KeyRecord::generate(
        &entropy,
        args.params.cipher(),
        args.params.digest.into(),
        std::time::SystemTime::now(),
        Duration::from_secs(args.params.lifetime_secs),
    )
    .context("failed to generate key material")?;
    file.push(&record);
    file.save(&args.out)
        .with_context(|| format!("failed to write key file {}", args.out.display()))?;
    info!(key_name = %record.name(), path = %args.out.display(), "generated ticket key");
    Ok(KeySummary::of(&record))
}

fn run_rotate(args: &RotateArgs) -> Result<Rotation> {
    let file = load_key_file(&args.keys)?;
    let records = file
        .records()
        .with_context(|| format!("key file {} is invalid", args.keys.display()))?;
    let entropy = ReseedingEntropy::new().context("entropy source unavailable")?;
    let store = InMemoryKeyStore::from_records(
        args.params.policy(),
        Arc::new(SystemClock),
        Arc::new(entropy),
        records,
    )
    .context("failed to load keys")?;

    let purged = store.purge_expired();
    let current = store.rotate().context("failed to rotate ticket key")?;
    let records = store.records();
    KeyFile::from_records(&records)
        .save(&args.keys)
        .with_context(|| format!("failed to write key file {}", args.keys.display()))?;
    info!(key_name = %current.name(), purged, kept = records.len(), "rotated key file");
    Ok(Rotation {
        current: KeySummary::of(&current),
        purged,
        keys: records.iter().map(|record| KeySummary::of(record)).collect(),
    })
}

fn run_inspect(args: &InspectArgs) -> Result<TicketSummary> {
    let bytes = BASE64_STANDARD
        .decode(args.ticket.trim())
        .context("ticket is not valid base64")?;
    let Some(name) = KeyName::from_prefix(&bytes) else {
        bail!(
            "ticket is {} bytes, shorter than its {KEY_NAME_LEN}-byte key name",
            bytes.len()
        );
    };

    let mut summary = TicketSummary {
        len: bytes.len(),
        key_name: name.to_string(),
        iv_len: None,
        ciphertext_len: None,
        tag_len: None,
        key: None,
        session_state: None,
        error: None,
    };

    if let Some(path) = &args.keys {
        let records = load_key_file(path)?
            .records()
            .with_context(|| format!("key file {} is invalid", path.display()))?;
        match records.into_iter().find(|record| record.name() == &name) {
            Some(record) => {
                let record = Arc::new(record);
                if let Ok(view) = TicketView::parse(
                    &bytes,
                    record.cipher().iv_len(),
                    record.digest().output_len(),
                ) {
                    summary.iv_len = Some(view.iv.len());
                    summary.ciphertext_len = Some(view.ciphertext.len());
                    summary.tag_len = Some(view.tag.len());
                }
                summary.key = Some(KeySummary::of(&record));
                match decode(&bytes, |_| Some(Arc::clone(&record))) {
                    Ok((state, _)) => summary.session_state = Some(BASE64_STANDARD.encode(state)),
                    Err(err) => summary.error = Some(err.to_string()),
                }
            }
            None => summary.error = Some("ticket key not found".into()),
        }
    }

    Ok(summary)
}
