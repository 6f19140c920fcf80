use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tps_core::{
    AuditRecord, AuditSettings, BackgroundTasks, EngineState, HttpTransport, KeyProvider,
    LogExpiry, MemoryConfigStore, Outcome, SessionKeyEngine, SoftKeyProvider, Transport,
    TrustEngine, events, protocol::CHALLENGE_LEN, signing::verifying_key_from_pem, verify_chain,
};

#[derive(Parser, Debug)]
#[command(
    name = "tps-server",
    version,
    about = "Token processing daemon and operator tools",
    propagate_version = true
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, env = "TPS_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine until interrupted.
    Run(RunArgs),
    /// Verify the signature chain of one or more audit logs, oldest first.
    VerifyAudit(VerifyAuditArgs),
    /// Print the host cryptogram for a pair of challenges.
    Cryptogram(CryptogramArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Configuration file (YAML, JSON or key=value lines).
    #[arg(long, env = "TPS_CONFIG")]
    config: PathBuf,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "TPS_METRICS_BIND")]
    metrics_bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct VerifyAuditArgs {
    /// Audit log files in rotation order; the chain carries across files.
    #[arg(long = "log", required = true, num_args = 1..)]
    logs: Vec<PathBuf>,

    /// Audit signing public key (SPKI PEM).
    #[arg(long)]
    public_key: PathBuf,
}

#[derive(Args, Debug)]
struct CryptogramArgs {
    /// 8-byte card challenge, hex.
    #[arg(long)]
    card_challenge: String,

    /// 8-byte host challenge, hex.
    #[arg(long)]
    host_challenge: String,

    #[arg(long, env = "TPS_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::VerifyAudit(args) => verify_audit(args),
        Command::Cryptogram(args) => cryptogram(args),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<MemoryConfigStore> {
    MemoryConfigStore::from_path(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    if let Some(bind) = args.metrics_bind {
        PrometheusBuilder::new()
            .with_http_listener(bind)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%bind, "metrics listener started");
    }

    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::from_config(&config).context("failed to load client credentials")?);
    let keys: Arc<dyn KeyProvider> = Arc::new(SoftKeyProvider::new());
    let engine = TrustEngine::from_config(&config, transport, keys)
        .context("failed to initialise engine")?;
    let settings = AuditSettings::from_config(&config)?;

    engine.audit().open().context("failed to open audit log")?;
    engine.audit_append(&AuditRecord::system(
        events::AUDIT_LOG_STARTUP,
        Outcome::Success,
        format!(
            "audit started: connectors={} failover={:?}",
            engine.state().pools().entries().len(),
            engine.state().failover_mode()
        ),
    ))?;

    let expiry = (!settings.expiration.is_zero()).then(|| Arc::new(LogExpiry::from_settings(&settings)));
    let tasks = BackgroundTasks::spawn(Arc::clone(engine.audit()), expiry);
    info!(
        audit_log = %settings.file_name.display(),
        signing = settings.signing,
        key_set = engine.defaults().key_set.as_str(),
        archive = engine.defaults().archive,
        "tps-server running"
    );

    shutdown_signal().await;

    if let Err(err) = engine.audit_append(&AuditRecord::system(
        events::AUDIT_LOG_SHUTDOWN,
        Outcome::Success,
        "audit stopped",
    )) {
        error!(error = %err, "failed to record shutdown");
    }
    tasks.shutdown().await.context("failed to close audit log")?;
    info!("tps-server stopped");
    Ok(())
}

fn verify_audit(args: VerifyAuditArgs) -> anyhow::Result<()> {
    let pem = fs::read_to_string(&args.public_key)
        .with_context(|| format!("failed to read {}", args.public_key.display()))?;
    let key = verifying_key_from_pem(&pem)?;

    let mut carry = None;
    let mut broken = false;
    for log in &args.logs {
        let report = verify_chain(log, &key, carry.take())?;
        println!(
            "{}: {}/{} signatures verified, {} unsigned lines, {} trailing lines",
            log.display(),
            report.verified,
            report.signatures,
            report.unsigned_lines,
            report.trailing_lines
        );
        for line in &report.failures {
            println!("  signature at line {line} does not verify");
        }
        if report.unsigned_lines > 0 {
            warn!(log = %log.display(), lines = report.unsigned_lines, "unsigned records present");
        }
        broken |= !report.is_intact();
        carry = report.last_signature;
    }
    if broken {
        bail!("audit signature chain is broken");
    }
    Ok(())
}

fn parse_challenge(raw: &str, name: &str) -> anyhow::Result<[u8; CHALLENGE_LEN]> {
    let bytes = hex::decode(raw.trim()).with_context(|| format!("{name} is not hex"))?;
    <[u8; CHALLENGE_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("{name} must be {CHALLENGE_LEN} bytes"))
}

fn cryptogram(args: CryptogramArgs) -> anyhow::Result<()> {
    let card = parse_challenge(&args.card_challenge, "card challenge")?;
    let host = parse_challenge(&args.host_challenge, "host challenge")?;
    let config = load_config(&args.config)?;
    let state = Arc::new(EngineState::from_config(&config)?);
    let engine = SessionKeyEngine::from_config(
        &config,
        state,
        Arc::new(HttpTransport::new()),
        Arc::new(SoftKeyProvider::new()),
    )?;
    let cryptogram = engine.compute_host_cryptogram(&card, &host)?;
    println!("{}", hex::encode_upper(cryptogram));
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
