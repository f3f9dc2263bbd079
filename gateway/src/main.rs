mod config;

use clap::{Args, Parser};
use config::{Config, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use proxy::crypto::AesGcmDecryptor;
use secrecy::SecretString;
use std::io::Read;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "plugin_gateway";

#[derive(Parser)]
#[command(name = "plugin-gateway", about = "Authenticated reverse proxy for plugin backends")]
enum CliCommand {
    /// Serve plugin proxy requests
    Run(ConfigArgs),
    /// Load and validate a configuration file, then exit
    Validate(ConfigArgs),
    /// Encrypt a secret read from stdin for use in `secure_json_data`
    EncryptSecret(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Proxy(#[from] proxy::ProxyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not encrypt secret: {0}")]
    Encrypt(#[from] proxy::crypto::DecryptError),
}

fn main() {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run(args) => run(&args),
        CliCommand::Validate(args) => validate(&args),
        CliCommand::EncryptSecret(args) => encrypt_secret(&args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: &ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;

    let sentry_guard = config.sentry_dsn().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    init_tracing(sentry_guard.is_some());

    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    tracing::info!(config = %args.config.display(), "starting plugin gateway");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(proxy::run(config.proxy))?;

    Ok(())
}

fn validate(args: &ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;
    proxy::build_service(&config.proxy)?;

    println!(
        "{}: ok ({} plugins, {} settings entries)",
        args.config.display(),
        config.proxy.plugins.len(),
        config.proxy.settings.len()
    );
    Ok(())
}

fn encrypt_secret(args: &ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;

    let mut plaintext = String::new();
    std::io::stdin().read_to_string(&mut plaintext)?;
    let plaintext = plaintext.trim_end_matches(['\r', '\n']);

    let encryptor = AesGcmDecryptor::new(&SecretString::from(config.proxy.secret_key));
    println!("{}", encryptor.encrypt(plaintext)?);
    Ok(())
}

fn init_tracing(with_sentry: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(with_sentry.then(|| sentry::integrations::tracing::layer()))
        .init();
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_metrics(proxy::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}
