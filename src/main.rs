use anyhow::{Context, Result};
use clap::Parser;
use ldap_mfa_proxy::tls;
use ldap_mfa_proxy::{
    run_metrics_server, Config, DnLoginCache, HttpSecondFactor, Metrics, MfaProxy,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-mfa-proxy")]
#[command(about = "LDAP v3 proxy - Enforces a second authentication factor on simple binds")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_mfa_proxy={},info", log_level))
        .init();

    info!("Starting LDAP MFA proxy");

    let config = Arc::new(Config::from_file(&args.config).context("Load config")?);
    let listen_url = args
        .listen
        .clone()
        .unwrap_or_else(|| config.listen.url.clone());

    info!("Configuration loaded:");
    info!("  Listen URL: {}", listen_url);
    info!("  Upstream: {}", config.upstream.uri);
    info!("  Service accounts: {}", config.service_accounts.len());
    info!("  Second factor: {}", config.second_factor.url);

    let second_factor = Arc::new(
        HttpSecondFactor::new(
            &config.second_factor.url,
            Duration::from_secs(config.second_factor.timeout_sec.unwrap_or(10)),
        )
        .context("Second-factor configuration")?,
    );
    let cache = Arc::new(DnLoginCache::new());
    let metrics = Arc::new(Metrics::new());

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let cache_for_http = Arc::clone(&cache);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, cache_for_http).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let tls_acceptor = if listen_url.starts_with("ldaps://") {
        let tls_cfg = config
            .tls
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("LDAPS (ldaps://) requires tls section in config"))?;
        tls::validate_tls_files(&tls_cfg.cert_file, &tls_cfg.key_file)?;
        let server_config =
            tls::load_server_config_from_files(&tls_cfg.cert_file, &tls_cfg.key_file)?;
        info!("TLS enabled for listener");
        Some(TlsAcceptor::from(server_config))
    } else {
        None
    };

    let proxy = MfaProxy::new(
        listen_url,
        config,
        cache,
        second_factor,
        metrics,
        tls_acceptor,
    );

    proxy.start().await
}
