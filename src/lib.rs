pub mod cache;
pub mod cli;
pub mod egress;
pub mod io_util;
pub mod logging;
pub mod proxy;
pub mod rules;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cache::Storage;
use crate::egress::EgressDialer;
use crate::proxy::AppContext;
use crate::rules::Rules;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    info!(
        directory = %settings.cache.directory.display(),
        max_size_gb = settings.cache.max_size_gb,
        buffer_kb = settings.cache.buffer_size_kb,
        default_ttl = %humantime::format_duration(settings.cache.default_ttl),
        "starting cascade caching proxy"
    );

    let app = build_app_context(settings.clone())?;

    let listener = TcpListener::bind(settings.bind_addr())
        .await
        .with_context(|| format!("failed to bind listener on {}", settings.bind_addr()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_task(shutdown_tx);

    proxy::listener::serve(listener, app, shutdown_rx).await
}

/// Assemble the shared application state: storage (with its startup scan),
/// compiled rules, the egress dialer, and the upstream TLS client config.
/// Every failure here is fatal before the listener binds.
pub fn build_app_context(settings: Arc<Settings>) -> Result<AppContext> {
    let storage = Storage::open(
        settings.cache.directory.clone(),
        settings.cache_capacity_bytes(),
        settings.buffer_size_bytes(),
        settings.min_file_size_bytes(),
        settings.max_file_size_bytes(),
    )
    .context("failed to initialize cache storage")?;

    let rules = Rules::new(
        &settings.rules,
        settings.cache.default_ttl,
        settings.cache.respect_headers,
    )
    .context("invalid rules configuration")?;

    let egress =
        EgressDialer::from_settings(&settings.egress).context("invalid egress configuration")?;

    let tls = build_tls_client_config()?;

    Ok(AppContext::new(
        settings,
        Arc::new(storage),
        Arc::new(rules),
        Arc::new(egress),
        Arc::new(tls),
    ))
}

/// TLS client config for `https://` absolute-form requests forwarded
/// upstream. HTTP/1.1 only; client-facing TLS never terminates here, so this
/// is the sole TLS surface.
fn build_tls_client_config() -> Result<ClientConfig> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored invalid system trust anchors");
            }
            if added == 0 {
                warn!("no system trust anchors found; https upstream fetches will fail");
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(unix)]
fn spawn_signal_task(shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT; shutting down"),
            _ = terminate.recv() => info!("received SIGTERM; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(not(unix))]
fn spawn_signal_task(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
}
