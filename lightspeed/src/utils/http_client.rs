use std::{sync::OnceLock, time::Duration};

use tracing::{debug, warn};

/// User agent sent to sources and storage.
const USER_AGENT: &str = concat!("lightspeed/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client used for sources, storage and collaborators.
///
/// Only a connect timeout is set: a whole-request timeout would cut long
/// media bodies off mid-transfer.
pub fn build_streaming_client(connect_timeout: Duration) -> reqwest::Client {
    install_rustls_provider();

    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .tcp_nodelay(true)
        .pool_max_idle_per_host(20)
        .build()
        .unwrap_or_else(|error| {
            warn!(
                error = %error,
                "Failed to create configured HTTP client; falling back to reqwest defaults"
            );
            reqwest::Client::new()
        })
}
