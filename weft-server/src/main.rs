//! # weft-server
//!
//! Runs the sync server configured from `WEFT_*` environment variables.
//! Logging honors `RUST_LOG` and defaults to `info`.

use anyhow::{Context, Result};
use std::sync::Arc;
use weft_collab::{HmacTokens, IdentityVerifier, OpenAccess, SyncServer};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting weft server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let verifier: Arc<dyn IdentityVerifier> = match &config.auth_secret {
        Some(secret) => Arc::new(HmacTokens::new(secret).context("Invalid WEFT_AUTH_SECRET")?),
        None => {
            log::warn!("WEFT_AUTH_SECRET not set; accepting any token as the user name");
            Arc::new(OpenAccess)
        }
    };

    let server = SyncServer::new(config.server, verifier).context("Failed to open storage")?;

    for doc in &config.documents {
        server
            .storage()
            .catalog
            .register(*doc)
            .with_context(|| format!("Failed to register document {doc}"))?;
    }
    if !config.documents.is_empty() {
        log::info!("Registered {} documents", config.documents.len());
    }

    server.run().await.context("Server stopped")?;
    Ok(())
}
