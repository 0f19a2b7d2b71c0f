pub mod embedded_store;
pub mod http;
pub mod loader;
pub mod mock;
pub mod opendota;
pub mod pg_store;
pub mod rate_limit;
pub mod riot;
pub mod source;
pub mod steam;
pub mod warehouse;
pub mod worker_manager;

use std::sync::Arc;
use std::time::Duration;

use crate::config::SourceSettings;
use source::SourceConnector;

/// Per-request HTTP timeout; the whole extraction is bounded separately.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Real upstream connectors. Sources without credentials are still
/// registered and report themselves unavailable when called.
pub fn connectors_from_config(
    sources: &SourceSettings,
) -> anyhow::Result<Vec<Arc<dyn SourceConnector>>> {
    let http = http::build_client(HTTP_TIMEOUT)?;
    Ok(vec![
        Arc::new(opendota::provider::OpenDotaProvider::new(
            http.clone(),
            sources.opendota_base_url.clone(),
            sources.opendota_api_key.clone(),
        )),
        Arc::new(steam::provider::SteamProvider::new(
            http.clone(),
            sources.steam_base_url.clone(),
            sources.steam_api_key.clone(),
        )),
        Arc::new(riot::provider::RiotProvider::new(
            http,
            sources.riot_base_url.clone(),
            sources.riot_api_key.clone(),
            sources.riot_puuids.clone(),
        )),
    ])
}
