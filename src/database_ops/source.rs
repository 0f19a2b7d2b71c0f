use async_trait::async_trait;

use crate::database_ops::rate_limit::{BudgetSpec, SourceGate};
use crate::error::SourceError;
use crate::models::{FetchWindow, RawRecord};

/// Anything that can produce raw records for a game.
///
/// Implementations keep their auth and response-shape quirks private and route
/// every outbound call through the injected [`SourceGate`].
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Stable source tag stamped on every record (`opendota`, `steam`, ...).
    fn source(&self) -> &'static str;

    /// Request budget of the upstream API.
    fn budget(&self) -> BudgetSpec;

    fn supports(&self, game_id: &str) -> bool;

    async fn fetch(
        &self,
        game_id: &str,
        window: &FetchWindow,
        gate: &SourceGate,
    ) -> Result<Vec<RawRecord>, SourceError>;
}
