use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::error::SourceError;

/// Build the shared HTTP client used by every connector.
pub fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    let client = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("game-pulse/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// GET a JSON document, mapping failures onto the source error taxonomy:
/// 429 is `RateLimited` (with `Retry-After` when present), 5xx and network
/// errors are transient, auth failures and other statuses are not.
pub async fn get_json(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
    headers: &[(&'static str, String)],
) -> Result<Value, SourceError> {
    let mut req = client.get(url).header("Accept", "application/json");
    if !query.is_empty() {
        req = req.query(query);
    }
    for (name, value) in headers {
        req = req.header(*name, value);
    }

    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            SourceError::transient(format!("request failed: {e}"))
        } else {
            SourceError::unavailable(format!("request failed: {e}"))
        }
    })?;

    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SourceError::RateLimited { retry_after });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SourceError::unavailable(format!(
            "auth rejected (status={status})"
        )));
    }
    if status.is_server_error() {
        return Err(SourceError::transient(format!("upstream error (status={status})")));
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(SourceError::unavailable(format!(
            "request failed (status={status}): {}",
            truncate(&text, 200)
        )));
    }

    resp.json::<Value>()
        .await
        .map_err(|e| SourceError::unavailable(format!("invalid json body: {e}")))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
