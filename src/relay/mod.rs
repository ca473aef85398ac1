//! Relay transport
//!
//! The relay is a local WebSocket broker bridging the CLI/daemon and the
//! browser extension. Bootstrap is a two-fetch handshake (`/config`, then
//! `/pair` when pairing is required) modeled as an explicit state machine;
//! only then is the WebSocket connect URL built.

mod ops_client;

pub use ops_client::{OpsClient, OpsError, OpsEvent, OpsEventKind};

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::error::{BrokerError, Result};

/// Which relay surface to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPath {
    /// Legacy CDP passthrough.
    Cdp,
    /// Structured ops protocol.
    Ops,
    /// Overlay annotation channel.
    Annotation,
}

impl RelayPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cdp => "/cdp",
            Self::Ops => "/ops",
            Self::Annotation => "/annotation",
        }
    }
}

/// Bootstrap progress, for logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapPhase {
    Resolved,
    PairingRequired,
    Paired,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayConfigInfo {
    relay_port: u16,
    #[serde(default)]
    pairing_required: bool,
    #[serde(default)]
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairInfo {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    instance_id: Option<String>,
}

/// A fully resolved relay endpoint ready for a WebSocket connect.
#[derive(Debug, Clone)]
pub struct ResolvedRelayEndpoint {
    pub url: Url,
    pub token: Option<String>,
    pub instance_id: Option<String>,
}

/// Resolve a relay connect URL from its HTTP base URL.
///
/// Any token query param supplied by the caller is discarded; only a token
/// obtained through pairing lands on the connect URL.
pub async fn resolve_relay_endpoint(
    base_url: &str,
    path: RelayPath,
) -> Result<ResolvedRelayEndpoint> {
    let mut base = Url::parse(base_url)
        .map_err(|e| BrokerError::InvalidInput(format!("invalid relay url '{base_url}': {e}")))?;
    sanitize_token_param(&mut base);

    let config_url = join_path(&base, "/config")?;
    let config: RelayConfigInfo = http_get_json(&config_url).await?;
    let mut phase = BootstrapPhase::Resolved;
    debug!(?phase, relay_port = config.relay_port, pairing = config.pairing_required, "relay config fetched");

    let token = if config.pairing_required {
        phase = BootstrapPhase::PairingRequired;
        let pair_url = join_path(&base, "/pair")?;
        let pair: PairInfo = http_get_json(&pair_url).await?;
        let token = pair.token.ok_or(BrokerError::RelayPairingTokenMissing)?;

        // The relay may have restarted between the two fetches; the
        // instance id ties the token to the config we just read.
        if let (Some(expected), Some(actual)) = (&config.instance_id, &pair.instance_id)
            && expected != actual
        {
            return Err(BrokerError::RelayPairingMismatch);
        }
        phase = BootstrapPhase::Paired;
        debug!(?phase, "relay pairing complete");
        Some(token)
    } else {
        None
    };

    let mut connect_url = base.clone();
    let ws_scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    connect_url
        .set_scheme(ws_scheme)
        .map_err(|_| BrokerError::InvalidInput(format!("cannot derive ws scheme for {base}")))?;
    connect_url
        .set_port(Some(config.relay_port))
        .map_err(|_| BrokerError::InvalidInput(format!("cannot set relay port on {base}")))?;
    connect_url.set_path(path.as_str());
    connect_url.set_query(token.as_deref().map(|t| format!("token={t}")).as_deref());

    info!(url = %redacted(&connect_url), "resolved relay endpoint");
    Ok(ResolvedRelayEndpoint { url: connect_url, token, instance_id: config.instance_id })
}

fn sanitize_token_param(url: &mut Url) {
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if remaining.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &remaining {
            pairs.append_pair(k, v);
        }
    }
}

fn join_path(base: &Url, path: &str) -> Result<Url> {
    let mut url = base.clone();
    url.set_path(path);
    url.set_query(None);
    Ok(url)
}

async fn http_get_json<T: serde::de::DeserializeOwned>(url: &Url) -> Result<T> {
    let response = reqwest::get(url.clone())
        .await
        .map_err(|e| BrokerError::RelayUnavailable(e.to_string()))?;
    if response.status().as_u16() == 401 {
        return Err(BrokerError::RelayUnauthorized);
    }
    if !response.status().is_success() {
        return Err(BrokerError::RelayUnavailable(format!(
            "{} returned {}",
            url.path(),
            response.status()
        )));
    }
    response.json::<T>().await.map_err(|e| BrokerError::RelayUnavailable(e.to_string()))
}

fn redacted(url: &Url) -> String {
    let mut clone = url.clone();
    if clone.query().is_some() {
        clone.set_query(Some("token=[REDACTED]"));
    }
    clone.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_token_params_are_dropped() {
        let mut url = Url::parse("http://127.0.0.1:8700/?token=stolen&keep=1")
            .expect("url should parse");
        sanitize_token_param(&mut url);
        assert_eq!(url.query(), Some("keep=1"));

        let mut bare = Url::parse("http://127.0.0.1:8700/?token=stolen").expect("url parses");
        sanitize_token_param(&mut bare);
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn relay_paths_are_stable() {
        assert_eq!(RelayPath::Cdp.as_str(), "/cdp");
        assert_eq!(RelayPath::Ops.as_str(), "/ops");
        assert_eq!(RelayPath::Annotation.as_str(), "/annotation");
    }
}
