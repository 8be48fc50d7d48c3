//! Server list heartbeats
//!
//! Every configured endpoint gets its own loop. A round posts the current
//! [`HeartbeatRecord`] and treats the response body as the server's public
//! URL. Failures are logged and retried after a short delay; the loops only
//! end when the server shuts down.

use crate::error::HeartbeatError;
use crate::utils::wait_for_flag;
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const SOFTWARE: &str = concat!("classic-server ", env!("CARGO_PKG_VERSION"));

/// Player counts published by the server for heartbeat rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub current_players: usize,
    pub max_players: usize,
}

/// Form fields sent to a heartbeat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatRecord {
    pub name: String,
    pub port: u16,
    pub users: usize,
    pub max: usize,
    #[serde(serialize_with = "title_case_bool")]
    pub public: bool,
    pub salt: String,
    pub version: u8,
    pub software: String,
}

fn title_case_bool<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *value { "True" } else { "False" })
}

/// Random alphanumeric salt identifying this server instance.
pub fn generate_salt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Values that stay the same across every round.
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub server_name: String,
    pub port: u16,
    pub public: bool,
    pub salt: String,
    pub protocol_version: u8,
    pub interval: Duration,
    pub error_delay: Duration,
    pub timeout: Duration,
    pub external_url_path: Option<PathBuf>,
}

pub struct HeartbeatClient {
    http: reqwest::Client,
    endpoint: String,
    settings: HeartbeatSettings,
    stats: watch::Receiver<ServerStats>,
    external_url: watch::Sender<Option<String>>,
}

impl HeartbeatClient {
    pub fn new(
        endpoint: impl Into<String>,
        settings: HeartbeatSettings,
        stats: watch::Receiver<ServerStats>,
        external_url: watch::Sender<Option<String>>,
    ) -> Result<Self, HeartbeatError> {
        let http = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            settings,
            stats,
            external_url,
        })
    }

    pub fn record(&self) -> HeartbeatRecord {
        let stats = *self.stats.borrow();
        HeartbeatRecord {
            name: self.settings.server_name.clone(),
            port: self.settings.port,
            users: stats.current_players,
            max: stats.max_players,
            public: self.settings.public,
            salt: self.settings.salt.clone(),
            version: self.settings.protocol_version,
            software: SOFTWARE.to_string(),
        }
    }

    /// Sends one heartbeat and returns the URL the endpoint answered with.
    pub async fn beat(&self) -> Result<String, HeartbeatError> {
        let record = self.record();
        let request = self.http.post(&self.endpoint).form(&record).send();
        let response = tokio::time::timeout(self.settings.timeout, request)
            .await
            .map_err(|_| HeartbeatError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(HeartbeatError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        parse_url(&body)
    }

    /// Publishes `url` if it differs from the last one seen. The file is
    /// written before watchers are notified.
    async fn publish(&self, url: String) -> Result<(), HeartbeatError> {
        if self.external_url.borrow().as_deref() == Some(url.as_str()) {
            return Ok(());
        }
        info!("External URL: {}", url);
        if let Some(path) = &self.settings.external_url_path {
            tokio::fs::write(path, format!("{}\n", url)).await?;
        }
        self.external_url.send_replace(Some(url));
        Ok(())
    }

    /// Heartbeats until `shutdown` is set.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!("heartbeat loop for {} started", self.endpoint);
        loop {
            let delay = match self.beat().await {
                Ok(url) => {
                    if let Err(e) = self.publish(url).await {
                        warn!("heartbeat {}: {}", self.endpoint, e);
                    }
                    self.settings.interval
                }
                Err(e) => {
                    warn!("heartbeat to {} failed: {}", self.endpoint, e);
                    self.settings.error_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_flag(&mut shutdown) => break,
            }
        }
        debug!("heartbeat loop for {} stopped", self.endpoint);
    }
}

fn parse_url(body: &str) -> Result<String, HeartbeatError> {
    let url = body.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.to_string())
    } else {
        Err(HeartbeatError::InvalidUrl(url.chars().take(100).collect()))
    }
}

/// Starts one heartbeat loop per endpoint. Endpoints whose client cannot be
/// built are logged and skipped.
pub fn spawn_heartbeats(
    endpoints: &[String],
    settings: &HeartbeatSettings,
    stats: &watch::Receiver<ServerStats>,
    external_url: &watch::Sender<Option<String>>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    endpoints
        .iter()
        .filter_map(|endpoint| {
            match HeartbeatClient::new(endpoint, settings.clone(), stats.clone(), external_url.clone()) {
                Ok(client) => Some(tokio::spawn(client.run(shutdown.clone()))),
                Err(e) => {
                    warn!("skipping heartbeat endpoint {}: {}", endpoint, e);
                    None
                }
            }
        })
        .collect()
}
