// Presence and metrics registration over HTTP
//
// Both calls are fire-and-forget: the blocking request runs on tokio's
// blocking pool and failures are only logged.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::descriptor::ParticipantDescriptor;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Registry rejected request with status {0}")]
    Status(u16),
}

/// Body of `POST {base}/presence`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub host: String,
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    pub layer: Option<u32>,
}

impl PresenceRecord {
    pub fn from_descriptor(descriptor: &ParticipantDescriptor) -> Self {
        Self {
            host: descriptor.host.clone(),
            pub_key: BASE64.encode(&descriptor.public_key),
            layer: descriptor.layer,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationClient {
    base_url: String,
    timeout: Duration,
}

impl RegistrationClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str, body: serde_json::Value) -> Result<(), RegistrationError> {
        let url = format!("{}/{}", self.base_url, path);
        match ureq::post(&url).timeout(self.timeout).send_json(body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(RegistrationError::Status(code)),
            Err(err) => Err(RegistrationError::Http(err.to_string())),
        }
    }

    /// Blocking presence registration
    pub fn register_presence(&self, record: &PresenceRecord) -> Result<(), RegistrationError> {
        let body = serde_json::to_value(record).map_err(|e| RegistrationError::Http(e.to_string()))?;
        self.post("presence", body)
    }

    /// Blocking metrics report, one `{counter: count}` object
    pub fn report_metrics(&self, counters: &BTreeMap<String, u64>) -> Result<(), RegistrationError> {
        self.post("metrics", json!(counters))
    }

    /// Fire-and-forget presence registration
    pub fn spawn_presence(&self, record: PresenceRecord) {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = client.register_presence(&record) {
                tracing::warn!("Presence registration at {} failed: {}", client.base_url, e);
            } else {
                tracing::debug!("Registered presence for {}", record.host);
            }
        });
    }

    /// Fire-and-forget metrics report
    pub fn spawn_metrics(&self, counters: BTreeMap<String, u64>) {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = client.report_metrics(&counters) {
                tracing::warn!("Metrics report to {} failed: {}", client.base_url, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ParticipantKind;

    #[test]
    fn test_presence_record_json() {
        let d = ParticipantDescriptor::new("m1", ParticipantKind::Mix, "10.0.0.2", "9000", [0xff; 32]).with_layer(1);
        let record = PresenceRecord::from_descriptor(&d);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["host"], "10.0.0.2");
        assert_eq!(value["layer"], 1);
        let key = value["pubKey"].as_str().unwrap();
        assert_eq!(BASE64.decode(key).unwrap(), vec![0xff; 32]);
    }

    #[test]
    fn test_base_url_normalized() {
        assert_eq!(RegistrationClient::new("http://reg:8080/").base_url(), "http://reg:8080");
    }

    #[test]
    fn test_unreachable_registry_is_an_error() {
        // Port 9 (discard) on localhost is not expected to run an HTTP server
        let client = RegistrationClient::new("http://127.0.0.1:9");
        assert!(client.report_metrics(&BTreeMap::new()).is_err());
    }
}
