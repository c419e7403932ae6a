//! Benchmark client: blasts a fixed number of messages at a fixed interval
//! with every cover source off and writes a timestamped summary.

use chrono::{DateTime, Local};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::client::{ClientConfig, ClientError, ClientPipeline};
use crate::privacy::cover::CoverTrafficPolicy;

pub const PAYLOAD_PREFIX: &str = "testMessage";
pub const SUMMARY_FILE_NAME: &str = "benchClientSummary";

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Sending stopped at `index`; the run is aborted so results are not biased
    #[error("Send of message {index} failed: {source}")]
    Send {
        index: usize,
        #[source]
        source: ClientError,
    },
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Summary I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub messages: usize,
    pub interval: Duration,
    /// Encode one packet up front and send it repeatedly
    pub pregen: bool,
    pub recipient_id: String,
    pub summary_path: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            messages: 100,
            interval: Duration::from_millis(100),
            pregen: false,
            recipient_id: "BenchmarkClientRecipient".to_string(),
            summary_path: PathBuf::from(SUMMARY_FILE_NAME),
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<(), BenchError> {
        if self.messages == 0 {
            return Err(BenchError::InvalidConfig("messages must be > 0".to_string()));
        }
        if self.recipient_id.is_empty() {
            return Err(BenchError::InvalidConfig("recipient_id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Client settings for a benchmark run: no cover, no fetching
    pub fn client_config(base: ClientConfig) -> ClientConfig {
        ClientConfig {
            policy: CoverTrafficPolicy::benchmark(),
            fetch_enabled: false,
            ..base
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedMessage {
    pub content: String,
    pub timestamp: DateTime<Local>,
}

/// Outcome of a benchmark run
#[derive(Debug, Clone)]
pub struct BenchSummary {
    pub sent: Vec<TimestampedMessage>,
    pub earliest: DateTime<Local>,
    pub latest: DateTime<Local>,
}

impl BenchSummary {
    pub fn from_sent(sent: Vec<TimestampedMessage>) -> Option<Self> {
        let earliest = sent.iter().map(|m| m.timestamp).min()?;
        let latest = sent.iter().map(|m| m.timestamp).max()?;
        Some(Self { sent, earliest, latest })
    }

    pub fn span(&self) -> chrono::Duration {
        self.latest - self.earliest
    }

    /// Write the tab-separated summary: header, then one line per message
    pub fn write_to(&self, mut out: impl Write) -> std::io::Result<()> {
        writeln!(out, "Timestamp\tContent")?;
        for msg in &self.sent {
            writeln!(out, "{}\t{}", format_timestamp(&msg.timestamp), msg.content)?;
        }
        out.flush()
    }

    pub fn write_file(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_to(std::io::BufWriter::new(file))
    }
}

pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.9f %z").to_string()
}

/// Runs a benchmark over an already started client
pub struct BenchClient {
    client: ClientPipeline,
    config: BenchConfig,
}

impl BenchClient {
    pub fn new(client: ClientPipeline, config: BenchConfig) -> Result<Self, BenchError> {
        config.validate()?;
        Ok(Self { client, config })
    }

    /// Send every message, write the summary file and shut the client down
    pub async fn run(self) -> Result<BenchSummary, BenchError> {
        self.client.reconfigure(CoverTrafficPolicy::benchmark())?;
        self.client.set_fetch_enabled(false);

        tracing::info!(
            "Bench: sending {} messages every {:?} to {}",
            self.config.messages,
            self.config.interval,
            self.config.recipient_id
        );

        let sent = self.send_messages().await;
        let Self { client, config } = self;
        client.shutdown().await;
        let sent = sent?;

        let summary = BenchSummary::from_sent(sent)
            .ok_or_else(|| BenchError::InvalidConfig("no messages were sent".to_string()))?;
        summary.write_file(&config.summary_path)?;
        tracing::info!(
            "Bench: earliest {} latest {} span {}ms, summary in {}",
            format_timestamp(&summary.earliest),
            format_timestamp(&summary.latest),
            summary.span().num_milliseconds(),
            config.summary_path.display()
        );
        Ok(summary)
    }

    async fn send_messages(&self) -> Result<Vec<TimestampedMessage>, BenchError> {
        let mut sent = Vec::with_capacity(self.config.messages);

        if self.config.pregen {
            let packet = self.client.encode_frame(PAYLOAD_PREFIX.as_bytes(), &self.config.recipient_id)?;
            for index in 0..self.config.messages {
                self.client
                    .transmit_frame(&packet)
                    .await
                    .map_err(|source| BenchError::Send { index, source })?;
                sent.push(TimestampedMessage {
                    content: PAYLOAD_PREFIX.to_string(),
                    timestamp: Local::now(),
                });
                tokio::time::sleep(self.config.interval).await;
            }
        } else {
            for index in 0..self.config.messages {
                let content = format!("{PAYLOAD_PREFIX}{index}");
                self.client
                    .send(content.as_bytes(), &self.config.recipient_id)
                    .await
                    .map_err(|source| BenchError::Send { index, source })?;
                sent.push(TimestampedMessage {
                    content,
                    timestamp: Local::now(),
                });
                tokio::time::sleep(self.config.interval).await;
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Local> {
        Local.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn test_summary_bounds() {
        let summary = BenchSummary::from_sent(vec![
            TimestampedMessage {
                content: "b".to_string(),
                timestamp: at(250),
            },
            TimestampedMessage {
                content: "a".to_string(),
                timestamp: at(0),
            },
        ])
        .unwrap();
        assert_eq!(summary.earliest, at(0));
        assert_eq!(summary.latest, at(250));
        assert_eq!(summary.span().num_milliseconds(), 250);
        assert!(BenchSummary::from_sent(Vec::new()).is_none());
    }

    #[test]
    fn test_summary_format() {
        let summary = BenchSummary::from_sent(vec![TimestampedMessage {
            content: "testMessage0".to_string(),
            timestamp: at(0),
        }])
        .unwrap();
        let mut out = Vec::new();
        summary.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Timestamp\tContent");
        assert!(lines[1].ends_with("\ttestMessage0"));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(BenchConfig::default().validate().is_ok());
        let empty = BenchConfig {
            messages: 0,
            ..Default::default()
        };
        assert!(matches!(empty.validate(), Err(BenchError::InvalidConfig(_))));
    }

    #[test]
    fn test_client_config_disables_cover() {
        let cfg = BenchConfig::client_config(ClientConfig {
            id: "bench".to_string(),
            provider_id: "p".to_string(),
            ..Default::default()
        });
        assert_eq!(cfg.policy, CoverTrafficPolicy::benchmark());
        assert!(!cfg.fetch_enabled);
        assert_eq!(cfg.id, "bench");
    }
}
