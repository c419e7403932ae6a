//! In-process transport: records frames on a channel instead of the network
//!
//! Used to drive client pipelines without sockets, e.g. when simulating
//! traffic shaping or under paused test time.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::{PacketTransport, TransportError};
use crate::relay::protocol::FlaggedFrame;

/// A frame handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub address: String,
    pub frame: FlaggedFrame,
}

pub struct ChannelTransport {
    sent: mpsc::UnboundedSender<SentFrame>,
    /// Canned responses for `request`, by address
    responses: Mutex<HashMap<String, Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SentFrame>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (
            Self {
                sent,
                responses: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Answer every `request` to `address` with `response`
    pub fn respond_with(&self, address: &str, response: Vec<u8>) {
        self.responses.lock().insert(address.to_string(), response);
    }
}

#[async_trait]
impl PacketTransport for ChannelTransport {
    async fn transmit(&self, address: &str, frame: &FlaggedFrame) -> Result<(), TransportError> {
        self.sent
            .send(SentFrame {
                address: address.to_string(),
                frame: frame.clone(),
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn request(&self, address: &str, frame: &FlaggedFrame) -> Result<Vec<u8>, TransportError> {
        self.transmit(address, frame).await?;
        self.responses
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed {
                address: address.to_string(),
                reason: "no response configured".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_frames() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.transmit("a:1", &FlaggedFrame::cover(vec![7])).await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.address, "a:1");
        assert_eq!(sent.frame, FlaggedFrame::cover(vec![7]));
    }

    #[tokio::test]
    async fn test_request_uses_canned_response() {
        let (transport, _rx) = ChannelTransport::new();
        assert!(transport.request("p:1", &FlaggedFrame::pull("bob")).await.is_err());
        transport.respond_with("p:1", vec![1, 2]);
        assert_eq!(transport.request("p:1", &FlaggedFrame::pull("bob")).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert!(matches!(
            transport.transmit("a:1", &FlaggedFrame::comm(vec![])).await,
            Err(TransportError::Closed)
        ));
    }
}
