//! TCP transport: one connection per frame, length-prefixed

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{PacketTransport, TransportError};
use crate::relay::protocol::{read_frame, write_frame, FlaggedFrame};

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Upper bound on connecting to a peer
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a response frame
    pub response_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, address: &str) -> Result<TcpStream, TransportError> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))?
            .map_err(|e| TransportError::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle on connection to {}: {}", address, e);
        }
        Ok(stream)
    }
}

#[async_trait]
impl PacketTransport for TcpTransport {
    async fn transmit(&self, address: &str, frame: &FlaggedFrame) -> Result<(), TransportError> {
        let mut stream = self.connect(address).await?;
        write_frame(&mut stream, &frame.to_bytes()).await?;
        Ok(())
    }

    async fn request(&self, address: &str, frame: &FlaggedFrame) -> Result<Vec<u8>, TransportError> {
        let mut stream = self.connect(address).await?;
        write_frame(&mut stream, &frame.to_bytes()).await?;
        let response = timeout(self.config.response_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))??;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_transmit_and_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            // transmit
            let (mut stream, _) = listener.accept().await.unwrap();
            let bytes = read_frame(&mut stream).await.unwrap();
            assert_eq!(FlaggedFrame::from_bytes(&bytes).unwrap(), FlaggedFrame::comm(vec![1, 2]));

            // request
            let (mut stream, _) = listener.accept().await.unwrap();
            let bytes = read_frame(&mut stream).await.unwrap();
            assert_eq!(FlaggedFrame::from_bytes(&bytes).unwrap().pull_recipient().unwrap(), "alice");
            write_frame(&mut stream, b"reply").await.unwrap();
        });

        let transport = TcpTransport::new();
        transport.transmit(&addr, &FlaggedFrame::comm(vec![1, 2])).await.unwrap();
        let reply = transport.request(&addr, &FlaggedFrame::pull("alice")).await.unwrap();
        assert_eq!(reply, b"reply");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpTransport::new().transmit(&addr, &FlaggedFrame::comm(vec![])).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
    }
}
