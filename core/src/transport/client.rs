// Client-side transport — connects to a router and exchanges one
// request/response pair at a time over a keep-alive TCP link

use super::http::{HttpRequest, HttpResponse, MAX_BODY_SIZE};
use super::TransportError;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Resource every envelope is posted to
pub const ENVELOPE_RESOURCE: &str = "/";

/// Ceiling for a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub address: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Attempts before giving up, at least one
    pub retries: u32,
    /// First backoff sleep, doubled per failed attempt
    pub backoff: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7450".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            retries: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConnector {
    config: ConnectorConfig,
}

impl RouterConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Exponential backoff for a failed attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.config.backoff.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(2u64.pow(std::cmp::min(attempt, 5)));
        std::cmp::min(Duration::from_millis(backoff_ms), MAX_BACKOFF)
    }

    /// Connect, retrying with backoff.
    pub async fn connect(&self) -> Result<RouterLink, TransportError> {
        let attempts = self.config.retries.max(1);

        for attempt in 0..attempts {
            match tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(&self.config.address),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!("Connected to router at {}", self.config.address);
                    return Ok(RouterLink::new(stream, self.config.read_timeout));
                }
                Ok(Err(e)) => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {}",
                        self.config.address,
                        attempt + 1,
                        attempts,
                        e
                    );
                }
                Err(_) => {
                    warn!(
                        "Connect to {} timed out (attempt {}/{})",
                        self.config.address,
                        attempt + 1,
                        attempts
                    );
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff_duration(attempt)).await;
            }
        }

        Err(TransportError::ConnectFailed {
            address: self.config.address.clone(),
            attempts,
        })
    }
}

/// An open connection to the router
pub struct RouterLink {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    read_timeout: Duration,
}

impl RouterLink {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            read_timeout,
        }
    }

    /// Post `body` and wait for the response.
    pub async fn exchange(
        &mut self,
        body: Vec<u8>,
        session: Option<&str>,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = HttpRequest::post(ENVELOPE_RESOURCE, body);
        if let Some(session) = session {
            request.set_session(session);
        }
        request.write_to(&mut self.writer).await?;

        let (response, _) = tokio::time::timeout(
            self.read_timeout,
            HttpResponse::read_from(&mut self.reader, MAX_BODY_SIZE),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn connector(address: String, retries: u32) -> RouterConnector {
        RouterConnector::new(ConnectorConfig {
            address,
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(200),
            retries,
            backoff: Duration::from_millis(5),
        })
    }

    #[test]
    fn test_backoff_duration() {
        let connector = RouterConnector::new(ConnectorConfig::default());
        let d0 = connector.backoff_duration(0);
        let d1 = connector.backoff_duration(1);
        let d5 = connector.backoff_duration(5);
        assert_eq!(d1, d0 * 2);
        assert!(d5 >= d1);
        assert_eq!(connector.backoff_duration(10), d5);
        assert!(connector.backoff_duration(u32::MAX) <= MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connector(address, 3).connect().await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_exchange_times_out_without_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(stream);
        });

        let mut link = connector(address, 1).connect().await.unwrap();
        let err = link.exchange(b"x".to_vec(), Some("abc")).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        server.abort();
    }
}
