//! Plain TCP connectivity probe.

use crate::base::Probe;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use vigil_common::{Status, StatusDescription};

/// Dial `address` once within `dial_timeout`.
pub async fn check_tcp(address: &str, dial_timeout: Duration) -> StatusDescription {
    let started = Instant::now();
    match timeout(dial_timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => StatusDescription::new(
            Status::Ok,
            format!(
                "TCP OK - {} ms response time",
                started.elapsed().as_millis()
            ),
        ),
        Ok(Err(err)) => StatusDescription::new(
            Status::Critical,
            format!("TCP connection to {address} failed: {err}"),
        ),
        Err(_) => StatusDescription::new(
            Status::Critical,
            format!(
                "Connection timed out after {} seconds",
                dial_timeout.as_secs()
            ),
        ),
    }
}

/// Probe wrapper around [`check_tcp`] for a check's primary address.
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> TcpProbe {
        TcpProbe {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> StatusDescription {
        if self.address.is_empty() {
            return StatusDescription::new(Status::Ok, "");
        }
        check_tcp(&self.address, Duration::from_secs(10)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ok_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = check_tcp(&address, Duration::from_secs(10)).await;
        assert_eq!(result.current_status, Status::Ok);
        assert!(result.description.starts_with("TCP OK"));
    }

    #[tokio::test]
    async fn critical_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = check_tcp(&address, Duration::from_secs(10)).await;
        assert_eq!(result.current_status, Status::Critical);
    }
}
