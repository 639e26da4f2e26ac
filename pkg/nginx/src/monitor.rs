use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pkg_metrics::GatewayMetrics;

/// One request observed by the proxy's log phase.
#[derive(Debug, Deserialize)]
pub struct RequestSample {
    pub host: String,
    pub status: u16,
    /// Seconds.
    pub request_time: f64,
}

/// Local socket receiving newline-delimited [`RequestSample`]s.
pub struct MonitorServer {
    listener: TcpListener,
    metrics: Arc<GatewayMetrics>,
}

impl MonitorServer {
    pub async fn bind(addr: SocketAddr, metrics: Arc<GatewayMetrics>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, metrics })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Monitor socket listening on {:?}", self.listener.local_addr().ok());
            loop {
                tokio::select! {
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let metrics = self.metrics.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move { read_samples(stream, metrics, cancel).await });
                        }
                        Err(e) => warn!("Monitor accept error: {}", e),
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

async fn read_samples(stream: TcpStream, metrics: Arc<GatewayMetrics>, cancel: CancellationToken) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => return,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<RequestSample>(&line) {
                Ok(s) => metrics.observe_request(&s.host, s.status, s.request_time),
                Err(e) => debug!("Dropping malformed monitor sample: {}", e),
            },
            Ok(None) => return,
            Err(e) => {
                debug!("Monitor connection error: {}", e);
                return;
            }
        }
    }
}
