//! Backend table pushes that apply endpoint changes without a reload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use pkg_annotations::LoadBalancing;
use pkg_constants::network::BACKENDS_PATH;
use pkg_store::Pool;
use pkg_types::error::GatewayError;

/// Delivers the current backend table to the running proxy.
#[async_trait]
pub trait UpstreamSync: Send + Sync {
    async fn push_http(&self, pools: &[Pool]) -> anyhow::Result<()>;
    async fn push_stream(&self, pools: &[Pool]) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize)]
struct BackendEndpoint<'a> {
    address: &'a str,
    port: String,
    weight: u32,
    #[serde(rename = "maxFails", skip_serializing_if = "Option::is_none")]
    max_fails: Option<u32>,
    #[serde(rename = "failTimeout", skip_serializing_if = "Option::is_none")]
    fail_timeout: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CookieAffinity {
    name: &'static str,
}

#[derive(Debug, Serialize)]
struct SessionAffinity {
    name: &'static str,
    #[serde(rename = "cookieSessionAffinity")]
    cookie: CookieAffinity,
}

#[derive(Debug, Serialize)]
struct Backend<'a> {
    name: &'a str,
    endpoints: Vec<BackendEndpoint<'a>>,
    #[serde(rename = "sessionAffinityConfig")]
    session_affinity: SessionAffinity,
    #[serde(rename = "upstream-hash-by", skip_serializing_if = "Option::is_none")]
    upstream_hash_by: Option<&'a str>,
    #[serde(rename = "load-balance")]
    load_balance: &'static str,
}

/// JSON backend table of `pools`. Only ready nodes are listed.
pub fn backends_json(pools: &[Pool]) -> serde_json::Result<Vec<u8>> {
    let backends: Vec<Backend<'_>> = pools
        .iter()
        .map(|pool| Backend {
            name: &pool.name,
            endpoints: pool
                .nodes
                .iter()
                .filter(|n| n.ready)
                .map(|n| BackendEndpoint {
                    address: &n.host,
                    port: n.port.to_string(),
                    weight: n.weight,
                    max_fails: n.max_fails,
                    fail_timeout: n.fail_timeout,
                })
                .collect(),
            session_affinity: match pool.lb {
                LoadBalancing::CookieSticky => SessionAffinity {
                    name: "cookie",
                    cookie: CookieAffinity { name: "route" },
                },
                _ => SessionAffinity {
                    name: "",
                    cookie: CookieAffinity { name: "" },
                },
            },
            upstream_hash_by: pool.hash_by.as_deref(),
            load_balance: pool.lb.balancer_name(),
        })
        .collect();
    serde_json::to_vec(&backends)
}

/// Pushes over the proxy's local status port (HTTP) and stream
/// configuration port (TCP).
pub struct DynamicPusher {
    client: reqwest::Client,
    backends_url: String,
    stream_addr: String,
    timeout: Duration,
}

impl DynamicPusher {
    pub fn new(status_port: u16, stream_port: u16, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_endpoints(
            format!("http://127.0.0.1:{}{}", status_port, BACKENDS_PATH),
            format!("127.0.0.1:{}", stream_port),
            timeout,
        )
    }

    pub fn with_endpoints(
        backends_url: impl Into<String>,
        stream_addr: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            backends_url: backends_url.into(),
            stream_addr: stream_addr.into(),
            timeout,
        })
    }
}

#[async_trait]
impl UpstreamSync for DynamicPusher {
    async fn push_http(&self, pools: &[Pool]) -> anyhow::Result<()> {
        let body = backends_json(pools)?;
        let resp = self
            .client
            .post(&self.backends_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("backend push: {}", e)))?;
        if resp.status() != StatusCode::CREATED {
            return Err(GatewayError::Transient(format!(
                "backend push answered {}",
                resp.status()
            ))
            .into());
        }
        debug!("Pushed {} HTTP backends", pools.len());
        Ok(())
    }

    async fn push_stream(&self, pools: &[Pool]) -> anyhow::Result<()> {
        let mut body = backends_json(pools)?;
        body.extend_from_slice(b"\r\n");
        let write = async {
            let mut stream = TcpStream::connect(&self.stream_addr).await?;
            stream.write_all(&body).await?;
            stream.shutdown().await?;
            Ok::<_, std::io::Error>(())
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| GatewayError::Transient("stream backend push timed out".to_string()))?
            .map_err(|e| GatewayError::Transient(format!("stream backend push: {}", e)))?;
        debug!("Pushed {} stream backends", pools.len());
        Ok(())
    }
}
