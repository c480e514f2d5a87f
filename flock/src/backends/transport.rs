//! Network plumbing shared by the HTTP and peer adapters.
//!
//! Adapters talk to their servers through the [`JsonTransport`] and
//! [`StreamTransport`] traits so tests can substitute scripted fakes.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::SinkExt;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::PoolError;

/// Request/response JSON calls against one server.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(&self, path: &str) -> Result<Value>;

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value>;
}

/// Frames received from a streaming call, ending when the server closes it.
pub type FrameStream = BoxStream<'static, Result<Value>>;

/// Persistent socket carrying JSON frames.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a socket at `path`, send `body` as the first frame and return the
    /// frames that follow.
    async fn open_stream(&self, path: &str, body: &Value) -> Result<FrameStream>;
}

/// Everything the peer adapter needs.
pub trait PeerTransport: JsonTransport + StreamTransport {}

impl<T: JsonTransport + StreamTransport + ?Sized> PeerTransport for T {}

/// `reqwest` for JSON calls, `tokio-tungstenite` for sockets.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// `address` must start with `http://` or `https://`; a trailing slash is ignored.
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let base_url = address.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(PoolError::ConfigInvalid("address cannot be empty".into()).into());
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(PoolError::ConfigInvalid(format!(
                "address must start with http:// or https://, got: {base_url}"
            ))
            .into());
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// The websocket URL for `path` on an http(s) base.
fn websocket_url(base: &str, path: &str) -> String {
    let url = join_url(base, path);
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.context("reading response body")?;
    if !status.is_success() {
        let excerpt: String = body.chars().take(200).collect();
        return Err(PoolError::RemoteProtocol(format!(
            "HTTP {}: {}",
            status.as_u16(),
            excerpt
        ))
        .into());
    }
    parse_frame(&body)
}

fn parse_frame(raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| PoolError::RemoteProtocol(format!("response is not JSON: {err}")).into())
}

#[async_trait]
impl JsonTransport for HttpTransport {
    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        read_json(response).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        read_json(response).await
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open_stream(&self, path: &str, body: &Value) -> Result<FrameStream> {
        let url = websocket_url(&self.base_url, path);
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("connecting websocket {url}"))?;
        socket
            .send(Message::Text(body.to_string()))
            .await
            .context("sending websocket request")?;

        let frames = socket
            .take_while(|msg| futures::future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(parse_frame(&text)),
                    Ok(Message::Binary(bytes)) => Some(
                        serde_json::from_slice::<Value>(&bytes).map_err(|err| {
                            anyhow::Error::from(PoolError::RemoteProtocol(format!(
                                "frame is not JSON: {err}"
                            )))
                        }),
                    ),
                    Ok(_) => None,
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                        None
                    }
                    Err(err) => Some(Err(anyhow!(err).context("websocket receive failed"))),
                }
            });
        Ok(frames.boxed())
    }
}
