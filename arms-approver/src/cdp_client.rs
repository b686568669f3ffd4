use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::errors::ApproverError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lightweight Chrome DevTools Protocol client for an already running browser.
///
/// Talks to the HTTP discovery endpoints (`/json/*`). Commands for a single
/// page go through a [`PageSocket`].
#[derive(Debug, Clone)]
pub struct CdpClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub websocket_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserVersion {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub websocket_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CdpRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CdpResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<Value>,
}

impl CdpClient {
    /// Accepts `host:port` or a full `http://host:port` URL.
    pub fn new(endpoint: &str) -> Result<Self, ApproverError> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ApproverError::Connection {
                endpoint: base_url.clone(),
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `host:port` part of the endpoint, used to build page socket URLs.
    pub fn host(&self) -> &str {
        self.base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base_url)
    }

    fn connection_error(&self, message: impl ToString) -> ApproverError {
        ApproverError::Connection {
            endpoint: self.base_url.clone(),
            message: message.to_string(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ApproverError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?
            .error_for_status()
            .map_err(|e| self.connection_error(e))?;
        response
            .json()
            .await
            .map_err(|e| self.connection_error(format!("unexpected response from {path}: {e}")))
    }

    /// Check if a browser is running with DevTools enabled
    pub async fn is_available(&self) -> bool {
        self.version().await.is_ok()
    }

    pub async fn version(&self) -> Result<BrowserVersion, ApproverError> {
        self.get_json("/json/version").await
    }

    /// All open page targets (service workers and extensions are filtered out).
    pub async fn get_tabs(&self) -> Result<Vec<TabInfo>, ApproverError> {
        let tabs: Vec<TabInfo> = self.get_json("/json/list").await?;
        let pages: Vec<TabInfo> = tabs
            .into_iter()
            .filter(|t| t.kind.is_empty() || t.kind == "page")
            .collect();
        debug!("Found {} open tabs", pages.len());
        Ok(pages)
    }

    pub async fn find_tab_by_url(&self, url_pattern: &str) -> Result<Option<TabInfo>, ApproverError> {
        let tab = self
            .get_tabs()
            .await?
            .into_iter()
            .find(|t| t.url.contains(url_pattern));
        match &tab {
            Some(t) => debug!("Found tab with URL pattern '{}': {}", url_pattern, t.url),
            None => debug!("No tab found with URL pattern '{}'", url_pattern),
        }
        Ok(tab)
    }

    /// Open a new tab. Recent Chrome builds only accept `PUT` here.
    pub async fn new_tab(&self, url: &str) -> Result<TabInfo, ApproverError> {
        let response = self
            .client
            .put(format!("{}/json/new?{}", self.base_url, url))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?
            .error_for_status()
            .map_err(|e| self.connection_error(e))?;
        let tab: TabInfo = response
            .json()
            .await
            .map_err(|e| self.connection_error(format!("unexpected response from /json/new: {e}")))?;
        debug!(tab_id = %tab.id, url, "Opened tab");
        Ok(tab)
    }

    pub async fn activate_tab(&self, tab_id: &str) -> Result<(), ApproverError> {
        self.get_text(&format!("/json/activate/{tab_id}")).await.map(|_| ())
    }

    pub async fn close_tab(&self, tab_id: &str) -> Result<(), ApproverError> {
        self.get_text(&format!("/json/close/{tab_id}")).await.map(|_| ())
    }

    async fn get_text(&self, path: &str) -> Result<String, ApproverError> {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?
            .error_for_status()
            .map_err(|e| self.connection_error(e))?
            .text()
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Debugger socket URL for a tab, falling back to the conventional path
    /// when the listing omitted it.
    pub fn page_socket_url(&self, tab: &TabInfo) -> String {
        tab.websocket_url
            .clone()
            .unwrap_or_else(|| format!("ws://{}/devtools/page/{}", self.host(), tab.id))
    }
}

/// A command channel to a single page target.
pub struct PageSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl PageSocket {
    pub async fn connect(url: &str) -> Result<Self, ApproverError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ApproverError::SessionLost(format!("cannot open page socket {url}: {e}")))?;
        debug!(%url, "Page socket connected");
        Ok(Self {
            stream,
            next_id: 0,
        })
    }

    /// Send one command and wait for its response. Protocol events arriving in
    /// between are discarded.
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ApproverError> {
        self.next_id += 1;
        let id = self.next_id;
        let request = serde_json::to_string(&CdpRequest { id, method, params })
            .map_err(|e| ApproverError::Script(e.to_string()))?;

        self.stream
            .send(Message::Text(request))
            .await
            .map_err(|e| ApproverError::SessionLost(format!("send {method}: {e}")))?;

        let wait = async {
            loop {
                let message = match self.stream.next().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(ApproverError::SessionLost(format!("{method}: {e}"))),
                    None => return Err(ApproverError::SessionLost(format!("{method}: socket closed"))),
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        return Err(ApproverError::SessionLost(format!("{method}: page closed the socket")))
                    }
                    _ => continue,
                };
                let response: CdpResponse = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Ignoring unparseable CDP message: {}", e);
                        continue;
                    }
                };
                if response.id != Some(id) {
                    continue;
                }
                if let Some(error) = response.error {
                    return Err(ApproverError::Script(format!("CDP error in {method}: {error}")));
                }
                return Ok(response.result.unwrap_or(Value::Null));
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ApproverError::Timeout(format!("{method} got no reply within {timeout:?}")))?
    }

    /// Evaluate an expression in the page and return its JSON value.
    pub async fn evaluate(&mut self, expression: &str, timeout: Duration) -> Result<Value, ApproverError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                timeout,
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let description = details
                .pointer("/exception/description")
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("JavaScript exception");
            if description.contains("detached") || description.contains("stale") {
                return Err(ApproverError::StaleElement(description.to_string()));
            }
            return Err(ApproverError::Script(description.to_string()));
        }

        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), ApproverError> {
        let result = self.call("Page.navigate", json!({ "url": url }), timeout).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(ApproverError::Script(format!("navigation to {url} failed: {error}")));
        }
        Ok(())
    }

    /// Type text into the focused element as if from the keyboard.
    pub async fn insert_text(&mut self, text: &str, timeout: Duration) -> Result<(), ApproverError> {
        self.call("Input.insertText", json!({ "text": text }), timeout)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_endpoint() {
        assert_eq!(CdpClient::new("127.0.0.1:9222").unwrap().base_url(), "http://127.0.0.1:9222");
        assert_eq!(CdpClient::new("http://localhost:9222/").unwrap().base_url(), "http://localhost:9222");
        assert_eq!(CdpClient::new("localhost:9222").unwrap().host(), "localhost:9222");
    }

    #[test]
    fn builds_socket_url_when_listing_omits_it() {
        let client = CdpClient::new("127.0.0.1:9222").unwrap();
        let tab = TabInfo {
            id: "ABC".into(),
            title: String::new(),
            url: String::new(),
            kind: "page".into(),
            websocket_url: None,
        };
        assert_eq!(
            client.page_socket_url(&tab),
            "ws://127.0.0.1:9222/devtools/page/ABC"
        );
    }
}
