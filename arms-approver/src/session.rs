//! Browser session adapter.
//!
//! [`BrowserSession`] is the only surface the rest of the crate uses to talk
//! to the browser. [`CdpSession`] implements it over the DevTools Protocol of
//! a browser the operator started with `--remote-debugging-port`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cdp_client::{CdpClient, PageSocket, TabInfo};
use crate::errors::ApproverError;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A browser tab the session can drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabHandle {
    pub id: String,
    pub url: String,
    socket_url: String,
    /// Opened by this process, so it is ours to close.
    pub owned: bool,
}

impl TabHandle {
    pub(crate) fn from_info(info: TabInfo, socket_url: String, owned: bool) -> Self {
        Self {
            id: info.id,
            url: info.url,
            socket_url,
            owned,
        }
    }

    pub fn socket_url(&self) -> &str {
        &self.socket_url
    }
}

/// The common trait every browser backend implements.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Verify the debugging endpoint still answers.
    async fn ping(&self) -> Result<(), ApproverError>;

    /// Find an existing tab whose URL contains `url_pattern`.
    async fn find_tab(&self, url_pattern: &str) -> Result<Option<TabHandle>, ApproverError>;

    async fn open_tab(&self, url: &str) -> Result<TabHandle, ApproverError>;

    async fn close_tab(&self, tab: &TabHandle) -> Result<(), ApproverError>;

    /// Whether the tab still exists and accepts commands.
    async fn is_alive(&self, tab: &TabHandle) -> bool;

    async fn navigate(&self, tab: &TabHandle, url: &str) -> Result<(), ApproverError>;

    async fn evaluate(&self, tab: &TabHandle, expression: &str) -> Result<Value, ApproverError>;

    /// Type into whatever element currently has focus.
    async fn insert_text(&self, tab: &TabHandle, text: &str) -> Result<(), ApproverError>;
}

/// DevTools Protocol implementation of [`BrowserSession`].
pub struct CdpSession {
    client: CdpClient,
    sockets: Mutex<HashMap<String, PageSocket>>,
    command_timeout: Duration,
}

impl CdpSession {
    /// Attach to a running browser. Fails with a connection error when the
    /// endpoint does not answer.
    #[instrument(level = "debug")]
    pub async fn connect(endpoint: &str) -> Result<Self, ApproverError> {
        let client = CdpClient::new(endpoint)?;
        let version = client.version().await?;
        info!(
            browser = %version.browser,
            protocol = %version.protocol_version,
            "Attached to browser at {}",
            client.base_url()
        );
        Ok(Self {
            client,
            sockets: Mutex::new(HashMap::new()),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn handle(&self, info: TabInfo, owned: bool) -> TabHandle {
        let socket_url = self.client.page_socket_url(&info);
        TabHandle::from_info(info, socket_url, owned)
    }

    /// Run `f` against the tab's socket, opening it on first use. A socket
    /// that fails is dropped so the next command reconnects.
    async fn with_socket<T, F>(&self, tab: &TabHandle, f: F) -> Result<T, ApproverError>
    where
        F: for<'s> FnOnce(
            &'s mut PageSocket,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T, ApproverError>> + Send + 's>,
        >,
    {
        let mut sockets = self.sockets.lock().await;
        if !sockets.contains_key(&tab.id) {
            let socket = PageSocket::connect(tab.socket_url()).await?;
            sockets.insert(tab.id.clone(), socket);
        }
        let socket = sockets
            .get_mut(&tab.id)
            .ok_or_else(|| ApproverError::SessionLost(format!("no socket for tab {}", tab.id)))?;

        let result = f(socket).await;
        if let Err(e) = &result {
            if e.is_session_loss() {
                warn!(tab_id = %tab.id, error = %e, "Dropping broken page socket");
                sockets.remove(&tab.id);
            }
        }
        result
    }
}

#[async_trait]
impl BrowserSession for CdpSession {
    async fn ping(&self) -> Result<(), ApproverError> {
        self.client.version().await.map(|_| ())
    }

    async fn find_tab(&self, url_pattern: &str) -> Result<Option<TabHandle>, ApproverError> {
        let tab = self.client.find_tab_by_url(url_pattern).await?;
        if let Some(info) = &tab {
            self.client.activate_tab(&info.id).await?;
        }
        Ok(tab.map(|info| self.handle(info, false)))
    }

    async fn open_tab(&self, url: &str) -> Result<TabHandle, ApproverError> {
        let info = self.client.new_tab(url).await?;
        Ok(self.handle(info, true))
    }

    async fn close_tab(&self, tab: &TabHandle) -> Result<(), ApproverError> {
        self.sockets.lock().await.remove(&tab.id);
        if !tab.owned {
            debug!(tab_id = %tab.id, "Leaving operator tab open");
            return Ok(());
        }
        self.client.close_tab(&tab.id).await?;
        info!(tab_id = %tab.id, "Closed automation tab");
        Ok(())
    }

    async fn is_alive(&self, tab: &TabHandle) -> bool {
        match self.client.get_tabs().await {
            Ok(tabs) => tabs.iter().any(|t| t.id == tab.id),
            Err(e) => {
                debug!(error = %e, "Liveness check failed");
                false
            }
        }
    }

    async fn navigate(&self, tab: &TabHandle, url: &str) -> Result<(), ApproverError> {
        let timeout = self.command_timeout;
        let url = url.to_string();
        self.with_socket(tab, move |socket| {
            Box::pin(async move { socket.navigate(&url, timeout).await })
        })
        .await
    }

    async fn evaluate(&self, tab: &TabHandle, expression: &str) -> Result<Value, ApproverError> {
        let timeout = self.command_timeout;
        let expression = expression.to_string();
        self.with_socket(tab, move |socket| {
            Box::pin(async move { socket.evaluate(&expression, timeout).await })
        })
        .await
    }

    async fn insert_text(&self, tab: &TabHandle, text: &str) -> Result<(), ApproverError> {
        let timeout = self.command_timeout;
        let text = text.to_string();
        self.with_socket(tab, move |socket| {
            Box::pin(async move { socket.insert_text(&text, timeout).await })
        })
        .await
    }
}
