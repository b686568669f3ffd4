use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::errors::ApproverError;
use crate::selector::Selector;
use crate::session::{BrowserSession, TabHandle};

// Default timeout if none is specified on the locator itself
const DEFAULT_LOCATOR_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const VISIBLE_FILTER: &str =
    ".filter(function(el){return !!(el.offsetWidth||el.offsetHeight||el.getClientRects().length);})";

/// Poll `check` until it yields a value or `timeout` elapses.
///
/// Check errors other than transient page failures abort the wait at once.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<Option<T>, ApproverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ApproverError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check().await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(e) if e.is_transient() => debug!(error = %e, "Check failed, polling again"),
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Poll a JavaScript expression until it evaluates to something other than
/// `null`, `false` or `undefined`.
pub async fn wait_for_script(
    session: &dyn BrowserSession,
    tab: &TabHandle,
    expression: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<Option<Value>, ApproverError> {
    poll_until(timeout, interval, move || async move {
        let value = session.evaluate(tab, expression).await?;
        Ok(match value {
            Value::Null | Value::Bool(false) => None,
            other => Some(other),
        })
    })
    .await
}

/// A high-level handle for finding and interacting with page elements.
#[derive(Clone)]
pub struct Locator {
    session: Arc<dyn BrowserSession>,
    tab: TabHandle,
    selector: Selector,
    timeout: Duration, // Default timeout for this locator instance
    poll_interval: Duration,
    visible_only: bool,
}

impl Locator {
    pub fn new(session: Arc<dyn BrowserSession>, tab: TabHandle, selector: impl Into<Selector>) -> Self {
        Self {
            session,
            tab,
            selector: selector.into(),
            timeout: DEFAULT_LOCATOR_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            visible_only: false,
        }
    }

    /// Set a default timeout for waiting operations on this locator instance.
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Only match elements that take up space on the page.
    pub fn visible(mut self, visible_only: bool) -> Self {
        self.visible_only = visible_only;
        self
    }

    /// Expression yielding the matching elements.
    fn list_js(&self) -> String {
        if self.visible_only {
            format!("{}{}", self.selector.to_js_list(), VISIBLE_FILTER)
        } else {
            self.selector.to_js_list()
        }
    }

    /// Run `body` with the first match bound to `el`; yields `null` when
    /// nothing matches.
    fn on_first_js(&self, body: &str) -> String {
        format!(
            "(function(){{var el=({})[0];if(!el){{return null;}}{}}})()",
            self.list_js(),
            body
        )
    }

    fn check_selector(&self) -> Result<(), ApproverError> {
        if let Selector::Invalid(reason) = &self.selector {
            return Err(ApproverError::ElementNotFound(format!("invalid selector: {reason}")));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<usize, ApproverError> {
        self.check_selector()?;
        let value = self
            .session
            .evaluate(&self.tab, &format!("({}).length", self.list_js()))
            .await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    /// Wait for an element matching the locator to appear, up to the specified timeout.
    /// If no timeout is provided, uses the locator's default timeout.
    #[instrument(level = "debug", skip(self, timeout), fields(selector = %self.selector))]
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), ApproverError> {
        let effective_timeout = timeout.unwrap_or(self.timeout);
        let this = self;
        let found = poll_until(effective_timeout, self.poll_interval, move || async move {
            Ok((this.count().await? > 0).then_some(()))
        })
        .await?;
        found.ok_or_else(|| {
            ApproverError::ElementNotFound(format!(
                "{} did not appear within {effective_timeout:?}",
                self.selector
            ))
        })
    }

    /// Wait until nothing (visible, if so configured) matches.
    pub async fn wait_hidden(&self, timeout: Option<Duration>) -> Result<(), ApproverError> {
        let effective_timeout = timeout.unwrap_or(self.timeout);
        let this = self;
        let gone = poll_until(effective_timeout, self.poll_interval, move || async move {
            Ok((this.count().await? == 0).then_some(()))
        })
        .await?;
        gone.ok_or_else(|| {
            ApproverError::Timeout(format!(
                "{} still present after {effective_timeout:?}",
                self.selector
            ))
        })
    }

    /// Scroll the first match into view and click it.
    pub async fn click(&self) -> Result<(), ApproverError> {
        self.wait(None).await?;
        let clicked = self
            .session
            .evaluate(
                &self.tab,
                &self.on_first_js("el.scrollIntoView({block:'center'});el.click();return true;"),
            )
            .await?;
        if clicked.as_bool() != Some(true) {
            return Err(ApproverError::StaleElement(format!(
                "{} vanished before it could be clicked",
                self.selector
            )));
        }
        Ok(())
    }

    /// Clear the first match, focus it and type `text` through the input
    /// pipeline so page listeners see real keystrokes.
    pub async fn fill(&self, text: &str) -> Result<(), ApproverError> {
        self.wait(None).await?;
        let focused = self
            .session
            .evaluate(
                &self.tab,
                &self.on_first_js(
                    "el.scrollIntoView({block:'center'});el.focus();el.value='';\
                     el.dispatchEvent(new Event('input',{bubbles:true}));return true;",
                ),
            )
            .await?;
        if focused.as_bool() != Some(true) {
            return Err(ApproverError::StaleElement(format!(
                "{} vanished before it could be focused",
                self.selector
            )));
        }
        self.session.insert_text(&self.tab, text).await
    }
}
