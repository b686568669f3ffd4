//! ARMS portal steps.
//!
//! [`Portal`] names the page-level operations the record driver sequences.
//! [`CdpPortal`] performs them in an attached browser tab; tests substitute
//! an in-memory implementation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::Timeouts;
use crate::errors::ApproverError;
use crate::locator::{poll_until, wait_for_script, Locator};
use crate::selector::Selector;
use crate::session::{BrowserSession, TabHandle};

/// How the OU ID is matched by the packages table search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Whole-cell regex match. Client-side tables only.
    #[default]
    Equals,
    /// Prefix regex match. Client-side tables only.
    StartsWith,
    /// The table's own substring search.
    Plain,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Equals => "equals",
            MatchMode::StartsWith => "startswith",
            MatchMode::Plain => "plain",
        }
    }
}

/// Addresses and DOM hooks of the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub requests_url: String,
    /// Substring identifying a portal tab among the open tabs.
    pub host: String,
    /// Path the portal returns to after a successful submission.
    pub packages_path: String,
    pub table: String,
    pub processing_overlay: String,
    pub link_text: String,
    pub approver_input: String,
    pub suggestion_items: String,
    pub approver_value_field: String,
    pub submit_button: String,
    pub confirmation: String,
    pub match_mode: MatchMode,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            requests_url: "https://bat.bats.kyndryl.net/arms2/unit-owner/packages".to_string(),
            host: "bat.bats.kyndryl.net".to_string(),
            packages_path: "/arms2/unit-owner/packages".to_string(),
            table: "#packages_table".to_string(),
            processing_overlay: "#packages_table_processing".to_string(),
            link_text: "New approver".to_string(),
            approver_input: "#approver_value_input".to_string(),
            suggestion_items: "ul.suggest-list li, ul.ui-autocomplete li".to_string(),
            approver_value_field: "input[name='approver_value']".to_string(),
            submit_button: "input[type='submit'][name='submit'][value='Submit']".to_string(),
            confirmation: ".alert-success, .alert-info, .alert-warning, .alert-danger".to_string(),
            match_mode: MatchMode::Equals,
        }
    }
}

/// Page-level operations on the portal, in the order a record needs them.
#[async_trait]
pub trait Portal: Send + Sync {
    /// Whether the automation tab still accepts commands.
    async fn is_alive(&self) -> bool;

    /// Re-attach to the browser and re-acquire an automation tab.
    async fn reconnect(&self) -> Result<(), ApproverError>;

    /// Load the packages list and wait for it to settle.
    async fn open_packages(&self) -> Result<(), ApproverError>;

    /// Filter the packages table down to one OU and show every row.
    async fn search_account(&self, ou_id: &str) -> Result<(), ApproverError>;

    /// Absolute URLs of the distinct "New approver" links now visible.
    async fn approver_links(&self, account_name: &str) -> Result<Vec<String>, ApproverError>;

    /// Open an add-approver form and wait for its input.
    async fn open_approver_form(&self, link: &str) -> Result<(), ApproverError>;

    /// Type an approver and pick the matching autocomplete suggestion.
    async fn enter_approver(&self, approver: &str) -> Result<(), ApproverError>;

    async fn submit(&self) -> Result<(), ApproverError>;

    /// Wait for the portal's success signal after a submission.
    async fn await_confirmation(&self) -> Result<(), ApproverError>;

    /// Release the automation tab.
    async fn close(&self) -> Result<(), ApproverError>;
}

/// Build `(<function source>)(<json args>...)`.
fn call_js(function: &str, args: &[Value]) -> String {
    let args: Vec<String> = args.iter().map(Value::to_string).collect();
    format!("({})({})", function.trim(), args.join(","))
}

const SEARCH_JS: &str = r#"
function(tableSel, query, mode){
  function escapeRegex(s){
    return String(s).replace(/[.*+?^${}()|[\]\\]/g, '\\$&');
  }
  var tableEl = document.querySelector(tableSel);
  if (!tableEl) return {applied:false, message:'table not found'};
  var dt = null;
  try {
    dt = (window.jQuery && window.jQuery.fn && window.jQuery.fn.dataTable)
         ? window.jQuery(tableEl).DataTable() : null;
  } catch (e) { dt = null; }
  if (dt) {
    var settings = dt.settings ? dt.settings()[0] : null;
    var serverSide = settings ? !!settings.oFeatures.bServerSide : false;
    if (!serverSide && mode === 'equals') {
      dt.search('^' + escapeRegex(query) + '$', true, false).draw(false);
      return {applied:true, message:'client-side regex equals search'};
    }
    if (!serverSide && mode === 'startswith') {
      dt.search('^' + escapeRegex(query), true, false).draw(false);
      return {applied:true, message:'client-side regex prefix search'};
    }
    dt.search(query).draw(false);
    return {applied:true, message:'api plain search'};
  }
  var input = document.querySelector('div.dataTables_filter input[type="search"]') ||
              document.querySelector('input[type="search"]');
  if (input) {
    input.value = query;
    input.dispatchEvent(new Event('input', {bubbles:true}));
    input.dispatchEvent(new Event('change', {bubbles:true}));
    return {applied:true, message:'search input'};
  }
  return {applied:false, message:'no search control'};
}"#;

const PAGE_LENGTH_JS: &str = r#"
function(tableSel, len){
  var tableEl = document.querySelector(tableSel);
  if (!tableEl) return {applied:false, message:'table not found'};
  var dt = null;
  try {
    dt = (window.jQuery && window.jQuery.fn && window.jQuery.fn.dataTable)
         ? window.jQuery(tableEl).DataTable() : null;
  } catch (e) { dt = null; }
  if (dt) {
    dt.page.len(len).draw(false);
    return {applied:true, message:'page length via API'};
  }
  var sel = document.querySelector(tableSel + '_length select');
  if (sel) {
    sel.value = String(len);
    sel.dispatchEvent(new Event('change', {bubbles:true}));
    return {applied:true, message:'page length via dropdown'};
  }
  return {applied:false, message:'no API and no dropdown'};
}"#;

const LINKS_JS: &str = r#"
function(tableSel, linkText){
  var body = document.querySelector(tableSel + ' tbody');
  if (!body) return null;
  var seen = {}, links = [];
  Array.from(body.querySelectorAll('tr')).forEach(function(row){
    if (!(row.offsetWidth || row.offsetHeight || row.getClientRects().length)) return;
    if (!row.querySelector('td')) return;
    var a = Array.from(row.querySelectorAll('a')).find(function(el){
      return (el.textContent || '').replace(/\s+/g, ' ').trim().indexOf(linkText) !== -1;
    });
    if (!a || !a.href) return;
    if (!seen[a.href]) { seen[a.href] = true; links.push(a.href); }
  });
  return links.length ? links : null;
}"#;

const PICK_SUGGESTION_JS: &str = r#"
function(itemsSel, query){
  var items = Array.from(document.querySelectorAll(itemsSel)).filter(function(el){
    return !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
  });
  if (!items.length) return null;
  var q = String(query).trim().toLowerCase();
  var chosen = items.find(function(el){
    return q && (el.innerText || el.textContent || '').trim().toLowerCase().indexOf(q) !== -1;
  }) || items[0];
  chosen.scrollIntoView({block:'nearest'});
  var target = chosen.querySelector('a, div') || chosen;
  ['mouseover','mousedown','mouseup','click'].forEach(function(type){
    target.dispatchEvent(new MouseEvent(type, {bubbles:true, cancelable:true, view:window}));
  });
  return (chosen.innerText || chosen.textContent || '').trim();
}"#;

const FIELD_POPULATED_JS: &str = r#"
function(fieldSel){
  var el = document.querySelector(fieldSel);
  return !!(el && el.value && el.value.trim().length > 0);
}"#;

const CONFIRMED_JS: &str = r#"
function(packagesPath, alertSel, inputSel){
  if (location.href.indexOf(packagesPath) !== -1) return 'returned to packages list';
  if (document.querySelector(alertSel)) return 'alert shown';
  if (!document.querySelector(inputSel)) return 'approver form closed';
  return null;
}"#;

const READY_JS: &str = "document.readyState === 'complete'";

/// [`Portal`] over a live browser session.
pub struct CdpPortal {
    session: Arc<dyn BrowserSession>,
    tab: RwLock<Option<TabHandle>>,
    /// Ids of tabs this portal opened; they stay ours across reconnects.
    opened: Mutex<HashSet<String>>,
    config: PortalConfig,
    timeouts: Timeouts,
}

impl CdpPortal {
    /// Take over an open portal tab, or open one at the requests URL.
    #[instrument(skip_all)]
    pub async fn attach(
        session: Arc<dyn BrowserSession>,
        config: PortalConfig,
        timeouts: Timeouts,
    ) -> Result<Self, ApproverError> {
        let portal = Self {
            session,
            tab: RwLock::new(None),
            opened: Mutex::new(HashSet::new()),
            config,
            timeouts,
        };
        portal.acquire_tab().await?;
        Ok(portal)
    }

    async fn acquire_tab(&self) -> Result<TabHandle, ApproverError> {
        let mut opened = self.opened.lock().await;
        let tab = match self.session.find_tab(&self.config.host).await? {
            Some(mut tab) => {
                tab.owned = tab.owned || opened.contains(&tab.id);
                info!(tab_id = %tab.id, url = %tab.url, owned = tab.owned, "Using existing portal tab");
                tab
            }
            None => {
                let tab = self.session.open_tab(&self.config.requests_url).await?;
                info!(tab_id = %tab.id, "Opened new portal tab");
                tab
            }
        };
        if tab.owned {
            opened.insert(tab.id.clone());
        }

        let previous = self.tab.write().await.replace(tab.clone());
        if let Some(previous) = previous.filter(|p| p.owned && p.id != tab.id) {
            opened.remove(&previous.id);
            // Usually already gone after a session loss.
            if let Err(e) = self.session.close_tab(&previous).await {
                debug!(tab_id = %previous.id, error = %e, "Could not close replaced tab");
            }
        }
        Ok(tab)
    }

    async fn tab(&self) -> Result<TabHandle, ApproverError> {
        self.tab
            .read()
            .await
            .clone()
            .ok_or_else(|| ApproverError::SessionLost("no automation tab".into()))
    }

    fn locator(&self, tab: &TabHandle, selector: &str) -> Locator {
        Locator::new(self.session.clone(), tab.clone(), Selector::from(selector))
            .set_default_timeout(self.timeouts.element)
            .poll_interval(self.timeouts.poll_interval)
    }

    async fn navigate(&self, tab: &TabHandle, url: &str) -> Result<(), ApproverError> {
        self.session.navigate(tab, url).await?;
        let ready = wait_for_script(
            self.session.as_ref(),
            tab,
            READY_JS,
            self.timeouts.element,
            self.timeouts.poll_interval,
        )
        .await?;
        if ready.is_none() {
            return Err(ApproverError::Timeout(format!("{url} did not finish loading")));
        }
        Ok(())
    }

    /// The overlay may never appear for fast tables; a timeout is not an error.
    async fn wait_for_processing(&self, tab: &TabHandle) -> Result<(), ApproverError> {
        let overlay = self.locator(tab, &self.config.processing_overlay).visible(true);
        match overlay.wait_hidden(None).await {
            Err(ApproverError::Timeout(msg)) => {
                warn!("Table still processing, continuing anyway: {}", msg);
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl Portal for CdpPortal {
    async fn is_alive(&self) -> bool {
        match self.tab.read().await.as_ref() {
            Some(tab) => self.session.is_alive(tab).await,
            None => false,
        }
    }

    async fn reconnect(&self) -> Result<(), ApproverError> {
        self.session.ping().await?;
        self.acquire_tab().await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn open_packages(&self) -> Result<(), ApproverError> {
        let tab = self.tab().await?;
        self.navigate(&tab, &self.config.requests_url).await?;
        self.wait_for_processing(&tab).await
    }

    #[instrument(skip(self))]
    async fn search_account(&self, ou_id: &str) -> Result<(), ApproverError> {
        let tab = self.tab().await?;
        self.locator(&tab, &self.config.table).wait(None).await?;

        let result = self
            .session
            .evaluate(
                &tab,
                &call_js(
                    SEARCH_JS,
                    &[
                        json!(self.config.table),
                        json!(ou_id.trim()),
                        json!(self.config.match_mode.as_str()),
                    ],
                ),
            )
            .await?;
        debug!(?result, "Search applied");
        if result.get("applied").and_then(Value::as_bool) != Some(true) {
            return Err(ApproverError::ElementNotFound(format!(
                "cannot search packages table: {}",
                result.get("message").and_then(Value::as_str).unwrap_or("unknown")
            )));
        }
        self.wait_for_processing(&tab).await?;

        let result = self
            .session
            .evaluate(&tab, &call_js(PAGE_LENGTH_JS, &[json!(self.config.table), json!(-1)]))
            .await?;
        debug!(?result, "Page length set");
        self.wait_for_processing(&tab).await
    }

    #[instrument(skip(self))]
    async fn approver_links(&self, account_name: &str) -> Result<Vec<String>, ApproverError> {
        let tab = self.tab().await?;
        let script = call_js(
            LINKS_JS,
            &[json!(self.config.table), json!(self.config.link_text)],
        );
        let (session, tab, script) = (self.session.as_ref(), &tab, &script);
        let found = poll_until(self.timeouts.element, self.timeouts.poll_interval, move || async move {
            // Rows may render after the search settles; an empty list is not final.
            let links: Vec<String> = match session.evaluate(tab, script).await? {
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            Ok((!links.is_empty()).then_some(links))
        })
        .await?;

        found.ok_or_else(|| {
            ApproverError::ElementNotFound(format!(
                "no '{}' links found for Account name: {account_name}",
                self.config.link_text
            ))
        })
    }

    #[instrument(skip(self))]
    async fn open_approver_form(&self, link: &str) -> Result<(), ApproverError> {
        let tab = self.tab().await?;
        self.navigate(&tab, link).await?;
        self.locator(&tab, &self.config.approver_input).wait(None).await
    }

    #[instrument(skip(self))]
    async fn enter_approver(&self, approver: &str) -> Result<(), ApproverError> {
        let tab = self.tab().await?;
        self.locator(&tab, &self.config.approver_input)
            .fill(approver)
            .await?;

        let not_found = || ApproverError::SuggestionNotFound {
            query: approver.to_string(),
        };

        let script = call_js(
            PICK_SUGGESTION_JS,
            &[json!(self.config.suggestion_items), json!(approver)],
        );
        let picked = wait_for_script(
            self.session.as_ref(),
            &tab,
            &script,
            self.timeouts.suggestion,
            self.timeouts.poll_interval,
        )
        .await?
        .ok_or_else(not_found)?;
        debug!(suggestion = %picked, "Picked suggestion");

        // The visible input is cosmetic; the form posts the hidden field.
        let populated = wait_for_script(
            self.session.as_ref(),
            &tab,
            &call_js(FIELD_POPULATED_JS, &[json!(self.config.approver_value_field)]),
            self.timeouts.suggestion,
            self.timeouts.poll_interval,
        )
        .await?;
        populated.map(|_| ()).ok_or_else(not_found)
    }

    async fn submit(&self) -> Result<(), ApproverError> {
        let tab = self.tab().await?;
        self.locator(&tab, &self.config.submit_button).click().await
    }

    async fn await_confirmation(&self) -> Result<(), ApproverError> {
        let tab = self.tab().await?;
        let script = call_js(
            CONFIRMED_JS,
            &[
                json!(self.config.packages_path),
                json!(self.config.confirmation),
                json!(self.config.approver_input),
            ],
        );
        let signal = wait_for_script(
            self.session.as_ref(),
            &tab,
            &script,
            self.timeouts.confirmation,
            self.timeouts.poll_interval,
        )
        .await?
        .ok_or_else(|| {
            ApproverError::Timeout("no confirmation after submitting approver".into())
        })?;
        debug!(?signal, "Submission confirmed");
        Ok(())
    }

    async fn close(&self) -> Result<(), ApproverError> {
        let tab = self.tab.write().await.take();
        if let Some(tab) = tab {
            self.opened.lock().await.remove(&tab.id);
            self.session.close_tab(&tab).await?;
        }
        Ok(())
    }
}
