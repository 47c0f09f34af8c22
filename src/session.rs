//! Browser session: attach to an externally launched Chrome and drive the
//! assistant page through one query/response exchange at a time.
//!
//! The pipeline never launches its own browser. An operator starts Chrome
//! with `--remote-debugging-port` and logs into the assistant; we discover
//! the DevTools websocket through the `/json/version` endpoint and connect
//! to it. Losing that websocket is a `SessionLost` error, which is fatal to
//! the batch but leaves every pending task checkpointed for a later resume.
//!
//! All of `headless_chrome` is blocking, so the orchestrator calls into this
//! module through `spawn_blocking` with the session behind a mutex. That
//! mutex doubles as the guarantee that exchanges never interleave: a second
//! submit cannot start until the first response has stabilized or timed out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use headless_chrome::{Browser, Element, Tab};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::ExtractError;

/// Abstraction over one prompt/response exchange with the assistant.
///
/// The production implementation drives a real Chrome tab; tests substitute
/// scripted clients.
pub trait AssistantClient: Send {
    /// Start a fresh conversation, submit the prompt, and block until the
    /// response text has stabilized. Returns the raw response text.
    fn exchange(&mut self, prompt: &str) -> Result<String, ExtractError>;

    /// Best-effort recovery between retry attempts (renavigate, re-focus).
    fn recover(&mut self) -> Result<(), ExtractError> {
        Ok(())
    }
}

/// Identity of an attached session, surfaced in status output.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub ws_url: String,
    pub browser_version: String,
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
    #[serde(rename = "Browser", default)]
    browser: String,
}

/// A live connection to the operator's Chrome instance.
pub struct BrowserSession {
    config: BrowserConfig,
    _browser: Browser,
    tab: Arc<Tab>,
    descriptor: SessionDescriptor,
}

impl BrowserSession {
    /// Attach to the Chrome debug port and navigate the tab to the
    /// assistant page. Attach failures are `SessionLost`: without a browser
    /// there is nothing to retry at the task level.
    pub fn attach(config: &BrowserConfig) -> Result<Self, ExtractError> {
        let version_url = format!("http://127.0.0.1:{}/json/version", config.debug_port);
        debug!(url = %version_url, "discovering DevTools endpoint");

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.attach_timeout_secs))
            .build()
            .map_err(|e| ExtractError::SessionLost(format!("http client: {e}")))?;

        let info: VersionInfo = client
            .get(&version_url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| {
                ExtractError::SessionLost(format!(
                    "no Chrome debug endpoint on port {}: {e}",
                    config.debug_port
                ))
            })?;

        let browser = Browser::connect(info.web_socket_debugger_url.clone())
            .map_err(|e| ExtractError::SessionLost(format!("websocket connect: {e}")))?;

        // Reuse the operator's existing tab when possible so their login
        // session carries over; fall back to opening one.
        let tab = match browser.get_tabs().lock() {
            Ok(tabs) => tabs.first().cloned(),
            Err(_) => None,
        };
        let tab = match tab {
            Some(t) => t,
            None => browser
                .new_tab()
                .map_err(|e| ExtractError::SessionLost(format!("open tab: {e}")))?,
        };

        let descriptor = SessionDescriptor {
            ws_url: info.web_socket_debugger_url,
            browser_version: info.browser,
        };
        info!(version = %descriptor.browser_version, "attached to browser");

        let session = Self {
            config: config.clone(),
            _browser: browser,
            tab,
            descriptor,
        };
        session.navigate_home()?;
        Ok(session)
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    fn navigate_home(&self) -> Result<(), ExtractError> {
        self.tab
            .navigate_to(&self.config.assistant_url)
            .map_err(|e| ExtractError::Automation(format!("navigate: {e}")))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| ExtractError::Automation(format!("page load: {e}")))?;
        Ok(())
    }

    /// Start a fresh conversation thread so earlier answers cannot bleed
    /// into the next response. Tries the configured selectors, then falls
    /// back to renavigating the assistant URL.
    fn new_conversation(&self) -> Result<(), ExtractError> {
        for selector in &self.config.new_thread_selectors {
            if let Ok(element) = self.tab.find_element(selector) {
                if element.click().is_ok() {
                    debug!(selector, "started new thread");
                    std::thread::sleep(Duration::from_millis(500));
                    return Ok(());
                }
            }
        }
        debug!("no new-thread control matched, renavigating");
        self.navigate_home()
    }

    /// Find the prompt input by trying each configured selector in order.
    fn find_input(&self) -> Result<Element<'_>, ExtractError> {
        for selector in &self.config.input_selectors {
            match self.tab.wait_for_element_with_custom_timeout(
                selector,
                Duration::from_secs(5),
            ) {
                Ok(element) => {
                    debug!(selector, "located prompt input");
                    return Ok(element);
                }
                Err(_) => continue,
            }
        }
        Err(ExtractError::Automation(
            "no prompt input matched any configured selector".to_string(),
        ))
    }

    fn submit(&self, prompt: &str) -> Result<(), ExtractError> {
        let input = self.find_input()?;
        input
            .click()
            .map_err(|e| ExtractError::Automation(format!("focus input: {e}")))?;
        self.tab
            .type_str(prompt)
            .map_err(|e| ExtractError::Automation(format!("type prompt: {e}")))?;
        self.tab
            .press_key("Enter")
            .map_err(|e| ExtractError::Automation(format!("submit prompt: {e}")))?;
        Ok(())
    }

    /// Read the current response text through the configured selectors.
    fn response_text(&self) -> Option<String> {
        for selector in &self.config.response_selectors {
            if let Ok(element) = self.tab.find_element(selector) {
                if let Ok(text) = element.get_inner_text() {
                    let trimmed = text.trim().to_string();
                    if !trimmed.is_empty() {
                        return Some(trimmed);
                    }
                }
            }
        }
        None
    }

    /// Wait until the response stops growing.
    ///
    /// Streaming responses have no completion event we can trust across
    /// assistant UIs, so quiescence is inferred: poll the response text and
    /// accept it once `stability_checks` consecutive polls return identical
    /// content of at least `min_response_chars`. A hard deadline caps the
    /// whole wait.
    fn wait_for_idle(&self, baseline: &str) -> Result<String, ExtractError> {
        let deadline = Instant::now() + self.config.response_timeout();
        let mut last_text = String::new();
        let mut stable_polls = 0u32;

        loop {
            if Instant::now() >= deadline {
                if accept_at_deadline(&self.config, &last_text, baseline) {
                    warn!(chars = last_text.len(), "deadline hit, keeping partial response");
                    return Ok(last_text);
                }
                return Err(ExtractError::Timeout(self.config.response_timeout()));
            }

            std::thread::sleep(self.config.poll_interval());

            let current = self.response_text().unwrap_or_default();
            // Ignore leftover text from before the submit.
            if current == baseline {
                continue;
            }

            if current.len() >= self.config.min_response_chars && current == last_text {
                stable_polls += 1;
                if stable_polls >= self.config.stability_checks {
                    debug!(chars = current.len(), "response stabilized");
                    return Ok(current);
                }
            } else {
                stable_polls = 0;
                last_text = current;
            }
        }
    }
}

/// Deadline policy: a response still growing when the timeout fires fails
/// the exchange unless the operator opted into keeping partials.
fn accept_at_deadline(config: &BrowserConfig, last_text: &str, baseline: &str) -> bool {
    config.accept_partial_on_timeout
        && last_text.len() >= config.min_response_chars
        && last_text != baseline
}

impl AssistantClient for BrowserSession {
    fn exchange(&mut self, prompt: &str) -> Result<String, ExtractError> {
        self.new_conversation()?;
        let baseline = self.response_text().unwrap_or_default();
        self.submit(prompt)?;
        self.wait_for_idle(&baseline)
    }

    fn recover(&mut self) -> Result<(), ExtractError> {
        warn!("recovering session: renavigating assistant page");
        self.navigate_home()
    }
}
