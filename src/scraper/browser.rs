//! Fallback retrieval through a headless Chromium.
//!
//! The browser loads the human-facing calendar page, runs whatever challenge
//! or redirect scripts the page serves, and prints the rendered DOM.

use crate::config::{FetcherConfig, SourceConfig};
use crate::error::FetchError;
use crate::models::{RawContent, StrategyKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{challenge_signature, RetrievalStrategy};

pub struct BrowserStrategy {
    binary: PathBuf,
    page_url: String,
    user_agent: String,
    render_timeout: Duration,
    virtual_time_budget_ms: u64,
}

impl BrowserStrategy {
    pub fn new(source: &SourceConfig, config: &FetcherConfig) -> Self {
        Self {
            binary: config.browser_path.clone(),
            page_url: source.page_url.clone(),
            user_agent: config.user_agent.clone(),
            render_timeout: Duration::from_secs(config.render_timeout_secs),
            virtual_time_budget_ms: config.virtual_time_budget_ms,
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "--headless=new".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            format!("--user-agent={}", self.user_agent),
            format!("--virtual-time-budget={}", self.virtual_time_budget_ms),
            "--dump-dom".to_string(),
            self.page_url.clone(),
        ]
    }
}

#[async_trait]
impl RetrievalStrategy for BrowserStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fallback
    }

    async fn retrieve(&self) -> Result<RawContent, FetchError> {
        debug!("Rendering {} with {:?}", self.page_url, self.binary);

        let child = Command::new(&self.binary)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FetchError::network(
                    StrategyKind::Fallback,
                    format!("could not start {:?}: {}", self.binary, e),
                )
            })?;

        let output = match timeout(self.render_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(FetchError::network(StrategyKind::Fallback, e)),
            Err(_) => {
                return Err(FetchError::Timeout {
                    strategy: StrategyKind::Fallback,
                    after: self.render_timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or_default().to_string();
            return Err(FetchError::network(
                StrategyKind::Fallback,
                format!("browser exited with {}: {}", output.status, last_line),
            ));
        }

        let dom = String::from_utf8_lossy(&output.stdout).into_owned();
        if dom.trim().is_empty() {
            return Err(FetchError::network(StrategyKind::Fallback, "browser printed an empty DOM"));
        }
        if let Some(sig) = challenge_signature(&dom) {
            return Err(FetchError::blocked(
                StrategyKind::Fallback,
                format!("challenge still present after render ({:?})", sig),
            ));
        }

        Ok(RawContent::Markup(dom))
    }
}
