use crate::config::{FetcherConfig, SourceConfig};
use crate::error::FetchError;
use crate::models::{RawContent, StrategyKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{challenge_signature, RetrievalStrategy};

/// DataTables columns the calendar endpoint expects, in table order.
const COLUMNS: &[&str] = &[
    "symbol",
    "units",
    "opening_date",
    "closing_date",
    "issue_manager",
    "status",
    "view",
];

/// Query string of a DataTables server-side request for the first `length` rows.
pub fn datatables_params(length: u32) -> Vec<(String, String)> {
    let mut params = vec![("draw".to_string(), "1".to_string())];

    for (i, name) in COLUMNS.iter().enumerate() {
        let col = |field: &str| format!("columns[{}][{}]", i, field);
        params.push((col("data"), name.to_string()));
        params.push((col("name"), name.to_string()));
        params.push((col("searchable"), "true".to_string()));
        params.push((col("orderable"), "true".to_string()));
        params.push((format!("columns[{}][search][value]", i), String::new()));
        params.push((format!("columns[{}][search][regex]", i), "false".to_string()));
    }

    params.push(("start".to_string(), "0".to_string()));
    params.push(("length".to_string(), length.to_string()));
    params.push(("search[value]".to_string(), String::new()));
    params.push(("search[regex]".to_string(), "false".to_string()));
    params
}

/// Browser-like header profile for the XHR the calendar page itself makes.
fn browser_headers(referer: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(
        header::ACCEPT,
        HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
    );
    h.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    h.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
    h.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    h.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    h.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    if let Ok(v) = HeaderValue::from_str(referer) {
        h.insert(header::REFERER, v);
    }
    h
}

/// Primary strategy: a single XHR-style GET against the JSON endpoint.
pub struct HttpStrategy {
    inner: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpStrategy {
    pub fn new(source: &SourceConfig, config: &FetcherConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(browser_headers(&source.page_url))
            .timeout(timeout)
            .gzip(true)
            // Accept cookies so challenge clearance survives between attempts
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        let url = Url::parse_with_params(&source.endpoint, datatables_params(source.page_length))
            .with_context(|| format!("Invalid source endpoint {:?}", source.endpoint))?;

        Ok(Self { inner, url, timeout })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        transport_error(e.is_timeout(), self.timeout, e)
    }
}

fn transport_error(is_timeout: bool, after: Duration, e: impl std::fmt::Display) -> FetchError {
    if is_timeout {
        FetchError::Timeout {
            strategy: StrategyKind::Primary,
            after,
        }
    } else {
        FetchError::network(StrategyKind::Primary, e)
    }
}

/// Classify a completed response. Anything but the JSON payload counts as
/// blocked: the endpoint serves HTML only as a challenge or as the page shell,
/// whose table is filled client-side and would parse to nothing.
pub fn check_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: String,
) -> Result<RawContent, FetchError> {
    if !status.is_success() {
        return Err(FetchError::blocked(
            StrategyKind::Primary,
            format!("HTTP {}", status),
        ));
    }
    if let Some(sig) = challenge_signature(&body) {
        return Err(FetchError::blocked(
            StrategyKind::Primary,
            format!("challenge page ({:?})", sig),
        ));
    }

    match classify_body(content_type, body) {
        RawContent::Markup(html) => Err(FetchError::blocked(
            StrategyKind::Primary,
            format!("HTML instead of JSON ({} bytes)", html.len()),
        )),
        json => Ok(json),
    }
}

/// Decide whether the body is the JSON payload or page markup.
pub fn classify_body(content_type: Option<&str>, body: String) -> RawContent {
    let is_json = content_type.is_some_and(|ct| ct.contains("json"))
        || matches!(body.trim_start().chars().next(), Some('{') | Some('['));
    if is_json {
        RawContent::Json(body)
    } else {
        RawContent::Markup(body)
    }
}

#[async_trait]
impl RetrievalStrategy for HttpStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Primary
    }

    async fn retrieve(&self) -> Result<RawContent, FetchError> {
        debug!("GET {}", self.url.as_str().split('?').next().unwrap_or_default());

        let resp = self
            .inner
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = resp.text().await.map_err(|e| self.map_error(e))?;

        check_response(status, content_type.as_deref(), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatables_params_cover_every_column() {
        let params = datatables_params(100);
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("draw"), Some("1"));
        assert_eq!(get("length"), Some("100"));
        assert_eq!(get("columns[0][data]"), Some("symbol"));
        assert_eq!(get("columns[6][name]"), Some("view"));
        assert_eq!(get("columns[3][search][regex]"), Some("false"));
        assert_eq!(params.len(), 1 + COLUMNS.len() * 6 + 4);
    }

    #[test]
    fn test_request_url_is_encoded() {
        let strategy = HttpStrategy::new(&SourceConfig::default(), &FetcherConfig::default()).unwrap();
        let url = strategy.url();
        assert_eq!(url.host_str(), Some("www.nepsealpha.com"));
        assert!(url.query().unwrap().contains("columns%5B0%5D%5Bdata%5D=symbol"));
    }

    #[test]
    fn test_classify_body() {
        assert!(matches!(
            classify_body(Some("application/json"), "{}".into()),
            RawContent::Json(_)
        ));
        assert!(matches!(
            classify_body(Some("text/html"), "  {\"data\": []}".into()),
            RawContent::Json(_)
        ));
        assert!(matches!(
            classify_body(Some("text/html; charset=utf-8"), "<html></html>".into()),
            RawContent::Markup(_)
        ));
    }

    #[test]
    fn test_check_response_accepts_json() {
        let content = check_response(StatusCode::OK, Some("application/json"), r#"{"data": []}"#.into()).unwrap();
        assert!(matches!(content, RawContent::Json(_)));
    }

    #[test]
    fn test_check_response_non_2xx_is_blocked() {
        for status in [StatusCode::FORBIDDEN, StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE] {
            let err = check_response(status, Some("application/json"), "{}".into()).unwrap_err();
            assert!(matches!(err, FetchError::Blocked { strategy: StrategyKind::Primary, .. }));
        }
    }

    #[test]
    fn test_check_response_challenge_is_blocked() {
        let body = "<html><head><title>Just a moment...</title></head></html>".to_string();
        let err = check_response(StatusCode::OK, Some("text/html"), body).unwrap_err();
        assert!(matches!(err, FetchError::Blocked { ref reason, .. } if reason.contains("challenge")));
    }

    #[test]
    fn test_check_response_page_shell_is_blocked() {
        let shell = r#"<html><body><table id="ipo"><thead><tr><th>Company</th><th>Opening Date</th></tr></thead>
            <tbody></tbody></table></body></html>"#;
        let err = check_response(StatusCode::OK, Some("text/html; charset=utf-8"), shell.into()).unwrap_err();
        assert!(matches!(err, FetchError::Blocked { ref reason, .. } if reason.contains("HTML instead of JSON")));
    }

    #[test]
    fn test_transport_error_kinds() {
        let after = Duration::from_secs(30);
        assert!(matches!(
            transport_error(true, after, "operation timed out"),
            FetchError::Timeout { strategy: StrategyKind::Primary, after: a } if a == after
        ));
        assert!(matches!(
            transport_error(false, after, "connection reset"),
            FetchError::Network { ref message, .. } if message == "connection reset"
        ));
    }
}
