use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::PipelineConfig;

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    ]
});

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125 Safari/537.36";

fn pick_user_agent() -> &'static str {
    use rand::seq::SliceRandom;
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_USER_AGENT)
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("pipeline deadline exceeded")]
    DeadlineExceeded,
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("browser error: {0}")]
    Browser(String),
}

/// Raw HTML as obtained from some source, before any extraction.
#[derive(Debug, Clone)]
pub struct Page {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

impl Page {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Anything that can turn a URL into HTML. Extraction never cares which one ran.
#[async_trait]
pub trait HtmlSource: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Page, FetchError>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// Plain HTTP
// ============================================================================

pub struct HttpSource {
    client: reqwest::Client,
    accept_language: String,
}

impl HttpSource {
    pub fn new(cfg: &PipelineConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            accept_language: cfg.accept_language.clone(),
        })
    }
}

#[async_trait]
impl HtmlSource for HttpSource {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Page, FetchError> {
        if timeout.is_zero() {
            return Err(FetchError::DeadlineExceeded);
        }

        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, pick_user_agent())
            .header(reqwest::header::ACCEPT_LANGUAGE, &self.accept_language)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.text().await.map_err(|e| classify(e, timeout))?;
        tracing::debug!(url, status, bytes = body.len(), "fetched page");

        Ok(Page {
            status,
            final_url,
            body,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Http(e)
    }
}

// ============================================================================
// Headless Chrome
// ============================================================================

/// Renders pages in headless Chrome for profiles whose listing cards only
/// appear after client-side hydration.
pub struct ChromeSource {
    wait_selector: String,
}

impl ChromeSource {
    pub fn new() -> Self {
        Self {
            wait_selector: r#"a[href*="/live/"]"#.to_string(),
        }
    }
}

impl Default for ChromeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HtmlSource for ChromeSource {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Page, FetchError> {
        if timeout.is_zero() {
            return Err(FetchError::DeadlineExceeded);
        }

        let url = url.to_string();
        let selector = self.wait_selector.clone();
        let stop = StopFlag::default();
        let render_stop = stop.clone();
        // Dropped on timeout, deadline or completion; the render sees it and bails.
        let _guard = stop.raise_on_drop();
        let render = tokio::task::spawn_blocking(move || {
            render_with_chrome(&url, &selector, timeout, &render_stop)
        });

        match tokio::time::timeout(timeout, render).await {
            Ok(Ok(result)) => result.map_err(|e| FetchError::Browser(e.to_string())),
            Ok(Err(join)) => Err(FetchError::Browser(join.to_string())),
            Err(_) => Err(FetchError::Timeout(timeout)),
        }
    }

    fn name(&self) -> &'static str {
        "chrome"
    }
}

/// Shared between the async caller and the blocking render.
#[derive(Debug, Clone, Default)]
struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn raise_on_drop(&self) -> RaiseOnDrop {
        RaiseOnDrop(self.clone())
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.is_raised() {
            anyhow::bail!("render abandoned by caller");
        }
        Ok(())
    }
}

struct RaiseOnDrop(StopFlag);

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        self.0.raise();
    }
}

const WAIT_SLICE: Duration = Duration::from_millis(250);

fn render_with_chrome(
    url: &str,
    wait_selector: &str,
    timeout: Duration,
    stop: &StopFlag,
) -> anyhow::Result<Page> {
    let ua_arg = format!("--user-agent={}", pick_user_agent());
    let args = vec![
        std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
        std::ffi::OsStr::new("--no-sandbox"),
        std::ffi::OsStr::new("--disable-setuid-sandbox"),
        std::ffi::OsStr::new("--disable-dev-shm-usage"),
        std::ffi::OsStr::new("--disable-gpu"),
        std::ffi::OsStr::new(&ua_arg),
    ];

    let browser = Browser::new(LaunchOptions {
        headless: true,
        window_size: Some((1280, 800)),
        idle_browser_timeout: timeout,
        args,
        ..Default::default()
    })?;

    stop.check()?;
    let tab = browser.new_tab()?;
    tab.set_default_timeout(timeout);
    tab.navigate_to(url)?;
    stop.check()?;

    // Cards may never show up (empty profile, bot wall); render what we have.
    let started = Instant::now();
    loop {
        let left = timeout.saturating_sub(started.elapsed());
        if left.is_zero() {
            tracing::debug!(url, "listing anchors did not appear");
            break;
        }
        if tab
            .wait_for_element_with_custom_timeout(wait_selector, left.min(WAIT_SLICE))
            .is_ok()
        {
            break;
        }
        stop.check()?;
    }
    stop.check()?;

    let body = tab.get_content()?;
    Ok(Page {
        status: 200,
        final_url: tab.get_url(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{headers, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source() -> HttpSource {
        HttpSource::new(&PipelineConfig::default()).expect("client")
    }

    #[tokio::test]
    async fn http_source_returns_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/skycard/shows"))
            .and(headers(
                "Accept-Language",
                vec!["de-DE", "de;q=0.9", "en-US;q=0.8", "en;q=0.7"],
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let url = format!("{}/user/skycard/shows", server.uri());
        let page = source().fetch(&url, Duration::from_secs(2)).await.expect("fetch");
        assert_eq!(page.status, 200);
        assert!(page.is_success());
        assert_eq!(page.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn every_request_carries_a_browser_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(3)
            .mount(&server)
            .await;

        let source = source();
        for _ in 0..3 {
            source
                .fetch(&server.uri(), Duration::from_secs(2))
                .await
                .expect("fetch");
        }

        let received = server.received_requests().await.expect("recording enabled");
        assert_eq!(received.len(), 3);
        for req in received {
            let ua = req
                .headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .expect("user-agent header");
            assert!(USER_AGENTS.iter().any(|known| *known == ua), "unexpected UA {ua}");
        }
    }

    #[tokio::test]
    async fn http_source_keeps_non_success_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("blocked"))
            .mount(&server)
            .await;

        let page = source()
            .fetch(&server.uri(), Duration::from_secs(2))
            .await
            .expect("fetch");
        assert_eq!(page.status, 403);
        assert!(!page.is_success());
        assert_eq!(page.body, "blocked");
    }

    #[tokio::test]
    async fn http_source_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let err = source()
            .fetch(&server.uri(), Duration::from_millis(100))
            .await
            .expect_err("should time out");
        assert!(matches!(err, FetchError::Timeout(_)), "got {err:?}");
    }

    #[test]
    fn stop_flag_is_raised_when_the_caller_lets_go() {
        let flag = StopFlag::default();
        let seen_by_render = flag.clone();
        assert!(seen_by_render.check().is_ok());
        {
            let _guard = flag.raise_on_drop();
            assert!(!seen_by_render.is_raised());
        }
        assert!(seen_by_render.is_raised());
        assert!(seen_by_render.check().is_err());
    }

    #[tokio::test]
    async fn zero_budget_never_touches_the_network() {
        let err = source()
            .fetch("http://127.0.0.1:9/never", Duration::ZERO)
            .await
            .expect_err("no budget");
        assert!(matches!(err, FetchError::DeadlineExceeded));
    }
}
