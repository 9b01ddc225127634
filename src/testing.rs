//! In-memory [`HtmlSource`] for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::crawler::{FetchError, HtmlSource, Page};

#[derive(Debug, Clone)]
enum Stub {
    Page { status: u16, body: String },
    Fail,
}

#[derive(Default)]
pub struct StubSource {
    stubs: HashMap<String, Stub>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    hits: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, body: &str) -> Self {
        self.page_with_status(url, 200, body)
    }

    pub fn page_with_status(mut self, url: &str, status: u16, body: &str) -> Self {
        self.stubs.insert(
            url.to_string(),
            Stub::Page {
                status,
                body: body.to_string(),
            },
        );
        self
    }

    pub fn fail(mut self, url: &str) -> Self {
        self.stubs.insert(url.to_string(), Stub::Fail);
        self
    }

    /// Delay applied to every URL without its own delay.
    pub fn delay(mut self, d: Duration) -> Self {
        self.default_delay = Some(d);
        self
    }

    pub fn delay_for(mut self, url: &str, d: Duration) -> Self {
        self.delays.insert(url.to_string(), d);
        self
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_hits(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HtmlSource for StubSource {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Page, FetchError> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        if let Some(d) = self.delays.get(url).copied().or(self.default_delay) {
            if d > timeout {
                tokio::time::sleep(timeout).await;
                return Err(FetchError::Timeout(timeout));
            }
            tokio::time::sleep(d).await;
        }

        match self.stubs.get(url) {
            Some(Stub::Page { status, body }) => Ok(Page {
                status: *status,
                final_url: url.to_string(),
                body: body.clone(),
            }),
            Some(Stub::Fail) => Err(FetchError::Browser("stubbed failure".to_string())),
            None => Ok(Page {
                status: 404,
                final_url: url.to_string(),
                body: String::new(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}
