use std::env;
use std::time::Duration;

/// Every knob the pipeline reads. Built once at startup from the environment
/// and shared read-only with each request; tests construct it directly.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Site origin, e.g. `https://www.whatnot.com`. No trailing slash.
    pub base_url: String,
    pub default_user: String,
    pub default_limit: usize,
    pub default_concurrency: usize,
    /// Wall-clock budget for one whole request.
    pub request_budget: Duration,
    /// Ceiling for the profile page fetch (clamped by the remaining budget).
    pub profile_timeout: Duration,
    /// Ceiling for each detail page fetch (clamped by the remaining budget).
    pub detail_timeout: Duration,
    pub max_pattern_listings: usize,
    /// Upper bound on JSON nodes visited during a generic walk.
    pub max_walk_nodes: usize,
    pub placeholder_title: String,
    pub accept_language: String,
    pub use_chrome: bool,
    pub port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.whatnot.com".to_string(),
            default_user: "skycard".to_string(),
            default_limit: 8,
            default_concurrency: 4,
            request_budget: Duration::from_millis(9_000),
            profile_timeout: Duration::from_millis(8_000),
            detail_timeout: Duration::from_millis(3_500),
            max_pattern_listings: 12,
            max_walk_nodes: 50_000,
            placeholder_title: "Whatnot Show".to_string(),
            accept_language: "de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            use_chrome: false,
            port: 3000,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_url = env::var("SHOWS_BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);
        let default_user = env::var("SHOWS_DEFAULT_USER").unwrap_or(defaults.default_user);

        Self {
            base_url,
            default_user,
            request_budget: env_millis("SHOWS_REQUEST_BUDGET_MS").unwrap_or(defaults.request_budget),
            profile_timeout: env_millis("SHOWS_PROFILE_TIMEOUT_MS")
                .unwrap_or(defaults.profile_timeout),
            detail_timeout: env_millis("SHOWS_DETAIL_TIMEOUT_MS").unwrap_or(defaults.detail_timeout),
            use_chrome: env::var("SHOWS_USE_CHROME")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.use_chrome),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            ..defaults
        }
    }

    pub fn profile_url(&self, user: &str) -> String {
        format!("{}/user/{}/shows", self.base_url, urlencoding::encode(user))
    }

    /// Host detail pages live on, scheme ignored.
    pub fn site_host(&self) -> Option<String> {
        reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
