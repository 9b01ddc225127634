use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::budget::Deadline;
use crate::config::PipelineConfig;
use crate::crawler::{FetchError, HtmlSource};
use crate::detail;
use crate::extract::discover;
use crate::listing::{rank, Listing};
use crate::normalize::normalize;
use crate::worker::run_pool;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("profile fetch failed: {0}")]
    Profile(#[source] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowsRequest {
    pub user: String,
    pub limit: usize,
    pub details: bool,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchingProfile,
    ExtractingListings,
    Enriching,
    Ranking,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::FetchingProfile => "fetching_profile",
            Stage::ExtractingListings => "extracting_listings",
            Stage::Enriching => "enriching",
            Stage::Ranking => "ranking",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

/// What one run produced. `stopped_at` is the stage the deadline cut short,
/// if it did.
#[derive(Debug, Clone)]
pub struct ShowsOutcome {
    pub shows: Vec<Listing>,
    pub stopped_at: Option<Stage>,
}

/// Profile page → listings → concurrent enrichment → ranking, once per request.
#[derive(Clone)]
pub struct Pipeline {
    cfg: Arc<PipelineConfig>,
    profile_source: Arc<dyn HtmlSource>,
    detail_source: Arc<dyn HtmlSource>,
}

impl Pipeline {
    pub fn new(
        cfg: Arc<PipelineConfig>,
        profile_source: Arc<dyn HtmlSource>,
        detail_source: Arc<dyn HtmlSource>,
    ) -> Self {
        Self {
            cfg,
            profile_source,
            detail_source,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub async fn run(&self, req: &ShowsRequest) -> Result<ShowsOutcome, PipelineError> {
        self.run_until(req, Deadline::after(self.cfg.request_budget)).await
    }

    pub async fn run_until(
        &self,
        req: &ShowsRequest,
        deadline: Deadline,
    ) -> Result<ShowsOutcome, PipelineError> {
        // FetchingProfile
        let url = self.cfg.profile_url(&req.user);
        info!(stage = %Stage::FetchingProfile, %url, source = self.profile_source.name(), "fetching profile");
        let timeout = deadline.clamp(self.cfg.profile_timeout);
        let page = match deadline.run(self.profile_source.fetch(&url, timeout)).await {
            Err(_) => return Ok(cut_short(Vec::new(), Stage::FetchingProfile)),
            Ok(Err(_)) if deadline.is_expired() => {
                return Ok(cut_short(Vec::new(), Stage::FetchingProfile))
            }
            Ok(Err(FetchError::DeadlineExceeded)) => {
                return Ok(cut_short(Vec::new(), Stage::FetchingProfile))
            }
            Ok(Err(e)) => return Err(PipelineError::Profile(e)),
            Ok(Ok(page)) => page,
        };
        tracing::debug!(final_url = %page.final_url, bytes = page.body.len(), "profile fetched");
        if !page.is_success() {
            warn!(status = page.status, %url, "profile page returned non-success status, extracting anyway");
        }

        // ExtractingListings
        let (candidates, strategy) = discover(&page.body, &self.cfg);
        let listings = normalize(&candidates, req.limit, Utc::now());
        info!(
            stage = %Stage::ExtractingListings,
            found = candidates.len(),
            kept = listings.len(),
            ?strategy,
            "extracted listings"
        );
        if deadline.is_expired() {
            return Ok(cut_short(listings, Stage::ExtractingListings));
        }

        // Enriching
        let mut stopped_at = None;
        let mut shows = if req.details && !listings.is_empty() {
            info!(stage = %Stage::Enriching, count = listings.len(), concurrency = req.concurrency, "enriching");
            let source = self.detail_source.clone();
            let cfg = self.cfg.clone();
            let worker_deadline = deadline.clone();
            let enriched = run_pool(listings, req.concurrency, &deadline, move |listing| {
                let source = source.clone();
                let cfg = cfg.clone();
                let deadline = worker_deadline.clone();
                async move { detail::enrich(source.as_ref(), &listing, &deadline, &cfg).await }
            })
            .await;
            if deadline.is_expired() {
                stopped_at = Some(Stage::Enriching);
            }
            enriched
        } else {
            listings
        };

        tracing::debug!(stage = %Stage::Ranking, "ranking");
        rank(&mut shows);
        info!(stage = %Stage::Done, shows = shows.len(), ?stopped_at, "pipeline finished");
        Ok(ShowsOutcome { shows, stopped_at })
    }
}

/// Deadline passed: emit what we have, ranked, and stop.
fn cut_short(mut shows: Vec<Listing>, stage: Stage) -> ShowsOutcome {
    warn!(%stage, shows = shows.len(), "deadline reached, returning partial results");
    rank(&mut shows);
    ShowsOutcome {
        shows,
        stopped_at: Some(stage),
    }
}
