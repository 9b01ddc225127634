mod api;
mod budget;
mod config;
mod crawler;
mod detail;
mod extract;
mod listing;
mod normalize;
mod pipeline;
mod worker;

#[cfg(test)]
mod testing;

use dotenv::dotenv;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::crawler::{ChromeSource, HtmlSource, HttpSource};
use crate::pipeline::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Arc::new(PipelineConfig::from_env());
    tracing::info!(
        base_url = %cfg.base_url,
        budget_ms = cfg.request_budget.as_millis() as u64,
        use_chrome = cfg.use_chrome,
        "loaded config"
    );

    let http: Arc<dyn HtmlSource> = Arc::new(HttpSource::new(&cfg)?);
    let profile_source: Arc<dyn HtmlSource> = if cfg.use_chrome {
        Arc::new(ChromeSource::new())
    } else {
        http.clone()
    };

    let pipeline = Pipeline::new(cfg.clone(), profile_source, http);
    let app = api::router(Arc::new(api::AppState { pipeline }));

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("✅ Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
