use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::Instrument;
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::listing::{Listing, Status};
use crate::normalize::{parse_flag, parse_positive};
use crate::pipeline::{Pipeline, ShowsRequest};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

/// Query parameters are taken as raw strings so bad values fall back to
/// defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ShowsQuery {
    /// Profile handle, defaults to `skycard`.
    pub user: Option<String>,
    /// How many listings to consider, positive integer, default 8.
    pub limit: Option<String>,
    /// Set to `false`/`0` to skip detail page enrichment.
    pub details: Option<String>,
    /// Worker count for enrichment, positive integer, default 4.
    pub concurrency: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ShowsResponse {
    pub user: String,
    pub shows: Vec<Listing>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(get_shows),
    components(schemas(ShowsResponse, ErrorResponse, Listing, Status)),
    tags((name = "shows", description = "Live show discovery"))
)]
pub struct ApiDoc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/shows", get(get_shows))
        .route("/health", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl ShowsQuery {
    fn into_request(self, state: &AppState) -> ShowsRequest {
        let cfg = state.pipeline.config();
        let user = self
            .user
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| cfg.default_user.clone());

        ShowsRequest {
            user,
            limit: parse_positive(self.limit.as_deref(), cfg.default_limit),
            details: parse_flag(self.details.as_deref(), true),
            concurrency: parse_positive(self.concurrency.as_deref(), cfg.default_concurrency),
        }
    }
}

#[utoipa::path(
    get,
    path = "/shows",
    params(ShowsQuery),
    responses(
        (status = 200, description = "Best-effort list of shows, possibly empty", body = ShowsResponse),
        (status = 500, description = "Profile page could not be fetched at all", body = ErrorResponse)
    ),
    tag = "shows"
)]
pub async fn get_shows(State(state): State<Arc<AppState>>, Query(query): Query<ShowsQuery>) -> Response {
    let req = query.into_request(&state);
    let span = tracing::info_span!("shows", user = %req.user, request_id = %Uuid::new_v4());

    match state.pipeline.run(&req).instrument(span).await {
        Ok(outcome) => Json(ShowsResponse {
            user: req.user,
            shows: outcome.shows,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(user = %req.user, error = %e, "profile fetch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
