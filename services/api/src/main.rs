//! API Service - Read-only price reports over HTTP
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /reports/top-operator - Operator with most stations of a kind
//! - GET /reports/cheapest - Cheapest station for a fuel in a province
//! - GET /reports/most-expensive - Most expensive station for a fuel and kind
//! - GET /reports/nearest - Cheapest station for a fuel within a radius

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use eess_core::reports::{DEFAULT_MAX_KM, GASOLEO_A};
use eess_core::telemetry::init_tracing;
use eess_core::{GeoPoint, PgReports, PriceReports, StationKind};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    reports: Arc<dyn PriceReports>,
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct KindQuery {
    kind: String,
}

#[derive(Deserialize)]
struct CheapestQuery {
    fuel: String,
    province: String,
}

#[derive(Deserialize)]
struct MostExpensiveQuery {
    fuel: String,
    kind: String,
}

#[derive(Deserialize)]
struct NearestQuery {
    lat: f64,
    lon: f64,
    fuel: Option<String>,
    max_km: Option<f64>,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn row_response<T: Serialize>(result: eess_core::Result<Option<T>>) -> Response {
    match result {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no matching station"),
        Err(e) => {
            error!(error = %e, "report query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn parse_kind(raw: &str) -> Result<StationKind, Response> {
    raw.parse()
        .map_err(|e: eess_core::EtlError| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn top_operator_handler(
    State(state): State<AppState>,
    Query(params): Query<KindQuery>,
) -> Response {
    let kind = match parse_kind(&params.kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    row_response(state.reports.top_operator(kind).await)
}

async fn cheapest_handler(
    State(state): State<AppState>,
    Query(params): Query<CheapestQuery>,
) -> Response {
    row_response(
        state
            .reports
            .cheapest_in_province(&params.fuel, &params.province)
            .await,
    )
}

async fn most_expensive_handler(
    State(state): State<AppState>,
    Query(params): Query<MostExpensiveQuery>,
) -> Response {
    let kind = match parse_kind(&params.kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    row_response(state.reports.most_expensive_by_kind(&params.fuel, kind).await)
}

async fn nearest_handler(
    State(state): State<AppState>,
    Query(params): Query<NearestQuery>,
) -> Response {
    let max_km = params.max_km.unwrap_or(DEFAULT_MAX_KM);
    if max_km.is_nan() || max_km < 0.0 {
        return error_response(StatusCode::BAD_REQUEST, "max_km must be a non-negative number");
    }
    let origin = GeoPoint {
        lat: params.lat,
        lon: params.lon,
    };
    let fuel = params.fuel.as_deref().unwrap_or(GASOLEO_A);
    row_response(state.reports.nearest_cheapest(origin, fuel, max_km).await)
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/reports/top-operator", get(top_operator_handler))
        .route("/reports/cheapest", get(cheapest_handler))
        .route("/reports/most-expensive", get(most_expensive_handler))
        .route("/reports/nearest", get(nearest_handler))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

async fn serve() -> anyhow::Result<()> {
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;
    info!("database connected");

    let state = AppState {
        reports: Arc::new(PgReports::new(pool)),
    };

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(%bind, "API listening");
    axum::serve(listener, app(state)).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let result = serve().await;
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "api failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::NaiveDate;
    use eess_core::source::parse_delimited;
    use eess_core::{ColumnLayout, Dataset};
    use tower::ServiceExt;

    const LAND_CSV: &str = include_str!("../../../crates/eess-core/tests/fixtures/precios_terrestres.csv");
    const MARITIME_CSV: &str =
        include_str!("../../../crates/eess-core/tests/fixtures/precios_maritimas.csv");

    fn test_app() -> Router {
        let at = NaiveDate::from_ymd_opt(2023, 11, 16)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let mut dataset = Dataset::new();
        dataset
            .ingest(&parse_delimited(LAND_CSV).unwrap(), &ColumnLayout::land(), at)
            .unwrap();
        dataset
            .ingest(
                &parse_delimited(MARITIME_CSV).unwrap(),
                &ColumnLayout::maritime(),
                at,
            )
            .unwrap();
        app(AppState {
            reports: Arc::new(dataset),
        })
    }

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        let response = test_app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_top_operator() {
        let (status, body) = get_json("/reports/top-operator?kind=Maritima").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["empresa"], "CEPSA");
        assert_eq!(body["total"], 2);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_bad_request() {
        let (status, body) = get_json("/reports/top-operator?kind=fluvial").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("fluvial"));
    }

    #[tokio::test]
    async fn test_cheapest() {
        let (status, body) =
            get_json("/reports/cheapest?fuel=Gasolina%2095%20E5&province=Madrid").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["empresa"], "REPSOL");
        assert_eq!(body["direccion"], "CALLE ALCALA, 100");
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let (status, _) = get_json("/reports/cheapest?fuel=Queroseno&province=Madrid").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_most_expensive() {
        let (status, body) =
            get_json("/reports/most-expensive?fuel=Gasolina%2095%20E5&kind=maritima").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provincia"], "Baleares");
    }

    #[tokio::test]
    async fn test_nearest_defaults_to_gasoleo_a() {
        let (status, body) = get_json("/reports/nearest?lat=38.994349&lon=-1.858542").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["empresa"], "BALLENOIL");
        assert!(body["distancia"].as_f64().unwrap() <= 10.0);
    }

    #[tokio::test]
    async fn test_nearest_missing_origin_is_rejected() {
        let (status, _) = get_json("/reports/nearest?fuel=Gas%C3%B3leo%20A").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
