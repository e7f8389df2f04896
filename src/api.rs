use crate::access_policy::AccessPolicy;
use crate::asset_store::{Asset, AssetStore, NewAsset, NewVariation};
use crate::config::ApiConfig;
use crate::error::DeliveryError;
use crate::object_storage::ObjectStorage;
use crate::visit_ledger::{VisitIdentity, VisitKind, VisitLedger};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AssetStore>,
    pub ledger: Arc<VisitLedger>,
    pub storage: Arc<ObjectStorage>,
    pub access: Arc<dyn AccessPolicy>,
    pub trust_forwarded_for: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a domain error onto the wire.
///
/// Paywall rejections arrive here already collapsed into `NotFound`, so a
/// paywalled asset and an absent one produce byte-identical responses.
fn api_error(err: DeliveryError) -> ApiError {
    let status = match &err {
        DeliveryError::NotFound => StatusCode::NOT_FOUND,
        DeliveryError::StorageUnavailable(_) => StatusCode::BAD_GATEWAY,
        DeliveryError::DataIntegrity(_) | DeliveryError::Database(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    let message = match &err {
        DeliveryError::NotFound => "Not found".to_string(),
        DeliveryError::StorageUnavailable(_) => "Storage backend unavailable".to_string(),
        DeliveryError::DataIntegrity(_) | DeliveryError::Database(_) => {
            "Internal server error".to_string()
        }
    };

    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }

    (
        status,
        Json(ErrorResponse {
            error: message,
            code: err.code().to_string(),
        }),
    )
}

/// The requester as seen at the service boundary: an upstream auth proxy
/// sets `x-user-id` for authenticated requests, anonymous requests are
/// identified by client IP.
#[derive(Debug, Clone, Copy)]
pub struct Requester {
    pub user_id: Option<i64>,
    pub client_ip: IpAddr,
}

impl Requester {
    pub fn from_request(
        headers: &HeaderMap,
        remote: SocketAddr,
        trust_forwarded_for: bool,
    ) -> Self {
        let user_id = headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        Self {
            user_id,
            client_ip: client_ip(headers, remote.ip(), trust_forwarded_for),
        }
    }

    /// Visit identity: user ID when authenticated, IP otherwise.
    pub fn identity(&self) -> VisitIdentity {
        match self.user_id {
            Some(user_id) => VisitIdentity::User(user_id),
            None => VisitIdentity::Anonymous(self.client_ip),
        }
    }
}

/// Resolve the client IP, preferring the first `X-Forwarded-For` entry when
/// the deployment trusts its proxy. Entries that do not parse as an IP are
/// ignored in favor of the socket peer address.
fn client_ip(headers: &HeaderMap, remote: IpAddr, trust_forwarded_for: bool) -> IpAddr {
    if !trust_forwarded_for {
        return remote;
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(remote)
}

/// Asset metadata in API responses
#[derive(Debug, Serialize)]
pub struct AssetResponse {
    pub id: i64,
    pub source_type: String,
    pub original_filename: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub thumbnail: String,
    pub view_count: i64,
    pub download_count: i64,
    /// Service-relative download path, empty when no source is resolvable
    pub download_url: String,
    pub date_created: DateTime<Utc>,
}

impl AssetResponse {
    fn from_asset(asset: Asset, download_source: Option<String>) -> Self {
        Self {
            id: asset.id,
            source_type: asset.source_type,
            original_filename: asset.original_filename,
            size_bytes: asset.size_bytes,
            content_type: asset.content_type,
            thumbnail: asset.thumbnail,
            view_count: asset.view_count,
            download_count: asset.download_count,
            download_url: download_source
                .map(|source| format!("/download-source/{}", source))
                .unwrap_or_default(),
            date_created: asset.date_created,
        }
    }
}

/// Variation metadata in API responses
#[derive(Debug, Serialize)]
pub struct VariationResponse {
    pub id: i64,
    pub resolution_label: String,
    pub source: String,
    pub size_bytes: i64,
    pub content_type: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/assets", post(create_asset))
        .route("/api/v1/assets/:asset_id", get(get_asset))
        .route("/api/v1/assets/:asset_id/variations", post(add_variation))
        .route("/api/v1/assets/:asset_id/views", post(record_view))
        .route("/download-source/*source", get(download_source))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "asset-delivery-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Register an asset after upload completion
#[instrument(skip(state, new))]
async fn create_asset(
    State(state): State<AppState>,
    Json(new): Json<NewAsset>,
) -> Result<(StatusCode, Json<AssetResponse>), ApiError> {
    let asset = state.store.create_asset(&new).await.map_err(api_error)?;
    let download_source = state
        .store
        .resolve_download_source(&asset)
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(AssetResponse::from_asset(asset, download_source)),
    ))
}

/// Get asset metadata, including the resolver-derived download path
#[instrument(skip(state))]
async fn get_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<i64>,
) -> Result<Json<AssetResponse>, ApiError> {
    let asset = state
        .store
        .get_asset(asset_id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(DeliveryError::NotFound))?;

    let download_source = state
        .store
        .resolve_download_source(&asset)
        .await
        .map_err(api_error)?;

    Ok(Json(AssetResponse::from_asset(asset, download_source)))
}

/// Register a transcoded rendition (transcoding webhook entry point)
#[instrument(skip(state, new))]
async fn add_variation(
    State(state): State<AppState>,
    Path(asset_id): Path<i64>,
    Json(new): Json<NewVariation>,
) -> Result<(StatusCode, Json<VariationResponse>), ApiError> {
    let variation = state
        .store
        .add_variation(asset_id, &new)
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(VariationResponse {
            id: variation.id,
            resolution_label: variation.resolution_label,
            source: variation.source,
            size_bytes: variation.size_bytes,
            content_type: variation.content_type,
        }),
    ))
}

/// Record a page view of an asset (called by the server-rendered frontends)
#[instrument(skip(state, headers))]
async fn record_view(
    State(state): State<AppState>,
    Path(asset_id): Path<i64>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .get_asset(asset_id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(DeliveryError::NotFound))?;

    let requester = Requester::from_request(&headers, remote, state.trust_forwarded_for);
    state
        .ledger
        .record_visit(VisitKind::View, asset_id, requester.identity())
        .await
        .map_err(api_error)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Download gate: authorize, record the visit, redirect to a signed URL.
///
/// Unauthorized paywalled requests get the same 404 as requests for paths
/// that do not exist, so clients cannot probe for paywalled content.
#[instrument(skip(state, headers), fields(source = %source))]
async fn download_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let asset = state
        .store
        .find_asset_by_source(&source)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(DeliveryError::NotFound))?;

    let download_source = state
        .store
        .resolve_download_source(&asset)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(DeliveryError::NotFound))?;

    let requester = Requester::from_request(&headers, remote, state.trust_forwarded_for);
    let allowed = authorize_download(state.access.as_ref(), asset.id, &requester)
        .await
        .map_err(api_error)?;
    if !allowed {
        return Err(api_error(DeliveryError::NotFound));
    }

    state
        .ledger
        .record_visit(VisitKind::Download, asset.id, requester.identity())
        .await
        .map_err(api_error)?;

    let signed_url = state
        .storage
        .presign_download(&download_source)
        .await
        .map_err(api_error)?;

    info!(asset_id = asset.id, "Download redirect issued");
    metrics::counter!("downloads.redirected").increment(1);

    Ok((StatusCode::FOUND, [(header::LOCATION, signed_url)]))
}

/// Paywall check: free assets are open to everyone, everything else needs an
/// authenticated requester with an active subscription.
async fn authorize_download(
    access: &dyn AccessPolicy,
    asset_id: i64,
    requester: &Requester,
) -> Result<bool, DeliveryError> {
    if access.is_free(asset_id).await? {
        return Ok(true);
    }

    match requester.user_id {
        Some(user_id) => access.has_active_subscription(user_id).await,
        None => Ok(false),
    }
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> anyhow::Result<()> {
    use anyhow::Context;

    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_policy::MockAccessPolicy;

    fn remote() -> SocketAddr {
        "10.0.0.9:55000".parse().unwrap()
    }

    fn anonymous() -> Requester {
        Requester {
            user_id: None,
            client_ip: "1.2.3.4".parse().unwrap(),
        }
    }

    fn user(user_id: i64) -> Requester {
        Requester {
            user_id: Some(user_id),
            client_ip: "1.2.3.4".parse().unwrap(),
        }
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().unwrap());
        assert_eq!(
            client_ip(&headers, remote().ip(), true),
            "1.2.3.4".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_ignores_garbage_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(client_ip(&headers, remote().ip(), true), remote().ip());
    }

    #[test]
    fn test_client_ip_untrusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        assert_eq!(client_ip(&headers, remote().ip(), false), remote().ip());
    }

    #[test]
    fn test_requester_identity_prefers_user() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "42".parse().unwrap());
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());

        let requester = Requester::from_request(&headers, remote(), true);
        assert_eq!(requester.identity(), VisitIdentity::User(42));
    }

    #[test]
    fn test_requester_identity_anonymous_by_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());

        let requester = Requester::from_request(&headers, remote(), true);
        assert_eq!(
            requester.identity(),
            VisitIdentity::Anonymous("1.2.3.4".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_authorize_free_asset_open_to_anonymous() {
        let mut access = MockAccessPolicy::new();
        access.expect_is_free().returning(|_| Ok(true));

        assert!(authorize_download(&access, 42, &anonymous()).await.unwrap());
    }

    #[tokio::test]
    async fn test_authorize_paywalled_denies_anonymous() {
        let mut access = MockAccessPolicy::new();
        access.expect_is_free().returning(|_| Ok(false));

        assert!(!authorize_download(&access, 42, &anonymous()).await.unwrap());
    }

    #[tokio::test]
    async fn test_authorize_paywalled_denies_unsubscribed_user() {
        let mut access = MockAccessPolicy::new();
        access.expect_is_free().returning(|_| Ok(false));
        access
            .expect_has_active_subscription()
            .returning(|_| Ok(false));

        assert!(!authorize_download(&access, 42, &user(7)).await.unwrap());
    }

    #[tokio::test]
    async fn test_authorize_paywalled_allows_subscriber() {
        let mut access = MockAccessPolicy::new();
        access.expect_is_free().returning(|_| Ok(false));
        access
            .expect_has_active_subscription()
            .returning(|user_id| Ok(user_id == 7));

        assert!(authorize_download(&access, 42, &user(7)).await.unwrap());
    }

    #[test]
    fn test_paywall_and_missing_are_indistinguishable() {
        // The gate maps both cases through the same NotFound error, so the
        // status and body must match exactly.
        let (missing_status, Json(missing_body)) = api_error(DeliveryError::NotFound);
        let (paywalled_status, Json(paywalled_body)) = api_error(DeliveryError::NotFound);

        assert_eq!(missing_status, StatusCode::NOT_FOUND);
        assert_eq!(missing_status, paywalled_status);
        assert_eq!(
            serde_json::to_string(&missing_body).unwrap(),
            serde_json::to_string(&paywalled_body).unwrap()
        );
    }

    #[test]
    fn test_integrity_fault_is_not_a_404() {
        let (status, Json(body)) =
            api_error(DeliveryError::DataIntegrity("asset 1".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code, "INTEGRITY_ERROR");
    }

    #[test]
    fn test_storage_failure_is_retryable_5xx() {
        let (status, Json(body)) =
            api_error(DeliveryError::StorageUnavailable("timeout".to_string()));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.code, "STORAGE_ERROR");
    }

    #[test]
    fn test_download_url_path() {
        let asset = Asset {
            id: 42,
            source: "orig.mp4".to_string(),
            source_type: "video".to_string(),
            original_filename: "orig.mp4".to_string(),
            size_bytes: 1,
            content_type: "video/mp4".to_string(),
            thumbnail: String::new(),
            view_count: 3,
            download_count: 1,
            date_created: Utc::now(),
            date_updated: Utc::now(),
        };

        let response = AssetResponse::from_asset(asset.clone(), Some("orig.mp4".to_string()));
        assert_eq!(response.download_url, "/download-source/orig.mp4");

        let response = AssetResponse::from_asset(asset, None);
        assert_eq!(response.download_url, "");
    }
}
