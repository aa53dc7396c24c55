//! Webhook HTTP server handlers
//!
//! Implements the ValidatingAdmissionWebhook HTTP endpoints for PostgresCluster,
//! Snapshot and DormantDatabase resources.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::policies::{AdmissionOperation, ValidationContext, ValidationResult, validate_all};
use crate::cluster::ClusterKey;
use crate::cluster::ports::DormantStore;
use crate::controller::validation::validate_backend;
use crate::crd::{DormantDatabase, DormantPhase, PostgresCluster, Snapshot};
use crate::resources::catalog::KubeDormantStore;

/// Kubernetes AdmissionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub object: Option<serde_json::Value>,
    pub old_object: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

/// AdmissionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared state for webhook handlers
pub(crate) struct WebhookState {
    pub client: Client,
    dormant: KubeDormantStore,
}

impl WebhookState {
    pub fn new(client: Client) -> Self {
        Self {
            dormant: KubeDormantStore::new(client.clone()),
            client,
        }
    }
}

/// Create the webhook router
pub(crate) fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate", post(validate_postgres_cluster))
        .route("/validate-snapshot", post(validate_snapshot))
        .route("/validate-dormant", post(validate_dormant_database))
        .with_state(state)
}

type Reply = (StatusCode, Json<AdmissionReviewResponse>);

fn deny(uid: &str, result: ValidationResult) -> Reply {
    let reason = result
        .reason
        .unwrap_or_else(|| "ValidationFailed".to_string());
    let message = result
        .message
        .unwrap_or_else(|| "Validation failed".to_string());
    warn!(uid = %uid, reason = %reason, message = %message, "Admission request denied");
    (
        StatusCode::OK,
        Json(create_response(uid, false, &message, Some(&reason))),
    )
}

fn allow(uid: &str) -> Reply {
    info!(uid = %uid, "Admission request allowed");
    (StatusCode::OK, Json(create_response(uid, true, "", None)))
}

fn missing_request() -> Reply {
    error!("Admission review missing request");
    (
        StatusCode::BAD_REQUEST,
        Json(create_response(
            "",
            false,
            "Missing request in AdmissionReview",
            None,
        )),
    )
}

/// Parse the object under review. DELETE requests only carry the old object.
fn parse_objects<T: DeserializeOwned>(
    request: &AdmissionRequest,
) -> std::result::Result<(T, Option<T>), String> {
    let old: Option<T> = match &request.old_object {
        Some(obj) => Some(
            serde_json::from_value(obj.clone())
                .map_err(|e| format!("Failed to parse old object: {}", e))?,
        ),
        None => None,
    };
    let current = match (&request.object, request.operation.as_str()) {
        (Some(obj), _) if !obj.is_null() => serde_json::from_value(obj.clone())
            .map_err(|e| format!("Failed to parse object: {}", e))?,
        (_, "DELETE") => match &request.old_object {
            Some(obj) => serde_json::from_value(obj.clone())
                .map_err(|e| format!("Failed to parse old object: {}", e))?,
            None => return Err("Missing oldObject in DELETE request".to_string()),
        },
        _ => return Err("Missing object in request".to_string()),
    };
    Ok((current, old))
}

/// Validate PostgresCluster admission webhook handler
pub(crate) async fn validate_postgres_cluster(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let Some(request) = review.request else {
        return missing_request();
    };
    let uid = request.uid.clone();
    info!(
        uid = %uid,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    let Some(operation) = AdmissionOperation::parse(&request.operation) else {
        return allow(&uid);
    };

    let (cluster, old_cluster): (PostgresCluster, Option<PostgresCluster>) =
        match parse_objects(&request) {
            Ok(parsed) => parsed,
            Err(message) => {
                error!(uid = %uid, %message, "Failed to parse PostgresCluster");
                return (
                    StatusCode::OK,
                    Json(create_response(&uid, false, &message, None)),
                );
            }
        };
    let old_cluster = old_cluster.filter(|_| operation == AdmissionOperation::Update);

    // Get namespace labels for production policy
    let namespace_labels = match &request.namespace {
        Some(ns) => get_namespace_labels(&state.client, ns).await,
        None => BTreeMap::new(),
    };

    let dormant = match (&request.namespace, operation) {
        (Some(ns), AdmissionOperation::Create) => {
            let key = ClusterKey::new(ns, cluster.name_any());
            match state.dormant.get(&key).await {
                Ok(record) => record,
                Err(e) => {
                    // Fail open: the control loop repeats this check before resuming
                    warn!(cluster = %key, error = %e, "Failed to read dormant record");
                    None
                }
            }
        }
        _ => None,
    };

    let ctx = ValidationContext::new(operation, &cluster, old_cluster.as_ref(), namespace_labels)
        .with_dormant(dormant.as_ref());
    let result = validate_all(&ctx);
    if !result.allowed {
        return deny(&uid, result);
    }
    allow(&uid)
}

/// Snapshot specs are fixed once created and must name one usable backend
pub(crate) fn check_snapshot(snapshot: &Snapshot, old: Option<&Snapshot>) -> ValidationResult {
    if let Some(old) = old
        && old.spec != snapshot.spec
    {
        return ValidationResult::denied(
            "SnapshotSpecImmutable",
            "Snapshot spec cannot be changed after creation",
        );
    }
    if snapshot.spec.database_name.is_empty() {
        return ValidationResult::denied("ValidationFailed", "spec.databaseName is required");
    }
    match validate_backend("spec.storage", &snapshot.spec.storage) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error(&e),
    }
}

/// A dormant record's origin is fixed, and a wiped record cannot be un-wiped
pub(crate) fn check_dormant(
    dormant: &DormantDatabase,
    old: Option<&DormantDatabase>,
) -> ValidationResult {
    let Some(old) = old else {
        return ValidationResult::allowed();
    };
    if old.spec.origin != dormant.spec.origin {
        return ValidationResult::denied(
            "DormantOriginImmutable",
            "spec.origin of a DormantDatabase cannot be changed",
        );
    }
    let wiped = old
        .status
        .as_ref()
        .is_some_and(|s| s.phase == DormantPhase::WipedOut);
    if wiped && !dormant.spec.wipe_out {
        return ValidationResult::denied(
            "DormantAlreadyWipedOut",
            "the DormantDatabase has been wiped out; wipeOut cannot be unset",
        );
    }
    ValidationResult::allowed()
}

/// Validate Snapshot admission webhook handler
pub(crate) async fn validate_snapshot(
    State(_state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let Some(request) = review.request else {
        return missing_request();
    };
    let uid = request.uid.clone();
    if request.operation == "DELETE" {
        return allow(&uid);
    }
    match parse_objects::<Snapshot>(&request) {
        Ok((snapshot, old)) => {
            let result = check_snapshot(&snapshot, old.as_ref());
            if result.allowed {
                allow(&uid)
            } else {
                deny(&uid, result)
            }
        }
        Err(message) => (
            StatusCode::OK,
            Json(create_response(&uid, false, &message, None)),
        ),
    }
}

/// Validate DormantDatabase admission webhook handler
pub(crate) async fn validate_dormant_database(
    State(_state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let Some(request) = review.request else {
        return missing_request();
    };
    let uid = request.uid.clone();
    if request.operation != "UPDATE" {
        return allow(&uid);
    }
    match parse_objects::<DormantDatabase>(&request) {
        Ok((dormant, old)) => {
            let result = check_dormant(&dormant, old.as_ref());
            if result.allowed {
                allow(&uid)
            } else {
                deny(&uid, result)
            }
        }
        Err(message) => (
            StatusCode::OK,
            Json(create_response(&uid, false, &message, None)),
        ),
    }
}

/// Get namespace labels for policy decisions
async fn get_namespace_labels(client: &Client, namespace: &str) -> BTreeMap<String, String> {
    let ns_api: Api<Namespace> = Api::all(client.clone());

    match ns_api.get(namespace).await {
        Ok(ns) => ns.metadata.labels.unwrap_or_default(),
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "Failed to get namespace, using empty labels");
            BTreeMap::new()
        }
    }
}

/// Create an AdmissionReview response
fn create_response(
    uid: &str,
    allowed: bool,
    message: &str,
    reason: Option<&str>,
) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            status: if allowed {
                None
            } else {
                Some(AdmissionStatus {
                    code: 403,
                    message: message.to_string(),
                    reason: reason.map(String::from),
                })
            },
        },
    }
}

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:8443 and serves the /validate, /validate-snapshot and
/// /validate-dormant endpoints.
/// TLS certificates are loaded from the paths specified.
///
/// # Arguments
/// * `client` - Kubernetes client for looking up namespace labels
/// * `cert_path` - Path to TLS certificate file (PEM format)
/// * `key_path` - Path to TLS private key file (PEM format)
pub async fn run_webhook_server(
    client: Client,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let state = Arc::new(WebhookState::new(client));
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug)]
pub enum WebhookError {
    /// TLS configuration error
    TlsConfig(String),
    /// Server error
    Server(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::TlsConfig(msg) => write!(f, "TLS configuration error: {}", msg),
            WebhookError::Server(msg) => write!(f, "Webhook server error: {}", msg),
        }
    }
}

impl std::error::Error for WebhookError {}
