//! Admin API handlers.
//!
//! Bodies are JSON. A missing body or field is a 400 with
//! `{"error": "Missing parameters"}`; a failed transaction is a 500 with
//! the error message, matching what existing migration tooling expects.

use std::net::Ipv4Addr;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use steer_core::{MacAddr, NodeConfig};
use steer_forwarding::{ForwardingError, SwitchTables};
use tracing::{error, info, warn};

use crate::ApiState;

const MISSING_PARAMETERS: &str = "Missing parameters";

/// Handler failure, rendered as `{"error": msg}`.
#[derive(Debug)]
pub enum ApiError {
    MissingParameters,
    BadRequest(String),
    Forwarding(ForwardingError),
}

impl From<ForwardingError> for ApiError {
    fn from(e: ForwardingError) -> Self {
        ApiError::Forwarding(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::MissingParameters => (StatusCode::BAD_REQUEST, MISSING_PARAMETERS.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forwarding(e) => {
                if e.is_client_error() {
                    warn!(error = %e, "request rejected");
                } else {
                    error!(error = %e, "transaction failed");
                }
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn success() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

fn body<B>(req: Result<Json<B>, JsonRejection>) -> Result<B, ApiError> {
    req.map(|Json(b)| b).map_err(|_| ApiError::MissingParameters)
}

fn required<V>(value: Option<V>) -> Result<V, ApiError> {
    value.ok_or(ApiError::MissingParameters)
}

fn parse_ip(field: &str, value: &str) -> Result<Ipv4Addr, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{field}: '{value}' is not an IPv4 address")))
}

fn parse_mac(value: Option<&str>) -> Result<Option<MacAddr>, ApiError> {
    value
        .map(|m| m.parse::<MacAddr>().map_err(|e| ApiError::BadRequest(e.to_string())))
        .transpose()
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub old_ipv4: Option<String>,
    pub new_ipv4: Option<String>,
}

/// POST /migrateNode
pub async fn migrate_node<T: SwitchTables>(
    State(state): State<ApiState<T>>,
    req: Result<Json<MigrateRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(req)?;
    let old = parse_ip("old_ipv4", &required(req.old_ipv4)?)?;
    let new = parse_ip("new_ipv4", &required(req.new_ipv4)?)?;

    info!(%old, %new, "migrate requested");
    state.manager.lock().await.migrate(old, new).await?;
    Ok(success())
}

#[derive(Debug, Deserialize)]
pub struct UpdateForwardRequest {
    pub ipv4: Option<String>,
    pub sw_port: Option<u32>,
    pub mac: Option<String>,
}

/// POST /updateForward
pub async fn update_forward<T: SwitchTables>(
    State(state): State<ApiState<T>>,
    req: Result<Json<UpdateForwardRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(req)?;
    let ip = parse_ip("ipv4", &required(req.ipv4)?)?;
    let sw_port = required(req.sw_port)?;
    let mac = parse_mac(req.mac.as_deref())?;

    state.manager.lock().await.update_forward(ip, sw_port, mac).await?;
    Ok(success())
}

#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub ipv4: Option<String>,
    pub sw_port: Option<u32>,
    pub mac: Option<String>,
    #[serde(default)]
    pub is_lb_node: bool,
}

/// POST /addNode
pub async fn add_node<T: SwitchTables>(
    State(state): State<ApiState<T>>,
    req: Result<Json<AddNodeRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(req)?;
    let config = NodeConfig {
        ipv4: parse_ip("ipv4", &required(req.ipv4)?)?,
        sw_port: required(req.sw_port)?,
        mac: parse_mac(req.mac.as_deref())?,
        is_lb_node: req.is_lb_node,
    };

    let node = state.manager.lock().await.add_node(&config).await?;
    Ok(Json(json!({ "status": "success", "node": node })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveNodeRequest {
    pub ipv4: Option<String>,
}

/// POST /removeNode
pub async fn remove_node<T: SwitchTables>(
    State(state): State<ApiState<T>>,
    req: Result<Json<RemoveNodeRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(req)?;
    let ip = parse_ip("ipv4", &required(req.ipv4)?)?;

    state.manager.lock().await.remove_node(ip).await?;
    Ok(success())
}

/// POST /cleanup
pub async fn cleanup<T: SwitchTables>(State(state): State<ApiState<T>>) -> ApiResult {
    state.manager.lock().await.cleanup().await?;
    Ok(Json(json!({ "status": "success", "message": "Cleanup complete" })))
}

/// POST /reinitialize
pub async fn reinitialize<T: SwitchTables>(State(state): State<ApiState<T>>) -> ApiResult {
    state.manager.lock().await.reinitialize().await?;
    Ok(success())
}

/// GET /nodes
pub async fn list_nodes<T: SwitchTables>(State(state): State<ApiState<T>>) -> ApiResult {
    let snapshot = state.manager.lock().await.snapshot();
    Ok(Json(json!(snapshot)))
}

/// GET /verify
pub async fn verify<T: SwitchTables>(State(state): State<ApiState<T>>) -> ApiResult {
    let report = state.manager.lock().await.verify().await?;
    let consistent = report.is_consistent();
    Ok(Json(json!({ "consistent": consistent, "report": report })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_parameters_is_bad_request() {
        let resp = ApiError::MissingParameters.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn domain_errors_are_server_errors() {
        let resp = ApiError::from(ForwardingError::NotGroupMember(Ipv4Addr::new(10, 0, 0, 0))).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_address_names_the_field() {
        let err = parse_ip("old_ipv4", "10.0.0").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(msg) if msg.contains("old_ipv4")));
        assert_eq!(parse_ip("ipv4", " 10.0.0.1 ").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn optional_mac() {
        assert_eq!(parse_mac(None).unwrap(), None);
        assert!(parse_mac(Some("00:00:00:00:00:01")).unwrap().is_some());
        assert!(parse_mac(Some("nope")).is_err());
    }
}
