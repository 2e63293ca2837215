//! REST + WebSocket API surface
//!
//! Thin request validators over `ControlPlane`: resolve, check the
//! generation, write desired state, enqueue reconciliation, answer 202 with
//! a status URL. Long-running verbs never block beyond the store commit.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::control::ControlPlane;
use crate::error::KestrelError;

pub mod console_ws;
pub mod disk;
pub mod docs;
pub mod health;
pub mod ip;
pub mod migrate;
pub mod schemas;
pub mod vm;
pub mod vpc;

use schemas::ErrorResponse;

/// Application state for the REST endpoints
#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the `/api` router plus the `/ws` console endpoint.
pub fn create_router(control: Arc<ControlPlane>) -> Router {
    let app_state = AppState { control };

    let api = Router::new()
        .route("/health", get(health::health_check))
        .route("/images", get(health::list_images))
        .route("/vpcs", get(vpc::list_vpcs).post(vpc::create_vpc))
        .route("/vpcs/:name", get(vpc::get_vpc).delete(vpc::delete_vpc))
        .route("/vpcs/:name/subnets", post(vpc::create_subnet))
        .route("/vpcs/:name/subnets/:subnet", delete(vpc::delete_subnet))
        .route(
            "/vpcs/:name/firewall-rules",
            get(vpc::list_firewall_rules).post(vpc::create_firewall_rule),
        )
        .route(
            "/vpcs/:name/firewall-rules/:rule",
            delete(vpc::delete_firewall_rule),
        )
        .route("/vms", get(vm::list_vms).post(vm::create_vm))
        .route("/vms/:id", get(vm::get_vm).delete(vm::terminate_vm_delete))
        .route("/vms/:id/start", post(vm::start_vm))
        .route("/vms/:id/stop", post(vm::stop_vm))
        .route("/vms/:id/restart", post(vm::restart_vm))
        .route("/vms/:id/terminate", post(vm::terminate_vm))
        .route("/vms/:id/resize", post(vm::resize_vm))
        .route("/vms/:id/status", get(vm::vm_status))
        .route("/vms/:id/metrics", get(vm::vm_metrics))
        .route("/vms/:id/serial-console", get(vm::serial_console))
        .route("/vms/:id/disks/attach", post(disk::attach_disk))
        .route("/vms/:id/disks/detach", post(disk::detach_disk))
        .route("/vms/:id/ips/attach", post(ip::attach_ip))
        .route("/vms/:id/ips/detach", post(ip::detach_ip))
        .route("/disks", get(disk::list_disks).post(disk::create_disk))
        .route("/disks/:id", delete(disk::delete_disk))
        .route("/disks/:id/resize", post(disk::resize_disk))
        .route("/ips", get(ip::list_ips).post(ip::create_ip))
        .route("/ips/:addr", delete(ip::delete_ip))
        .route(
            "/migrations",
            get(migrate::list_migrations).post(migrate::create_migration),
        )
        .route("/migrations/:vm/status", get(migrate::migration_status))
        .route("/migrations/:vm", delete(migrate::cancel_migration));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(console_ws::console_ws))
        .route("/openapi.json", get(docs::serve_openapi))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(Extension(app_state)),
        )
}

/// Map a control-plane error onto the wire: stable code, spec HTTP status.
pub fn handle_error(error: KestrelError) -> ApiError {
    let status = match error.code() {
        "validation" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" => StatusCode::CONFLICT,
        "exhausted" => StatusCode::INSUFFICIENT_STORAGE,
        "driver_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "driver_timeout" => StatusCode::GATEWAY_TIMEOUT,
        "driver_terminal" => StatusCode::INTERNAL_SERVER_ERROR,
        "storage_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "unsupported_arch" => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        code: error.code().to_string(),
        message: error.to_string(),
        details: None,
    };
    (status, Json(body))
}

/// Serve the API until shutdown flips.
pub async fn serve(
    control: Arc<ControlPlane>,
    listen: &str,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::error::KestrelResult<()> {
    let router = create_router(control);
    let listener = tokio::net::TcpListener::bind(listen).await.map_err(|e| {
        KestrelError::Internal {
            message: format!("failed to bind {}: {}", listen, e),
        }
    })?;
    tracing::info!(listen, "API server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| KestrelError::Internal {
            message: format!("API server error: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_follows_the_contract() {
        let cases = [
            (KestrelError::validation("x", "y"), StatusCode::BAD_REQUEST),
            (KestrelError::not_found("x"), StatusCode::NOT_FOUND),
            (
                KestrelError::conflict("x", "y"),
                StatusCode::CONFLICT,
            ),
            (
                KestrelError::Exhausted {
                    resource: "pool".into(),
                },
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                KestrelError::DriverUnavailable {
                    host: "h".into(),
                    message: "m".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                KestrelError::DriverTimeout {
                    verb: "start".into(),
                    duration: std::time::Duration::from_secs(30),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                KestrelError::UnsupportedArch { arch: "mips".into() },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (error, expected) in cases {
            let (status, body) = handle_error(error);
            assert_eq!(status, expected);
            assert!(!body.0.code.is_empty());
        }
    }
}
