//! Health and image endpoints

use axum::extract::Extension;
use axum::response::Json;

use super::schemas::ImageDto;
use super::{handle_error, ApiResult, AppState};

#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses((status = 200, description = "Component health"))
)]
pub async fn health_check(
    Extension(state): Extension<AppState>,
) -> Json<serde_json::Value> {
    Json(state.control.health())
}

#[utoipa::path(
    get,
    path = "/api/images",
    tag = "image",
    responses((status = 200, description = "Registered base images", body = [ImageDto]))
)]
pub async fn list_images(Extension(state): Extension<AppState>) -> ApiResult<Vec<ImageDto>> {
    let images = state.control.list_images().map_err(handle_error)?;
    Ok(Json(images.iter().map(ImageDto::from).collect()))
}
