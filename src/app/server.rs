use std::collections::HashMap;
use std::path::Path;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use super::generate::CameraType;
use super::model::sam::prompt::{BoxPrompt, PointPrompt, Prompt};
use super::pipeline::{Outcome, Pipeline, Segmented};
use super::threads::{self, image_loader::Image};
use crate::error::{Error, Result};
use crate::utils;

#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Pipeline,
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Every endpoint answers with this shape; failures are reported in-body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl ApiReply {
    fn ok() -> Self {
        ApiReply {
            status: Status::Ok,
            message: None,
            artifact_id: None,
            mask_base64: None,
            model_path: None,
            device: None,
        }
    }

    pub fn error(message: String) -> Self {
        ApiReply {
            status: Status::Error,
            message: Some(message),
            ..Self::ok()
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Validation(_) | Error::ArtifactNotFound(_) => warn!("request rejected: {self}"),
            _ => tracing::error!("request failed: {self}"),
        }
        Json(ApiReply::error(self.to_string())).into_response()
    }
}

pub fn router(state: ServerState, body_limit: usize) -> Router {
    let output = ServeDir::new(state.pipeline.store().root());

    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/generate", post(generate))
        .route("/encode", post(encode))
        .route("/artifacts/:id", delete(delete_artifact))
        .nest_service("/output", output)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Fields of a multipart upload.
///
/// `points` / `box` carry JSON. The flat `x`, `y`, `x1`, `y1`, `x2`, `y2`
/// fields older clients post are honoured when the JSON fields are absent.
#[derive(Debug, Default)]
pub struct UploadForm {
    file: Option<(String, Vec<u8>)>,
    points: Option<String>,
    bbox: Option<String>,
    camera_type: Option<String>,
    flat: HashMap<String, String>,
}

impl UploadForm {
    pub async fn read(multipart: std::result::Result<Multipart, MultipartRejection>) -> Result<Self> {
        let mut multipart =
            multipart.map_err(|e| Error::Validation(format!("expected a multipart form: {e}")))?;
        let mut form = UploadForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| Error::Validation(format!("malformed multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::Validation(format!("cannot read file: {e}")))?;
                form.file = Some((file_name, bytes.to_vec()));
                continue;
            }

            let text = field
                .text()
                .await
                .map_err(|e| Error::Validation(format!("cannot read field {name}: {e}")))?;
            match name.as_str() {
                "points" => form.points = Some(text),
                "box" => form.bbox = Some(text),
                "camera_type" => form.camera_type = Some(text),
                _ => {
                    form.flat.insert(name, text);
                }
            }
        }

        Ok(form)
    }

    pub fn image(&self) -> Result<Image> {
        let (name, bytes) = self
            .file
            .as_ref()
            .ok_or_else(|| Error::Validation("missing required field: file".into()))?;
        Image::from_bytes(bytes, name)
    }

    pub fn prompt(&self) -> Result<Prompt> {
        let mut points: Vec<PointPrompt> = match non_blank(&self.points) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| Error::Validation(format!("invalid points JSON: {e}")))?,
            None => Vec::new(),
        };
        let mut bbox: Option<BoxPrompt> = match non_blank(&self.bbox) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| Error::Validation(format!("invalid box JSON: {e}")))?,
            None => None,
        };

        if self.points.is_none() {
            if let [Some(x), Some(y)] = self.flat_numbers(["x", "y"])? {
                points.push(PointPrompt::positive(x, y));
            }
        }
        if self.bbox.is_none() {
            if let [Some(x1), Some(y1), Some(x2), Some(y2)] =
                self.flat_numbers(["x1", "y1", "x2", "y2"])?
            {
                bbox = Some(BoxPrompt::new(x1, y1, x2, y2));
            }
        }

        Prompt::new(points, bbox)
    }

    pub fn camera(&self) -> Result<CameraType> {
        match non_blank(&self.camera_type) {
            Some(raw) => CameraType::parse(raw),
            None => Ok(CameraType::default()),
        }
    }

    fn flat_numbers<const N: usize>(&self, keys: [&str; N]) -> Result<[Option<f32>; N]> {
        let mut out = [None; N];
        for (slot, key) in out.iter_mut().zip(keys) {
            if let Some(raw) = self.flat.get(key) {
                let v = raw
                    .trim()
                    .parse::<f32>()
                    .map_err(|_| Error::Validation(format!("field {key} is not a number: {raw:?}")))?;
                *slot = Some(v);
            }
        }
        Ok(out)
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// URL under the `/output` mount for a file inside the artifact root.
fn output_url(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("/output/{}", parts.join("/"))
}

async fn health(State(state): State<ServerState>) -> Json<ApiReply> {
    Json(ApiReply {
        device: Some(state.device.clone()),
        ..ApiReply::ok()
    })
}

async fn predict(
    State(state): State<ServerState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<ApiReply>> {
    let form = UploadForm::read(multipart).await?;
    let prompt = form.prompt()?;
    let img = threads::blocking(move || form.image()).await?;

    let Segmented { dir, overlay, .. } = state.pipeline.segment(img, prompt, None).await?;
    let mask_base64 =
        threads::blocking(move || utils::png_base64(&DynamicImage::ImageRgba8(overlay))).await?;

    Ok(Json(ApiReply {
        artifact_id: Some(dir.id().to_string()),
        mask_base64: Some(mask_base64),
        ..ApiReply::ok()
    }))
}

async fn generate(
    State(state): State<ServerState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<ApiReply>> {
    let form = UploadForm::read(multipart).await?;
    let prompt = form.prompt()?;
    let camera = form.camera()?;
    let img = threads::blocking(move || form.image()).await?;

    let outcome = state.pipeline.run(img, prompt, None, Some(camera)).await?;
    let Outcome::Completed { segmented, model } = outcome else {
        return Err(Error::Generation("generation stage was skipped".into()));
    };

    Ok(Json(ApiReply {
        artifact_id: Some(segmented.dir.id().to_string()),
        model_path: Some(output_url(state.pipeline.store().root(), &model)),
        ..ApiReply::ok()
    }))
}

/// Demo endpoint: draws a fixed frame, never touches the model.
async fn encode(multipart: std::result::Result<Multipart, MultipartRejection>) -> Result<Json<ApiReply>> {
    let form = UploadForm::read(multipart).await?;
    let mask_base64 = threads::blocking(move || {
        let framed = utils::demo_frame(&form.image()?.rgb());
        utils::png_base64(&DynamicImage::ImageRgba8(framed))
    })
    .await?;

    Ok(Json(ApiReply {
        message: Some("mask generated".into()),
        mask_base64: Some(mask_base64),
        ..ApiReply::ok()
    }))
}

async fn delete_artifact(
    State(state): State<ServerState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<ApiReply>> {
    state.pipeline.store().remove(&id)?;
    info!("artifact {id} deleted on request");

    Ok(Json(ApiReply {
        artifact_id: Some(id),
        ..ApiReply::ok()
    }))
}
