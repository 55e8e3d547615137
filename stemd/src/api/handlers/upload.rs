use crate::AppState;
use crate::api::models::upload::UploadResponse;
use crate::errors::{Error, Result};
use crate::uploads::StoredUpload;
use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
};
use tracing::{debug, info, instrument};

/// Name of the multipart field carrying the audio file.
pub const FILE_FIELD: &str = "file";

/// Store an uploaded audio file and run the separation tool on it.
///
/// The file is stored first, then the request waits for a separation slot. Responds once the
/// tool has exited: 200 with the tool's stdout on success, 500 with a generic error otherwise.
/// The stored file and whatever the tool produced are left on disk.
#[instrument(skip_all)]
pub async fn upload_file(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>> {
    let mut multipart = multipart.map_err(|e| Error::BadRequest {
        message: format!("Expected a multipart/form-data body: {}", e.body_text()),
    })?;

    let mut upload: Option<StoredUpload> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::BadRequest {
        message: format!("Failed to parse multipart data: {}", e),
    })? {
        let field_name = field.name().unwrap_or("").to_string();

        if field_name != FILE_FIELD {
            debug!(field = %field_name, "Ignoring multipart field");
            continue;
        }

        if upload.is_some() {
            return Err(Error::BadRequest {
                message: "Only one file may be uploaded per request".to_string(),
            });
        }
        upload = Some(state.uploads.persist(field).await?);
    }

    let upload = upload.ok_or_else(|| Error::BadRequest {
        message: "No file uploaded".to_string(),
    })?;

    info!(
        upload_id = %upload.id,
        filename = ?upload.original_name,
        bytes = upload.bytes,
        "Upload ready for separation"
    );

    // Only the tool run takes a slot; a rejected request keeps its stored upload
    let _permit = match &state.limiter {
        Some(limiter) => Some(limiter.acquire().await?),
        None => None,
    };

    let output = state.separator.separate(&upload.path).await?;

    info!(upload_id = %upload.id, stems_dir = ?output.stems_dir, "Separation output: {}", output.stdout);
    info!(upload_id = %upload.id, "Separation stderr: {}", output.stderr);

    Ok(Json(UploadResponse::processed(output.stdout)))
}
