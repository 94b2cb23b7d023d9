//! # Transcription Endpoint
//!
//! `POST /transcribe` turns one uploaded audio file into text.
//!
//! ## Request Flow:
//! 1. Read the multipart `file` field into memory; reject missing or empty
//!    uploads before any model interaction
//! 2. Stage the bytes under a uniquely-named scratch directory
//! 3. Obtain the engine handle (first caller pays for initialization)
//! 4. Transcribe, join the trimmed segments, respond with language metadata
//!
//! The scratch directory is removed on every exit path, including handler
//! errors and client disconnects; removal failures are suppressed.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::{Segment, TranscriptionOutput};
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Beam width used for every transcription.
const BEAM_SIZE: usize = 5;

const SCRATCH_PREFIX: &str = "whisper-gateway-";

struct Upload {
    filename: String,
    data: Vec<u8>,
}

pub async fn transcribe(
    state: web::Data<AppState>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let upload = read_upload(payload)
        .await?
        .ok_or_else(|| AppError::BadRequest("Missing audio file.".to_string()))?;
    if upload.data.is_empty() {
        return Err(AppError::BadRequest("Empty audio file.".to_string()));
    }

    state.transcription_started();
    let result = run_transcription(&state, &upload).await;
    state.transcription_finished();
    let output = result?;

    Ok(HttpResponse::Ok().json(json!({
        "text": join_segments(&output.segments),
        "language": output.language,
        "language_probability": output.language_probability,
    })))
}

async fn run_transcription(
    state: &AppState,
    upload: &Upload,
) -> AppResult<TranscriptionOutput> {
    // The TempDir guard removes the directory and its contents when dropped,
    // which covers the error returns below and future cancellation.
    let (scratch, audio_path) = stage_upload(&upload.filename, &upload.data).await?;

    let model = state.model().await?;
    debug!(
        "Transcribing '{}' with model '{}' ({})",
        upload.filename,
        model.model_id(),
        model.compute_type()
    );
    let output = model
        .transcribe(&audio_path, state.forced_language(), BEAM_SIZE)
        .await?;

    if let Err(e) = scratch.close() {
        debug!("Failed to remove scratch directory: {}", e);
    }
    Ok(output)
}

/// Pull the `file` field out of the multipart stream.
///
/// Other fields are drained and ignored. `Ok(None)` means the payload had
/// no `file` field at all.
async fn read_upload(mut payload: Multipart) -> AppResult<Option<Upload>> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart payload: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(sanitize_filename)
            .unwrap_or_else(|| "upload.wav".to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?
        {
            data.extend_from_slice(&chunk);
        }

        return Ok(Some(Upload { filename, data }));
    }
    Ok(None)
}

/// Keep only the final path component of a client-supplied filename.
fn sanitize_filename(name: &str) -> String {
    match Path::new(name).file_name().and_then(|n| n.to_str()) {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => "upload.wav".to_string(),
    }
}

/// Write the upload into a fresh scratch directory.
///
/// Returns the directory guard together with the file path; the file and
/// directory disappear when the guard is dropped or closed.
async fn stage_upload(filename: &str, data: &[u8]) -> AppResult<(TempDir, PathBuf)> {
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir()
        .map_err(|e| AppError::Internal(format!("Failed to create scratch directory: {}", e)))?;

    let path = scratch.path().join(filename);
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to stage upload: {}", e)))?;

    Ok((scratch, path))
}

/// Trim each segment and join with single spaces.
pub fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    fn segment(text: &str) -> Segment {
        Segment {
            start: 0.0,
            end: 1.0,
            text: text.to_string(),
        }
    }

    #[::core::prelude::v1::test]
    fn test_join_segments_trims_and_spaces() {
        let segments = vec![segment("  hello "), segment("world  ")];
        assert_eq!(join_segments(&segments), "hello world");
    }

    #[::core::prelude::v1::test]
    fn test_join_segments_skips_blank_segments() {
        let segments = vec![segment("one"), segment("   "), segment("two")];
        assert_eq!(join_segments(&segments), "one two");
        assert_eq!(join_segments(&[]), "");
    }

    #[::core::prelude::v1::test]
    fn test_sanitize_filename_strips_directories() {
        assert_eq!(sanitize_filename("clip.wav"), "clip.wav");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(""), "upload.wav");
    }

    #[tokio::test]
    async fn test_staged_upload_is_removed_with_its_directory() {
        let (scratch, path) = stage_upload("clip.wav", b"RIFF....").await.unwrap();
        let dir = scratch.path().to_path_buf();
        assert!(path.exists());
        assert!(dir.exists());

        scratch.close().unwrap();
        assert!(!path.exists());
        assert!(!dir.exists());
    }

    const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";

    fn multipart_body(parts: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                    name, filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    async fn post_multipart(
        state: AppState,
        parts: &[(&str, &str, &[u8])],
    ) -> (u16, serde_json::Value) {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/transcribe", web::post().to(transcribe)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart_body(parts))
            .to_request();

        let resp = test::call_service(&app, req).await;
        let status = resp.status().as_u16();
        let body: serde_json::Value = test::read_body_json(resp).await;
        (status, body)
    }

    #[actix_web::test]
    async fn test_missing_file_field_is_a_client_error() {
        let state = AppState::new(AppConfig::default()).unwrap();

        let (status, body) =
            post_multipart(state.clone(), &[("other", "notes.txt", b"hello")]).await;

        assert_eq!(status, 400);
        assert_eq!(body["detail"], "Missing audio file.");
        // Validation failed before any engine interaction
        assert!(!state.provider().initialized().await);
    }

    #[actix_web::test]
    async fn test_empty_upload_is_a_client_error() {
        let state = AppState::new(AppConfig::default()).unwrap();

        let (status, body) = post_multipart(state.clone(), &[("file", "clip.wav", b"")]).await;

        assert_eq!(status, 400);
        assert_eq!(body["detail"], "Empty audio file.");
        assert!(!state.provider().initialized().await);
    }
}
