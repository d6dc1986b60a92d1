//! Batched multipart upload of a target file set.
//!
//! Large file sets are split into fixed-size batches and sent sequentially.
//! The backend returns an `upload_id` on the first batch; every later batch
//! echoes it so the server can assemble one file set. Progress is reported
//! as a fraction of completed batches over total batches.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::info;

use vericoach_common::protocol::UploadBatchResponse;

use crate::error::{ClientError, Result};
use crate::transport::{self, RunApi};

/// Files per multipart request. The backend rejects larger batches.
pub const UPLOAD_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Path relative to the target root, preserved on the server.
    pub relative_path: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Server-side path of the assembled file set; feeds `RunTarget::Upload`.
    pub path: String,
    pub count: u32,
    pub upload_id: Option<String>,
}

/// Sends one batch. Split out as a trait so the sequencing logic is
/// testable without HTTP.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send_batch(
        &self,
        files: &[UploadFile],
        upload_id: Option<&str>,
    ) -> Result<UploadBatchResponse>;
}

#[async_trait]
impl BatchSender for RunApi {
    async fn send_batch(
        &self,
        files: &[UploadFile],
        upload_id: Option<&str>,
    ) -> Result<UploadBatchResponse> {
        let url = format!("{}/upload", self.base_url());

        let mut form = Form::new();
        for file in files {
            form = form
                .part(
                    "files",
                    Part::bytes(file.contents.clone()).file_name(file.relative_path.clone()),
                )
                .text("paths", file.relative_path.clone());
        }
        if let Some(id) = upload_id {
            form = form.text("upload_id", id.to_string());
        }

        let resp = self.http().post(&url).multipart(form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: transport::extract_detail(&body, status),
            });
        }
        resp.json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }
}

/// Chunk the file list at the batch-size constant.
pub fn plan_batches(files: &[UploadFile]) -> Vec<&[UploadFile]> {
    files.chunks(UPLOAD_BATCH_SIZE).collect()
}

/// Cumulative progress in percent, weighting each batch equally.
pub fn cumulative_progress(completed_batches: usize, total_batches: usize, in_flight: f32) -> f32 {
    if total_batches == 0 {
        return 100.0;
    }
    ((completed_batches as f32 + in_flight.clamp(0.0, 1.0)) / total_batches as f32) * 100.0
}

/// Upload all files in sequential batches. Zero files resolves immediately
/// with count 0 and no network call.
pub async fn upload_files<S, F>(
    sender: &S,
    files: &[UploadFile],
    mut on_progress: F,
) -> Result<UploadOutcome>
where
    S: BatchSender + ?Sized,
    F: FnMut(f32) + Send,
{
    if files.is_empty() {
        return Ok(UploadOutcome {
            path: String::new(),
            count: 0,
            upload_id: None,
        });
    }

    let batches = plan_batches(files);
    let total = batches.len();
    info!(files = files.len(), batches = total, "Uploading target file set");

    let mut upload_id: Option<String> = None;
    let mut path = String::new();
    let mut count = 0u32;

    for (i, batch) in batches.into_iter().enumerate() {
        on_progress(cumulative_progress(i, total, 0.0));
        let resp = sender.send_batch(batch, upload_id.as_deref()).await?;
        count += resp.count;
        path = resp.path;
        // First batch mints the session id; later batches must echo it.
        if upload_id.is_none() {
            upload_id = Some(resp.upload_id);
        }
        on_progress(cumulative_progress(i + 1, total, 0.0));
    }

    Ok(UploadOutcome {
        path,
        count,
        upload_id,
    })
}
