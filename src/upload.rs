//! `POST /upload` 处理器：读取表单、认证、准入检查并提交文件。

use axum::extract::{Extension, Multipart};
use axum::extract::multipart::Field;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::auth::{AuthenticatedToken, ClientIdentity, authenticate};
use crate::commit::UploadCommitPipeline;
use crate::error::ApiError;
use crate::tokens::{TokenStore, token_prefix};
use crate::tracker::ConnectionTracker;

#[derive(Serialize)]
pub struct UploadedResponse {
    ok: bool,
    path: String,
}

struct FilePart {
    filename: Option<String>,
    content: Vec<u8>,
}

/// 处理单文件上传，返回文件的公开访问路径。
pub async fn handle_upload(
    Extension(tokens): Extension<Arc<TokenStore>>,
    Extension(tracker): Extension<ConnectionTracker>,
    Extension(admission): Extension<Arc<AdmissionController>>,
    Extension(pipeline): Extension<Arc<UploadCommitPipeline>>,
    Extension(ClientIdentity(identity)): Extension<ClientIdentity>,
    authenticated: Option<Extension<AuthenticatedToken>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadedResponse>, ApiError> {
    // Keep one byte past the limit so the pipeline can see the overflow.
    let buffer_limit = pipeline.max_upload_size().saturating_add(1);
    let mut token = authenticated.map(|Extension(AuthenticatedToken(token))| token);
    let mut file = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("token") if token.is_none() => {
                let candidate = field.text().await?;
                token = Some(authenticate(&tokens, &tracker, identity, Some(candidate)).await?);
            }
            Some("file") if file.is_none() => {
                // Nothing is buffered for a client that has not authenticated yet.
                if token.is_none() {
                    token = Some(authenticate(&tokens, &tracker, identity, None).await?);
                }
                let filename = field.file_name().map(str::to_owned);
                let content = read_capped(field, buffer_limit).await?;
                file = Some(FilePart { filename, content });
            }
            name => debug!(field = name.unwrap_or(""), "ignoring form field"),
        }
    }

    let token = match token {
        Some(token) => token,
        None => authenticate(&tokens, &tracker, identity, None).await?,
    };
    let prefix = token_prefix(&token);
    let FilePart { filename, content } =
        file.ok_or_else(|| ApiError::BadRequest("missing form field \"file\"".into()))?;

    let directory = pipeline.ensure_dir(&token).await.map_err(|err| {
        error!(token = prefix, error = %err, "failed to create upload directory for the given token");
        ApiError::Internal(err.to_string())
    })?;

    if let Err(rejection) = admission.admit(&directory).await {
        error!(token = prefix, reason = ?rejection, "upload refused by admission control");
        return Err(rejection.into());
    }

    let stored = pipeline
        .commit(&directory, filename.as_deref(), Cursor::new(content))
        .await
        .inspect_err(|err| warn!(token = prefix, error = %err, "upload commit failed"))?;

    info!(
        path = %stored.path.display(),
        url = %stored.url,
        size = stored.size,
        token = prefix,
        "file uploaded by POST"
    );
    Ok(JsonResponse(UploadedResponse {
        ok: true,
        path: stored.url,
    }))
}

/// 读取字段内容，最多保留 `limit` 字节，其余丢弃。
async fn read_capped(mut field: Field<'_>, limit: u64) -> Result<Vec<u8>, ApiError> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut content = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        let room = limit.saturating_sub(content.len());
        content.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(content)
}
