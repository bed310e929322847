//! 上传提交流程：测量大小、确定文件名、写临时文件并原子改名。

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};

use crate::atomic::AtomicFile;
use crate::config::PUBLIC_MOUNT;

#[derive(Debug)]
pub enum CommitError {
    TooLarge { size: u64, limit: u64 },
    SizeMismatch { expected: u64, written: u64 },
    Io(io::Error),
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::TooLarge { .. } => f.write_str("uploaded file size exceeds the limit"),
            CommitError::SizeMismatch { expected, written } => write!(
                f,
                "the size of uploaded content is {expected}, but {written} bytes written"
            ),
            CommitError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<io::Error> for CommitError {
    fn from(err: io::Error) -> Self {
        CommitError::Io(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub url: String,
    pub size: u64,
}

/// Persists uploads under `{document_root}/{token}/{filename}`.
#[derive(Debug, Clone)]
pub struct UploadCommitPipeline {
    document_root: PathBuf,
    max_upload_size: u64,
}

impl UploadCommitPipeline {
    pub fn new(document_root: PathBuf, max_upload_size: u64) -> Self {
        Self {
            document_root,
            max_upload_size,
        }
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// `token` must already be authenticated, so it is a single safe path segment.
    pub fn token_dir(&self, token: &str) -> PathBuf {
        self.document_root.join(token)
    }

    /// 首次使用时创建令牌目录。
    pub async fn ensure_dir(&self, token: &str) -> io::Result<PathBuf> {
        let directory = self.token_dir(token);
        fs::create_dir_all(&directory).await?;
        Ok(directory)
    }

    /// 提交一次上传；任何失败都不会在最终路径留下文件。
    pub async fn commit<R>(
        &self,
        directory: &Path,
        filename: Option<&str>,
        mut content: R,
    ) -> Result<StoredFile, CommitError>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        let size = measure_size(&mut content).await?;
        if size > self.max_upload_size {
            return Err(CommitError::TooLarge {
                size,
                limit: self.max_upload_size,
            });
        }

        let filename = match filename.and_then(sanitize_filename) {
            Some(name) => name,
            None => {
                let digest = hash_content(&mut content).await?;
                content.seek(SeekFrom::Start(0)).await?;
                digest
            }
        };
        let target = directory.join(&filename);

        let mut atomic = AtomicFile::new(&target).await?;
        debug!(temp = %atomic.temp_path().display(), size, "writing upload");
        let written = async {
            let written = tokio::io::copy(&mut content, atomic.file_mut()).await?;
            atomic.file_mut().flush().await?;
            Ok::<u64, io::Error>(written)
        }
        .await;
        let written = match written {
            Ok(value) => value,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err.into());
            }
        };
        if written != size {
            atomic.cleanup().await;
            return Err(CommitError::SizeMismatch {
                expected: size,
                written,
            });
        }

        if let Err(err) = atomic.finalize().await {
            error!(path = %target.display(), error = %err, "unable to rename temporary upload file");
            return Err(err.into());
        }

        let url = self.public_url(&target);
        Ok(StoredFile {
            path: target,
            url,
            size,
        })
    }

    /// 去掉文档根前缀并挂到公开路径下。
    pub fn public_url(&self, stored: &Path) -> String {
        let relative = stored.strip_prefix(&self.document_root).unwrap_or(stored);
        let segments = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(segment) => Some(segment.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>();
        format!("{PUBLIC_MOUNT}/{}", segments.join("/"))
    }
}

/// Size from seeking to the end, then rewinds.
pub async fn measure_size<S>(content: &mut S) -> io::Result<u64>
where
    S: AsyncSeek + Unpin,
{
    let size = content.seek(SeekFrom::End(0)).await?;
    content.seek(SeekFrom::Start(0)).await?;
    Ok(size)
}

async fn hash_content<R>(content: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = content.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Keeps only the final path component of a client supplied name.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    match last {
        "" | "." | ".." => None,
        value => Some(value.to_string()),
    }
}
