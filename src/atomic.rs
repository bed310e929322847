//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use uuid::Uuid;

/// 目标文件旁的临时文件；`finalize` 重命名前目标路径不可见任何内容。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录独占创建 `{name}.{uuid}.tmp`。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!("{base}.{}.tmp", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件，失败时删除临时文件。
    pub async fn finalize(self) -> io::Result<()> {
        if let Err(err) = self.file.sync_all().await {
            drop(self.file);
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::AtomicFile;
    use tempfile::tempdir;
    use tokio::fs;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn target_appears_only_after_finalize() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("report.txt");

        let mut atomic = AtomicFile::new(&target).await.expect("create temp");
        let temp_path = atomic.temp_path().to_path_buf();
        assert!(temp_path.to_string_lossy().ends_with(".tmp"));
        atomic.file_mut().write_all(b"payload").await.expect("write");
        assert!(fs::metadata(&target).await.is_err());

        atomic.finalize().await.expect("finalize");
        assert_eq!(fs::read(&target).await.expect("read"), b"payload");
        assert!(fs::metadata(&temp_path).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_removes_temp_file() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("report.txt");

        let atomic = AtomicFile::new(&target).await.expect("create temp");
        let temp_path = atomic.temp_path().to_path_buf();
        atomic.cleanup().await;

        assert!(fs::metadata(&temp_path).await.is_err());
        assert!(fs::metadata(&target).await.is_err());
    }

    #[tokio::test]
    async fn failed_rename_removes_temp_file() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("occupied");
        fs::create_dir(&target).await.expect("target dir");
        fs::write(target.join("inner.txt"), b"keep").await.expect("inner file");

        let mut atomic = AtomicFile::new(&target).await.expect("create temp");
        let temp_path = atomic.temp_path().to_path_buf();
        atomic.file_mut().write_all(b"payload").await.expect("write");

        assert!(atomic.finalize().await.is_err());
        assert!(fs::metadata(&temp_path).await.is_err());
        assert_eq!(
            fs::read(target.join("inner.txt")).await.expect("inner intact"),
            b"keep"
        );
    }
}
