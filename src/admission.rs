//! 上传准入控制：磁盘剩余空间与待处理文件数检查，结果短时缓存。

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub min_free_percent: u8,
    pub max_files: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsageSnapshot {
    /// 0..=100
    pub free_percent: u8,
    pub file_count: u64,
    pub sampled_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    LowDiskSpace { free_percent: u8, limit: u8 },
    TooManyFiles { file_count: u64, limit: u64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::LowDiskSpace { .. } => f.write_str("failed to upload: disk space too low"),
            Rejection::TooManyFiles { .. } => f.write_str("failed to upload: too many files"),
        }
    }
}

impl std::error::Error for Rejection {}

/// Applies both thresholds to a snapshot.
pub fn evaluate(snapshot: &DiskUsageSnapshot, limits: &AdmissionLimits) -> Result<(), Rejection> {
    if snapshot.free_percent < limits.min_free_percent {
        return Err(Rejection::LowDiskSpace {
            free_percent: snapshot.free_percent,
            limit: limits.min_free_percent,
        });
    }
    if snapshot.file_count > limits.max_files {
        return Err(Rejection::TooManyFiles {
            file_count: snapshot.file_count,
            limit: limits.max_files,
        });
    }
    Ok(())
}

/// Disk usage sampler with a per-directory TTL cache.
///
/// The cache lock is held only to read or swap a snapshot, never across the
/// blocking sample. Concurrent refreshes of one directory may both sample;
/// the newest snapshot wins so `sampled_at` never moves backwards.
#[derive(Debug)]
pub struct AdmissionController {
    ttl: Duration,
    limits: AdmissionLimits,
    cache: Mutex<HashMap<PathBuf, DiskUsageSnapshot>>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits, ttl: Duration) -> Self {
        Self {
            ttl,
            limits,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 返回缓存或新采样的快照；采样失败时退回旧快照。
    pub async fn check(&self, directory: &Path) -> io::Result<DiskUsageSnapshot> {
        let cached = self.cached(directory);
        if let Some(snapshot) = cached
            && snapshot.sampled_at.elapsed() <= self.ttl
        {
            return Ok(snapshot);
        }

        match sample_disk_usage(directory.to_path_buf()).await {
            Ok(fresh) => Ok(self.store(directory, fresh)),
            Err(err) => match cached {
                Some(previous) => {
                    warn!(
                        directory = %directory.display(),
                        error = %err,
                        "disk usage refresh failed, keeping previous snapshot"
                    );
                    Ok(previous)
                }
                None => Err(err),
            },
        }
    }

    /// 准入判断；采样完全失败时放行，磁盘检查只是建议性的。
    pub async fn admit(&self, directory: &Path) -> Result<(), Rejection> {
        match self.check(directory).await {
            Ok(snapshot) => {
                debug!(
                    directory = %directory.display(),
                    free_percent = snapshot.free_percent,
                    file_count = snapshot.file_count,
                    "disk usage"
                );
                evaluate(&snapshot, &self.limits)
            }
            Err(err) => {
                warn!(
                    directory = %directory.display(),
                    error = %err,
                    "disk usage unavailable, admitting upload"
                );
                Ok(())
            }
        }
    }

    fn cached(&self, directory: &Path) -> Option<DiskUsageSnapshot> {
        let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.get(directory).copied()
    }

    fn store(&self, directory: &Path, fresh: DiskUsageSnapshot) -> DiskUsageSnapshot {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = cache.entry(directory.to_path_buf()).or_insert(fresh);
        if entry.sampled_at < fresh.sampled_at {
            *entry = fresh;
        }
        *entry
    }
}

async fn sample_disk_usage(directory: PathBuf) -> io::Result<DiskUsageSnapshot> {
    tokio::task::spawn_blocking(move || {
        let total = fs2::total_space(&directory)?;
        let free = fs2::free_space(&directory)?;
        if total == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "filesystem reports zero total space",
            ));
        }
        let free_percent = (u128::from(free) * 100 / u128::from(total)).min(100) as u8;
        let file_count = std::fs::read_dir(&directory)?.count() as u64;
        Ok(DiskUsageSnapshot {
            free_percent,
            file_count,
            sampled_at: Instant::now(),
        })
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
