//! 수신 파일 저장
//!
//! 디렉터리 단위 저장을 지원하는 저장소는 묶음으로 저장하고,
//! 지원하지 않거나 실패하면 파일마다 개별 저장으로 대체함

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chunk::ReceivedFile;
use crate::decoder::FileGroup;
use crate::{Error, Result};

/// 저장 협력자
pub trait FileSink: Send + Sync {
    /// 디렉터리 단위 저장 지원 여부
    fn supports_directory_save(&self) -> bool;

    /// 같은 디렉터리 파일 묶음 저장
    fn save_directory(&self, directory: &str, files: &[ReceivedFile]) -> impl Future<Output = Result<()>> + Send;

    /// 파일 하나 저장
    fn save_file(&self, file: &ReceivedFile) -> impl Future<Output = Result<()>> + Send;
}

/// 저장 결과
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveReport {
    /// 저장된 파일 수
    pub saved_files: usize,

    /// 디렉터리 단위로 저장된 묶음 수
    pub directory_saves: usize,

    /// 개별 저장으로 대체된 묶음 수
    pub fallbacks: usize,

    /// 저장 실패 (경로, 사유)
    pub failed: Vec<(String, String)>,
}

impl SaveReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 묶음별 저장 (디렉터리 저장 → 개별 저장 대체)
pub async fn save_groups<S: FileSink>(sink: &S, groups: &[FileGroup]) -> SaveReport {
    let mut report = SaveReport::default();

    for group in groups {
        if sink.supports_directory_save() {
            match sink.save_directory(&group.directory, &group.files).await {
                Ok(()) => {
                    report.directory_saves += 1;
                    report.saved_files += group.files.len();
                    continue;
                }
                Err(e) => {
                    debug!("directory save failed for {}: {}, saving files individually", group.directory, e);
                }
            }
        }

        report.fallbacks += 1;
        for file in &group.files {
            match sink.save_file(file).await {
                Ok(()) => report.saved_files += 1,
                Err(e) => {
                    warn!("파일 저장 실패 {}: {}", file.descriptor.path, e);
                    report.failed.push((file.descriptor.path.clone(), e.to_string()));
                }
            }
        }
    }

    report
}

/// 원격에서 받은 경로를 저장 루트 아래 상대 경로로 변환
///
/// `..`, 루트 이탈, 빈 경로는 거부
fn relative_path(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let mut relative = PathBuf::new();

    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(Error::Transfer(format!("허용되지 않는 경로: {}", path))),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(Error::Transfer(format!("빈 경로: {:?}", path)));
    }
    Ok(relative)
}

/// 파일시스템 저장소
#[derive(Debug, Clone)]
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 파일의 최종 저장 위치
    pub fn target_of(&self, file: &ReceivedFile) -> Result<PathBuf> {
        Ok(self.root.join(relative_path(&file.descriptor.path)?))
    }

    async fn write(&self, file: &ReceivedFile) -> Result<PathBuf> {
        let target = self.target_of(file)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &file.data).await?;
        Ok(target)
    }
}

impl FileSink for FsSink {
    fn supports_directory_save(&self) -> bool {
        true
    }

    /// 묶음 전체를 저장하고, 하나라도 실패하면 이미 쓴 파일을 지움
    fn save_directory(&self, directory: &str, files: &[ReceivedFile]) -> impl Future<Output = Result<()>> + Send {
        async move {
            if let Some(stray) = files.iter().find(|f| f.directory() != directory) {
                return Err(Error::Transfer(format!(
                    "{} is not in {}",
                    stray.descriptor.path, directory
                )));
            }

            let mut written = Vec::with_capacity(files.len());
            for file in files {
                match self.write(file).await {
                    Ok(path) => written.push(path),
                    Err(e) => {
                        for path in &written {
                            let _ = tokio::fs::remove_file(path).await;
                        }
                        return Err(e);
                    }
                }
            }

            debug!("saved {} files into {}", written.len(), directory);
            Ok(())
        }
    }

    fn save_file(&self, file: &ReceivedFile) -> impl Future<Output = Result<()>> + Send {
        async move {
            let target = self.write(file).await?;
            debug!("saved {}", target.display());
            Ok(())
        }
    }
}

/// 메모리 저장소 (UI 미리보기, 테스트용)
#[derive(Debug, Default)]
pub struct MemorySink {
    directory_save: bool,
    fail_directory_save: bool,
    saved: Mutex<Vec<ReceivedFile>>,
    directory_calls: Mutex<Vec<String>>,
}

impl MemorySink {
    /// 개별 저장만 지원
    pub fn new() -> Self {
        Self::default()
    }

    /// 디렉터리 저장 지원
    pub fn with_directory_save() -> Self {
        Self {
            directory_save: true,
            ..Self::default()
        }
    }

    /// 디렉터리 저장을 지원한다고 하지만 항상 실패
    pub fn with_failing_directory_save() -> Self {
        Self {
            directory_save: true,
            fail_directory_save: true,
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Vec<ReceivedFile> {
        self.saved.lock().clone()
    }

    pub fn directory_calls(&self) -> Vec<String> {
        self.directory_calls.lock().clone()
    }
}

impl FileSink for MemorySink {
    fn supports_directory_save(&self) -> bool {
        self.directory_save
    }

    fn save_directory(&self, directory: &str, files: &[ReceivedFile]) -> impl Future<Output = Result<()>> + Send {
        self.directory_calls.lock().push(directory.to_string());
        let result = if self.fail_directory_save {
            Err(Error::Transfer("directory save unavailable".to_string()))
        } else {
            self.saved.lock().extend_from_slice(files);
            Ok(())
        };
        std::future::ready(result)
    }

    fn save_file(&self, file: &ReceivedFile) -> impl Future<Output = Result<()>> + Send {
        self.saved.lock().push(file.clone());
        std::future::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::chunk::FileDescriptor;

    fn file(path: &str, data: &[u8]) -> ReceivedFile {
        let name = path.rsplit('/').next().unwrap_or(path);
        ReceivedFile {
            descriptor: FileDescriptor::new(name, data.len() as u64, 64).with_path(path),
            data: Bytes::copy_from_slice(data),
        }
    }

    fn groups() -> Vec<FileGroup> {
        vec![
            FileGroup {
                directory: "/docs".to_string(),
                files: vec![file("/docs/a.txt", b"a"), file("/docs/b.txt", b"bb")],
            },
            FileGroup {
                directory: "/".to_string(),
                files: vec![file("/c.txt", b"ccc")],
            },
        ]
    }

    #[test]
    fn test_relative_path_rejects_escape() {
        assert_eq!(relative_path("/docs/a.txt").unwrap(), PathBuf::from("docs/a.txt"));
        assert_eq!(relative_path("./x").unwrap(), PathBuf::from("x"));
        assert!(relative_path("/../etc/passwd").is_err());
        assert!(relative_path("/docs/../../x").is_err());
        assert!(relative_path("/").is_err());
    }

    #[tokio::test]
    async fn test_individual_save_when_directory_unsupported() {
        let sink = MemorySink::new();
        let report = save_groups(&sink, &groups()).await;

        assert!(report.is_success());
        assert_eq!(report.saved_files, 3);
        assert_eq!(report.directory_saves, 0);
        assert_eq!(report.fallbacks, 2);
        assert!(sink.directory_calls().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_after_directory_failure() {
        let sink = MemorySink::with_failing_directory_save();
        let report = save_groups(&sink, &groups()).await;

        assert_eq!(sink.directory_calls(), vec!["/docs".to_string(), "/".to_string()]);
        assert_eq!(report.fallbacks, 2);
        assert_eq!(report.saved_files, 3);
        assert_eq!(sink.saved().len(), 3);
    }

    #[tokio::test]
    async fn test_fs_sink_writes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());
        let report = save_groups(&sink, &groups()).await;

        assert!(report.is_success());
        assert_eq!(report.directory_saves, 2);
        assert_eq!(std::fs::read(dir.path().join("docs/a.txt")).unwrap(), b"a");
        assert_eq!(std::fs::read(dir.path().join("docs/b.txt")).unwrap(), b"bb");
        assert_eq!(std::fs::read(dir.path().join("c.txt")).unwrap(), b"ccc");
    }

    #[tokio::test]
    async fn test_fs_sink_reports_rejected_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());
        let evil = FileGroup {
            directory: "/..".to_string(),
            files: vec![file("/../evil.txt", b"x")],
        };

        let report = save_groups(&sink, &[evil]).await;
        assert_eq!(report.saved_files, 0);
        assert_eq!(report.fallbacks, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
    }
}
