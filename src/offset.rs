//! Binlog 처리 위치 추적 (Checkpoint 및 PositionTracker)
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 재시작 지점 (`{file, position}`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file: String,
    /// 바이트 위치
    pub position: u64,
}

impl Checkpoint {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Checkpoint {
            file: file.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        file_sequence(&self.file)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

/// "mysql-bin.000123" → 123
pub fn file_sequence(file: &str) -> Option<u64> {
    file.rsplit('.').next().and_then(|s| s.parse().ok())
}

/// Checkpoint 파일 저장소
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 저장된 checkpoint 읽기 (없으면 None)
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 임시 파일에 쓴 뒤 rename 하여 원자적으로 저장
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(checkpoint)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved checkpoint {}", checkpoint);
        Ok(())
    }
}

/// 현재 처리 위치 추적
///
/// rotate 이벤트와 처리된 행 이벤트마다 갱신되며, 파일과 위치가 모두
/// 유효할 때만 checkpoint를 내어줍니다.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    file: Option<String>,
    position: Option<u64>,
    dirty: bool,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        PositionTracker {
            file: Some(checkpoint.file.clone()),
            position: Some(checkpoint.position),
            dirty: false,
        }
    }

    /// rotate 이벤트: 새 파일과 시작 위치
    pub fn rotate(&mut self, file: &str, position: u64) {
        self.file = Some(file.to_string());
        self.position = Some(position);
        self.dirty = true;
    }

    /// 행 이벤트 처리 후 위치 갱신
    pub fn advance(&mut self, file: &str, position: u64) {
        if !file.is_empty() && self.file.as_deref() != Some(file) {
            self.file = Some(file.to_string());
        }
        self.position = Some(position);
        self.dirty = true;
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// 파일과 위치가 모두 유효한 경우에만 checkpoint 반환
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        match (&self.file, self.position) {
            (Some(file), Some(position)) if !file.is_empty() && position > 0 => {
                Some(Checkpoint::new(file.clone(), position))
            }
            _ => None,
        }
    }

    /// 마지막 저장 이후 바뀐 유효한 checkpoint
    pub fn pending(&self) -> Option<Checkpoint> {
        if self.dirty {
            self.checkpoint()
        } else {
            None
        }
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }
}

/// CDC 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    /// 시작 전
    Idle,
    /// 스트리밍 처리 중
    Streaming,
    /// 중단됨
    Stopped,
}
