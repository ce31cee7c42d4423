//! mysqlbinlog 출력 버퍼링용 로컬 로그 저장소
//!
//! 서브프로세스 출력을 번호가 매겨진 `<N>.log` 파일에 그대로 이어 쓰고,
//! 쓰기 위치(`index`)와 읽기 위치(`read`)를 따로 기록합니다.
//! 쓰기와 읽기는 서로 독립적으로 진행되므로 파싱이 쓰기보다 뒤처질 수 있습니다.
//!
//! 디렉터리 구성:
//!   - `1000001.log`, `1000002.log`, ... : 청크 파일
//!   - `index` : `{"log": "1000001.log", "size": 104857700}` (로테이션 시에만 갱신)
//!   - `read`  : `{"log": "1000001.log", "size": 4096, "init": false}`

use crate::error::{CdcError, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// 파일 번호 시작값 (외부에서 넣어둔 파일과 겹치지 않도록 큰 값에서 시작)
pub const LOG_START_INDEX: u64 = 1_000_000;

/// 기본 로테이션 크기 (100 MiB)
pub const DEFAULT_ROTATE_BYTES: u64 = 100 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 64 * 1024;
const INDEX_FILE: &str = "index";
const READ_FILE: &str = "read";

/// 로그 저장소 설정
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    pub dir: PathBuf,
    pub rotate_bytes: u64,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        LogStoreConfig {
            dir: PathBuf::from("logs"),
            rotate_bytes: DEFAULT_ROTATE_BYTES,
        }
    }
}

/// 쓰기 위치. `size`는 로테이션으로 닫힌 파일에만 기록됨
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIndex {
    pub log: String,
    pub size: Option<u64>,
}

/// 읽기 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCursor {
    pub log: String,
    pub size: u64,
    pub init: bool,
}

struct ActiveLog {
    name: String,
    file: File,
    size: u64,
}

/// 청크 로그 저장소
pub struct LogStore {
    dir: PathBuf,
    rotate_bytes: u64,
    writer: Mutex<ActiveLog>,
    reading: Arc<AtomicBool>,
}

impl LogStore {
    /// 저장소를 열고 새 활성 파일을 만든다
    pub fn open(config: &LogStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let next = list_logs(&config.dir)?
            .last()
            .copied()
            .unwrap_or(LOG_START_INDEX)
            + 1;
        let name = log_name(next);
        let file = open_append(&config.dir.join(&name))?;
        write_json(
            &config.dir.join(INDEX_FILE),
            &WriteIndex {
                log: name.clone(),
                size: None,
            },
        )?;

        info!("Opened log store at {} (active: {})", config.dir.display(), name);

        Ok(LogStore {
            dir: config.dir.clone(),
            rotate_bytes: config.rotate_bytes,
            writer: Mutex::new(ActiveLog {
                name,
                file,
                size: 0,
            }),
            reading: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 현재 쓰기 중인 파일명
    pub fn active_log(&self) -> String {
        self.writer.lock().name.clone()
    }

    /// 활성 파일 끝에 청크를 덧붙인다
    ///
    /// 누적 크기가 로테이션 크기를 넘으면 방금 닫힌 파일의 `{log, size}`를
    /// 기록하고 다음 번호 파일로 넘어간다. 다음 append부터 새 파일에 쓰인다.
    pub fn append(&self, chunk: &[u8]) -> Result<()> {
        let mut active = self.writer.lock();
        active.file.write_all(chunk)?;
        active.size += chunk.len() as u64;

        if active.size > self.rotate_bytes {
            active.file.flush()?;
            write_json(
                &self.dir.join(INDEX_FILE),
                &WriteIndex {
                    log: active.name.clone(),
                    size: Some(active.size),
                },
            )?;

            let next = log_index(&active.name).unwrap_or(LOG_START_INDEX) + 1;
            let name = log_name(next);
            let file = open_append(&self.dir.join(&name))?;
            info!(
                "Rotated log {} ({} bytes) -> {}",
                active.name, active.size, name
            );
            *active = ActiveLog {
                name,
                file,
                size: 0,
            };
        }
        Ok(())
    }

    /// 블로킹 스레드에서 `append`를 실행한다 (비동기 태스크용)
    pub async fn append_blocking(self: &Arc<Self>, chunk: Bytes) -> Result<()> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.append(&chunk))
            .await
            .map_err(|e| CdcError::IoError(format!("Append task failed: {}", e)))?
    }

    /// 읽기 위치부터 청크를 순서대로 돌려주는 리더를 연다
    ///
    /// 이미 다른 읽기가 진행 중이면 `None`을 돌려준다 (호출자는 다시 폴링).
    pub async fn read(&self) -> Result<Option<LogReader>> {
        if self
            .reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Read already in flight, skipping");
            return Ok(None);
        }

        match self.open_reader().await {
            Ok(Some(reader)) => Ok(Some(reader)),
            Ok(None) => {
                self.reading.store(false, Ordering::Release);
                Ok(None)
            }
            Err(e) => {
                self.reading.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn open_reader(&self) -> Result<Option<LogReader>> {
        let cursor = match self.resolve_cursor().await? {
            Some(cursor) => cursor,
            None => return Ok(None),
        };

        let start = if cursor.init { 0 } else { cursor.size };
        let mut file = tokio::fs::File::open(self.dir.join(&cursor.log)).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;

        debug!("Reading {} from offset {}", cursor.log, start);

        Ok(Some(LogReader {
            file,
            cursor_path: self.dir.join(READ_FILE),
            log: cursor.log,
            start,
            bytes_read: 0,
            guard: Arc::clone(&self.reading),
            finished: false,
        }))
    }

    /// 쓰기 위치와 읽기 위치를 비교해 이번에 읽을 위치를 정한다
    pub async fn resolve_cursor(&self) -> Result<Option<ReadCursor>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let logs = list_logs(&self.dir)?;
        let oldest = match logs.first() {
            Some(&index) => ReadCursor {
                log: log_name(index),
                size: 0,
                init: true,
            },
            None => return Ok(None),
        };

        let mut read: ReadCursor = match read_json(&self.dir.join(READ_FILE)).await? {
            Some(read) => read,
            None => return Ok(Some(oldest)),
        };
        let mut on_disk = match tokio::fs::metadata(self.dir.join(&read.log)).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Read cursor points at missing log {}, restarting from oldest", read.log);
                return Ok(Some(oldest));
            }
            Err(e) => return Err(e.into()),
        };
        let write: Option<WriteIndex> = read_json(&self.dir.join(INDEX_FILE)).await?;

        // 재시작으로 남은 빈 파일이 여러 개일 수 있으므로 다 읽은 파일은 연달아 건너뛴다
        loop {
            let exhausted = match &write {
                // 같은 파일: 로테이션으로 닫혔고 끝까지 읽은 경우에만 다음 파일로
                Some(write) if write.log == read.log => {
                    matches!(write.size, Some(sealed) if read.size >= sealed && on_disk == read.size)
                }
                // 다른 파일: 읽던 파일에 새로 쓰인 것이 없을 때만 다음 파일로
                _ => on_disk == read.size,
            };
            if !exhausted {
                break;
            }

            let next = match log_index(&read.log).map(|i| log_name(i + 1)) {
                Some(next) if self.dir.join(&next).exists() => next,
                _ => break,
            };
            debug!("Log {} fully consumed, advancing to {}", read.log, next);
            on_disk = tokio::fs::metadata(self.dir.join(&next)).await?.len();
            read = ReadCursor {
                log: next,
                size: 0,
                init: false,
            };
        }
        Ok(Some(read))
    }
}

/// 한 번의 읽기 패스. 파일 끝에 닿거나 drop 될 때 읽기 위치를 기록한다
pub struct LogReader {
    file: tokio::fs::File,
    cursor_path: PathBuf,
    log: String,
    start: u64,
    bytes_read: u64,
    guard: Arc<AtomicBool>,
    finished: bool,
}

impl LogReader {
    pub fn log(&self) -> &str {
        &self.log
    }

    /// 다음 청크. 파일 끝이면 읽기 위치를 저장하고 `None`
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let n = self.file.read_buf(&mut buf).await?;
        if n == 0 {
            self.finish()?;
            return Ok(None);
        }

        self.bytes_read += n as u64;
        Ok(Some(buf.freeze()))
    }

    fn cursor(&self) -> ReadCursor {
        ReadCursor {
            log: self.log.clone(),
            size: self.start + self.bytes_read,
            init: false,
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let result = write_json(&self.cursor_path, &self.cursor());
        self.guard.store(false, Ordering::Release);
        debug!("Read pass over {} ended at {}", self.log, self.start + self.bytes_read);
        result
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                warn!("Failed to persist read cursor: {}", e);
            }
        }
    }
}

fn log_name(index: u64) -> String {
    format!("{}.log", index)
}

fn log_index(name: &str) -> Option<u64> {
    name.strip_suffix(".log").and_then(|s| s.parse().ok())
}

/// 디렉터리의 `<N>.log` 파일 번호들 (오름차순)
fn list_logs(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut logs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(index) = entry.file_name().to_str().and_then(log_index) {
            logs.push(index);
        }
    }
    logs.sort_unstable();
    Ok(logs)
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_vec(value)?)?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
