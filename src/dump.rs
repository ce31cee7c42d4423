//! mysqlbinlog 서브프로세스 실행
//!
//! `mysqlbinlog -R --stop-never -v`로 원격 서버의 binlog를 텍스트로 받아
//! stdout 청크를 채널로 넘깁니다. 채널이 닫히면 프로세스가 끝난 것입니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::offset::Checkpoint;
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const STDOUT_CHUNK_SIZE: usize = 64 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// stdout 청크 또는 읽기 실패
pub type DumpOutput = mpsc::Receiver<Result<Bytes>>;

/// mysqlbinlog 명령 구성
#[derive(Debug, Clone)]
pub struct DumpCommand {
    pub program: PathBuf,
    pub connection: ConnectionConfig,
}

impl DumpCommand {
    pub fn new(program: impl Into<PathBuf>, connection: ConnectionConfig) -> Self {
        DumpCommand {
            program: program.into(),
            connection,
        }
    }

    /// `start` 위치부터 읽는 인자 목록
    pub fn args(&self, start: &Checkpoint) -> Vec<String> {
        let conn = &self.connection;
        let mut args = vec![
            "-R".to_string(),
            "--stop-never".to_string(),
            "-v".to_string(),
            format!("--host={}", conn.hostname),
            format!("--port={}", conn.port),
            format!("--user={}", conn.username),
            format!("--password={}", conn.password),
        ];
        if let Some(db) = &conn.database {
            args.push(format!("--database={}", db));
        }
        if start.position > 0 {
            args.push(format!("--start-position={}", start.position));
        }
        args.push(start.file.clone());
        args
    }

    /// 프로세스를 띄우고 stdout 청크 채널을 돌려준다
    pub fn spawn(&self, start: &Checkpoint) -> Result<DumpProcess> {
        info!(
            "Spawning {} from {}",
            self.program.display(),
            start
        );

        let mut child = Command::new(&self.program)
            .args(self.args(start))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CdcError::SubprocessError(format!(
                    "Failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CdcError::SubprocessError("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("mysqlbinlog: {}", line);
                }
            });
        }

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        tokio::spawn(forward_stdout(stdout, tx));

        Ok(DumpProcess {
            child,
            output: Some(rx),
        })
    }
}

async fn forward_stdout<R>(mut stdout: R, tx: mpsc::Sender<Result<Bytes>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(STDOUT_CHUNK_SIZE);
    loop {
        match stdout.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("mysqlbinlog stdout closed");
                break;
            }
            Ok(_) => {
                let chunk = buf.split().freeze();
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
                buf.reserve(STDOUT_CHUNK_SIZE);
            }
            Err(e) => {
                let _ = tx
                    .send(Err(CdcError::SubprocessError(format!(
                        "Failed to read mysqlbinlog output: {}",
                        e
                    ))))
                    .await;
                break;
            }
        }
    }
}

/// 실행 중인 mysqlbinlog 프로세스
pub struct DumpProcess {
    child: Child,
    output: Option<DumpOutput>,
}

impl DumpProcess {
    /// stdout 청크 채널 (한 번만 꺼낼 수 있음)
    pub fn take_output(&mut self) -> Option<DumpOutput> {
        self.output.take()
    }

    pub async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => {
                info!("mysqlbinlog killed");
                Ok(())
            }
            // 이미 종료된 경우
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(CdcError::SubprocessError(format!(
                "Failed to kill mysqlbinlog: {}",
                e
            ))),
        }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| CdcError::SubprocessError(format!("Failed to wait for mysqlbinlog: {}", e)))
    }
}
