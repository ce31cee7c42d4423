//! MySQL CDC 엔진 - mysqlbinlog 텍스트 스트리밍 처리
//!
//! CDC 엔진은 다음 단계로 진행됩니다:
//! 1. 스키마 로드 및 시작 위치 결정 (체크포인트 또는 최신 binlog 끝)
//! 2. mysqlbinlog 출력을 로컬 로그 저장소에 버퍼링
//! 3. 저장소를 폴링하며 이벤트 해석 → 행 디코딩 → 소비자 채널로 전송
//! 4. 처리 위치를 주기적으로 체크포인트 파일에 저장

use crate::config::CdcConfig;
use crate::connection::MySqlConnection;
use crate::decoder::RowDecoder;
use crate::dump::{DumpCommand, DumpOutput};
use crate::error::{CdcError, Result};
use crate::events::{EventKind, ResolvedEvent, RowChangeEvent, TableMapEntry};
use crate::log_store::LogStore;
use crate::offset::{Checkpoint, CheckpointStore, PositionTracker, ProcessingState};
use crate::resolver::EventResolver;
use crate::schema::SchemaCatalog;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// 이벤트 해석부터 행 디코딩까지의 동기 처리 단계
///
/// 리졸버, 테이블 맵, 스키마, 위치 추적을 한 곳에서 소유한다.
pub struct EventPipeline {
    resolver: EventResolver,
    decoder: RowDecoder,
    table_map: HashMap<u64, TableMapEntry>,
    catalog: SchemaCatalog,
    tracker: PositionTracker,
    last_emitted: Option<(String, u64)>,
}

impl EventPipeline {
    /// `start` 위치부터 읽는 파이프라인
    pub fn new(catalog: SchemaCatalog, decoder: RowDecoder, start: &Checkpoint) -> Self {
        EventPipeline {
            resolver: EventResolver::with_file(start.file.clone()),
            decoder,
            table_map: HashMap::new(),
            catalog,
            tracker: PositionTracker::from_checkpoint(start),
            last_emitted: None,
        }
    }

    /// 청크를 넣고 이번에 완성된 행 변경 이벤트들을 꺼낸다
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RowChangeEvent> {
        self.resolver.push(chunk);
        let mut out = Vec::new();
        while let Some(event) = self.resolver.next_event() {
            self.process(event, &mut out);
        }
        out
    }

    /// 완성된 이벤트 하나 처리
    pub fn process(&mut self, event: ResolvedEvent, out: &mut Vec<RowChangeEvent>) {
        let head = &event.head;
        match &head.kind {
            EventKind::Rotate { file, position } => {
                info!("Binlog rotated to {} at {}", file, position);
                self.tracker.rotate(file, *position);
                self.last_emitted = None;
            }
            EventKind::TableMap {
                table_id,
                database,
                table,
            } => {
                trace!("Table map {} -> `{}`.`{}`", table_id, database, table);
                self.table_map.insert(
                    *table_id,
                    TableMapEntry {
                        database: database.clone(),
                        table: table.clone(),
                    },
                );
            }
            kind => match kind.row_operation() {
                Some((op, table_id)) => {
                    if let Some((file, position)) = &self.last_emitted {
                        if *file == head.file && head.end_log_pos <= *position {
                            warn!(
                                "Dropping {} event at {}:{} (already past {})",
                                op.as_str(),
                                head.file,
                                head.end_log_pos,
                                position
                            );
                            return;
                        }
                    }

                    let entry = self.table_map.get(&table_id);
                    for block in &event.blocks {
                        if let Some(change) = self.decoder.decode(head, block, entry, &self.catalog) {
                            out.push(change);
                        }
                    }
                    self.tracker.advance(&head.file, head.end_log_pos);
                    self.last_emitted = Some((head.file.clone(), head.end_log_pos));
                }
                None => trace!("Skipping {} event at {}", kind.as_str(), head.end_log_pos),
            },
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut PositionTracker {
        &mut self.tracker
    }

    pub fn table_entry(&self, table_id: u64) -> Option<&TableMapEntry> {
        self.table_map.get(&table_id)
    }

    /// 아직 종결되지 않은 버퍼 크기
    pub fn pending_bytes(&self) -> usize {
        self.resolver.pending_bytes()
    }
}

/// 저장소 폴링과 체크포인트 주기
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub poll_interval: Duration,
    pub checkpoint_interval: Duration,
}

impl Default for PumpSettings {
    fn default() -> Self {
        PumpSettings {
            poll_interval: Duration::from_millis(50),
            checkpoint_interval: Duration::from_secs(3),
        }
    }
}

/// 서브프로세스 출력이 끝날 때까지 저장소에 쓰고, 읽고, 디코딩하고, 보낸다
///
/// 출력 채널이 닫히면 남은 데이터를 모두 처리하고 마지막 체크포인트를
/// 저장한 뒤 `Ok(())`, 출력 읽기 실패면 같은 정리 후 그 에러를 돌려준다.
pub async fn pump(
    mut output: DumpOutput,
    store: Arc<LogStore>,
    pipeline: &mut EventPipeline,
    checkpoints: &CheckpointStore,
    tx: &mpsc::Sender<RowChangeEvent>,
    settings: PumpSettings,
) -> Result<()> {
    let writer_store = Arc::clone(&store);
    let mut writer = tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            writer_store.append_blocking(chunk?).await?;
        }
        Ok::<(), CdcError>(())
    });

    let mut poll = tokio::time::interval(settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut checkpoint_timer = tokio::time::interval(settings.checkpoint_interval);
    checkpoint_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            joined = &mut writer => {
                break joined.unwrap_or_else(|e| {
                    Err(CdcError::SubprocessError(format!("Writer task failed: {}", e)))
                });
            }
            _ = poll.tick() => {
                read_pass(&store, pipeline, tx).await?;
                save_checkpoint(pipeline, checkpoints).await?;
            }
            _ = checkpoint_timer.tick() => {
                save_checkpoint(pipeline, checkpoints).await?;
            }
        }
    };

    match &outcome {
        Ok(()) => info!("mysqlbinlog output closed, draining log store"),
        Err(e) => error!("mysqlbinlog output failed: {}, draining log store", e),
    }
    while read_pass(&store, pipeline, tx).await? > 0 {}
    save_checkpoint(pipeline, checkpoints).await?;
    if pipeline.pending_bytes() > 0 {
        debug!("Discarding {} unterminated bytes", pipeline.pending_bytes());
    }

    outcome
}

/// 저장소에서 한 번 읽고 완성된 이벤트를 보낸다. 읽은 바이트 수 반환
async fn read_pass(
    store: &LogStore,
    pipeline: &mut EventPipeline,
    tx: &mpsc::Sender<RowChangeEvent>,
) -> Result<usize> {
    let mut reader = match store.read().await? {
        Some(reader) => reader,
        None => return Ok(0),
    };

    let mut total = 0;
    while let Some(chunk) = reader.next_chunk().await? {
        total += chunk.len();
        for event in pipeline.feed(&chunk) {
            tx.send(event).await.map_err(|_| CdcError::ChannelClosed)?;
        }
    }
    if total > 0 {
        trace!("Read {} bytes from {}", total, reader.log());
    }
    Ok(total)
}

async fn save_checkpoint(pipeline: &mut EventPipeline, checkpoints: &CheckpointStore) -> Result<()> {
    if let Some(checkpoint) = pipeline.tracker().pending() {
        checkpoints.save(&checkpoint).await?;
        pipeline.tracker_mut().mark_saved();
    }
    Ok(())
}

/// 실행 중인 엔진을 다른 태스크에서 멈추기 위한 핸들
#[derive(Debug, Clone)]
pub struct StopHandle {
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.notify.notify_one();
    }
}

/// MySQL CDC 엔진
pub struct CdcEngine {
    config: CdcConfig,
    conn: Option<MySqlConnection>,
    catalog: Option<SchemaCatalog>,
    start: Option<Checkpoint>,
    state: ProcessingState,
    shutdown: Arc<Notify>,
}

impl CdcEngine {
    /// 새 CDC 엔진 생성
    pub fn new(config: CdcConfig) -> Self {
        CdcEngine {
            config,
            conn: None,
            catalog: None,
            start: None,
            state: ProcessingState::Idle,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// 연결, 스키마 로드, 시작 위치 결정
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting CDC Engine");

        let mut conn = MySqlConnection::connect(self.config.connection.clone()).await?;

        // 스키마는 스트리밍 전에 반드시 준비되어야 함
        let mut catalog = SchemaCatalog::new();
        catalog.load(&mut conn).await?;
        info!("Loaded schema for {} tables", catalog.table_count());

        let checkpoints = CheckpointStore::new(&self.config.checkpoint_file);
        let start = match checkpoints.load().await? {
            Some(checkpoint) => {
                info!("Resuming from checkpoint {}", checkpoint);
                checkpoint
            }
            None => {
                let newest = conn.newest_binlog().await?;
                info!("No checkpoint found, starting from newest binlog {}", newest);
                newest
            }
        };

        self.start = Some(start);
        self.catalog = Some(catalog);
        self.conn = Some(conn);
        info!("CDC Engine started successfully");
        Ok(())
    }

    /// mysqlbinlog를 실행하고 변경 이벤트를 `tx`로 보낸다
    ///
    /// 프로세스가 끝나거나 `stop`될 때까지 돌아오지 않는다. 재시작은 하지 않는다.
    pub async fn run(&mut self, tx: mpsc::Sender<RowChangeEvent>) -> Result<()> {
        let start = match (&self.start, &self.catalog) {
            (Some(start), Some(_)) => start.clone(),
            _ => {
                return Err(CdcError::ConfigError(
                    "CdcEngine::start must complete before run".to_string(),
                ))
            }
        };

        let store = Arc::new(LogStore::open(&self.config.log_store)?);
        let checkpoints = CheckpointStore::new(&self.config.checkpoint_file);

        let command = DumpCommand::new(&self.config.mysqlbinlog_path, self.config.connection.clone());
        let mut dump = command.spawn(&start)?;
        let output = dump
            .take_output()
            .ok_or_else(|| CdcError::SubprocessError("Output already taken".to_string()))?;

        let mut pipeline = EventPipeline::new(
            self.catalog.take().unwrap_or_default(),
            RowDecoder::new(self.config.temporal_fallback),
            &start,
        );

        self.state = ProcessingState::Streaming;
        let settings = PumpSettings {
            poll_interval: self.config.poll_interval,
            checkpoint_interval: self.config.checkpoint_interval,
        };

        let shutdown = Arc::clone(&self.shutdown);
        let result = {
            let pumping = pump(output, store, &mut pipeline, &checkpoints, &tx, settings);
            tokio::pin!(pumping);

            tokio::select! {
                result = &mut pumping => result,
                _ = shutdown.notified() => {
                    info!("Stop requested, killing mysqlbinlog");
                    match dump.kill().await {
                        Ok(()) => pumping.await,
                        Err(e) => Err(e),
                    }
                }
            }
        };

        if result.is_err() {
            if let Err(e) = dump.kill().await {
                warn!("{}", e);
            }
        }
        match dump.wait().await {
            Ok(status) if !status.success() => warn!("mysqlbinlog exited with {}", status),
            Ok(_) => {}
            Err(e) => warn!("{}", e),
        }

        if let Some(checkpoint) = pipeline.tracker().checkpoint() {
            self.start = Some(checkpoint);
        }
        self.catalog = Some(pipeline.catalog);
        self.state = ProcessingState::Stopped;
        info!("CDC Engine run finished");
        result
    }

    /// 다른 태스크에서 `run`을 멈출 수 있는 핸들
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            notify: Arc::clone(&self.shutdown),
        }
    }

    /// 다음 (또는 진행 중인) `run`을 멈추고 연결을 닫는다
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping CDC Engine");
        self.shutdown.notify_one();

        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }

        self.state = ProcessingState::Stopped;
        info!("CDC Engine stopped");
        Ok(())
    }

    /// 현재 (또는 다음 run의) 시작 위치
    pub fn start_position(&self) -> Option<&Checkpoint> {
        self.start.as_ref()
    }

    /// 상태 조회
    pub fn get_state(&self) -> ProcessingState {
        self.state
    }
}
