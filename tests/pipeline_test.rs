//! 미리 준비한 mysqlbinlog 출력으로 저장소 → 해석 → 디코딩 → 체크포인트 전체 흐름 검증

use bytes::Bytes;
use mysqlbinlog_cdc::cdc_engine::{pump, EventPipeline, PumpSettings};
use mysqlbinlog_cdc::decoder::RowDecoder;
use mysqlbinlog_cdc::log_store::LogStoreConfig;
use mysqlbinlog_cdc::schema::{Column, ColumnKey};
use mysqlbinlog_cdc::{
    CdcError, CellValue, Checkpoint, CheckpointStore, LogStore, OperationType, RowChangeEvent,
    SchemaCatalog,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;

const DUMP: &str = "\
# at 4
#700101  0:00:00 server id 1  end_log_pos 0 \tRotate to mysql-bin.000001  pos: 4
# at 4
#210101 10:00:00 server id 1  end_log_pos 126 CRC32 0x5fc5ea4d \tStart: binlog v 4, server v 8.0.22 created 210101 10:00:00
# at 126
#210101 10:00:01 server id 1  end_log_pos 179 CRC32 0x2c5b7a9d \tTable_map: `d`.`t` mapped to number 10
# at 179
#210101 10:00:01 server id 1  end_log_pos 225 CRC32 0x6d6f7a12 \tWrite_rows: table id 10 flags: STMT_END_F
### INSERT INTO `d`.`t`
### SET
###   @1=1
###   @2='x'
# at 225
#210101 10:00:01 server id 1  end_log_pos 256 CRC32 0x0b7f6e3c \tXid = 12
COMMIT/*!*/;
# at 256
#210101 10:00:02 server id 1  end_log_pos 309 CRC32 0x1c5b7a9e \tTable_map: `d`.`t` mapped to number 10
# at 309
#210101 10:00:02 server id 1  end_log_pos 370 CRC32 0x7d6f7a13 \tUpdate_rows: table id 10 flags: STMT_END_F
### UPDATE `d`.`t`
### WHERE
###   @1=1
###   @2='x'
### SET
###   @1=1
###   @2='y'
# at 370
#210101 10:00:02 server id 1  end_log_pos 401 CRC32 0x0c7f6e3d \tXid = 13
COMMIT/*!*/;
# at 401
#210101 10:00:03 server id 1  end_log_pos 448 CRC32 0x4e1f0a21 \tRotate to mysql-bin.000002  pos: 4
# at 4
#210101 10:00:03 server id 1  end_log_pos 126 CRC32 0x5ac5ea4e \tStart: binlog v 4, server v 8.0.22 created 210101 10:00:03
# at 126
#210101 10:00:04 server id 1  end_log_pos 179 CRC32 0x3c5b7a9f \tTable_map: `d`.`t` mapped to number 11
# at 179
#210101 10:00:04 server id 1  end_log_pos 225 CRC32 0x8d6f7a14 \tDelete_rows: table id 11 flags: STMT_END_F
### DELETE FROM `d`.`t`
### WHERE
###   @1=1
###   @2='y'
# at 225
#210101 10:00:04 server id 1  end_log_pos 256 CRC32 0x1d7f6e3e \tXid = 14
COMMIT/*!*/;
# at 256
";

fn catalog() -> SchemaCatalog {
    let column = |name: &str, ordinal: u32, data_type: &str, key: ColumnKey| Column {
        database: "d".to_string(),
        table: "t".to_string(),
        name: name.to_string(),
        ordinal,
        data_type: data_type.to_string(),
        nullable: key == ColumnKey::None,
        key,
        ..Default::default()
    };
    SchemaCatalog::from_columns(vec![
        column("col1", 1, "int", ColumnKey::Primary),
        column("col2", 2, "varchar", ColumnKey::None),
    ])
}

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<LogStore>,
    checkpoints: CheckpointStore,
    pipeline: EventPipeline,
}

fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let store = LogStore::open(&LogStoreConfig {
        dir: dir.path().join("logs"),
        rotate_bytes: 256,
    })
    .unwrap();
    let checkpoints = CheckpointStore::new(dir.path().join("checkpoint.json"));
    let pipeline = EventPipeline::new(
        catalog(),
        RowDecoder::default(),
        &Checkpoint::new("mysql-bin.000001", 4),
    );
    Harness {
        dir,
        store: Arc::new(store),
        checkpoints,
        pipeline,
    }
}

fn settings() -> PumpSettings {
    PumpSettings {
        poll_interval: Duration::from_millis(5),
        checkpoint_interval: Duration::from_millis(20),
    }
}

/// 덤프를 작은 청크로 나눠 보내는 가짜 서브프로세스 출력
fn feed(text: &str, chunk_size: usize) -> mpsc::Receiver<mysqlbinlog_cdc::Result<Bytes>> {
    let chunks: Vec<Bytes> = text
        .as_bytes()
        .chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect();
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        for chunk in chunks {
            if tx.send(Ok(chunk)).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn collect(mut rx: mpsc::Receiver<RowChangeEvent>) -> Vec<RowChangeEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn streams_insert_update_delete_across_rotation() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(16);

    tokio_test::assert_ok!(
        pump(feed(DUMP, 97), h.store.clone(), &mut h.pipeline, &h.checkpoints, &tx, settings()).await
    );
    drop(tx);
    let events = collect(rx).await;

    let ops: Vec<OperationType> = events.iter().map(|e| e.op).collect();
    assert_eq!(
        ops,
        vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
    );

    let insert = &events[0];
    assert_eq!(insert.value, CellValue::Int64(1));
    assert_eq!(insert.source.get("col2"), Some(&CellValue::String("x".to_string())));
    assert_eq!((insert.file.as_str(), insert.position), ("mysql-bin.000001", 225));

    let update = &events[1];
    let after = update.update.as_ref().unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after.get("col2"), Some(&CellValue::String("y".to_string())));
    assert_eq!(update.value, CellValue::Int64(1));

    let delete = &events[2];
    assert_eq!((delete.database.as_str(), delete.table.as_str()), ("d", "t"));
    assert_eq!((delete.file.as_str(), delete.position), ("mysql-bin.000002", 225));

    let saved = h.checkpoints.load().await.unwrap();
    assert_eq!(saved, Some(Checkpoint::new("mysql-bin.000002", 225)));
    assert!(h.store.active_log() != "1000001.log");
}

#[tokio::test]
async fn subprocess_failure_still_drains_buffered_output() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(16);

    let first_transaction = &DUMP[..DUMP.find("# at 256").unwrap() + "# at 256\n".len()];
    let (out_tx, out_rx) = mpsc::channel(4);
    out_tx
        .send(Ok(Bytes::copy_from_slice(first_transaction.as_bytes())))
        .await
        .unwrap();
    out_tx
        .send(Err(CdcError::SubprocessError("connection lost".to_string())))
        .await
        .unwrap();
    drop(out_tx);

    let result = pump(out_rx, h.store.clone(), &mut h.pipeline, &h.checkpoints, &tx, settings()).await;
    assert!(matches!(result, Err(CdcError::SubprocessError(_))));
    drop(tx);

    let events = collect(rx).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].op, OperationType::Insert);
    assert_eq!(
        h.checkpoints.load().await.unwrap(),
        Some(Checkpoint::new("mysql-bin.000001", 225))
    );
}

#[tokio::test]
async fn closed_consumer_ends_pump() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(16);
    drop(rx);

    let result = pump(feed(DUMP, 4096), h.store.clone(), &mut h.pipeline, &h.checkpoints, &tx, settings()).await;
    assert!(matches!(result, Err(CdcError::ChannelClosed)));
}

#[tokio::test]
async fn restart_resumes_from_saved_checkpoint() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(16);
    tokio_test::assert_ok!(
        pump(feed(DUMP, 512), h.store.clone(), &mut h.pipeline, &h.checkpoints, &tx, settings()).await
    );
    drop(tx);
    assert_eq!(collect(rx).await.len(), 3);

    // 저장된 체크포인트로 새 파이프라인을 만들면 그 위치부터 추적한다
    let saved = h.checkpoints.load().await.unwrap().unwrap();
    let resumed = EventPipeline::new(catalog(), RowDecoder::default(), &saved);
    assert_eq!(resumed.tracker().checkpoint(), Some(saved));
    assert!(resumed.tracker().pending().is_none());
}

/// `--start-position=225`로 다시 띄운 mysqlbinlog 출력
const RESUMED_DUMP: &str = "\
# at 4
#700101  0:00:00 server id 1  end_log_pos 0 \tRotate to mysql-bin.000001  pos: 225
# at 4
#210101 10:00:00 server id 1  end_log_pos 126 CRC32 0x5fc5ea4d \tStart: binlog v 4, server v 8.0.22 created 210101 10:00:00
# at 126
# at 225
#210101 10:00:01 server id 1  end_log_pos 256 CRC32 0x0b7f6e3c \tXid = 12
COMMIT/*!*/;
";

#[tokio::test]
async fn reopened_store_replays_unfinished_event_once() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(16);

    // 첫 실행은 UPDATE 이벤트 도중에 출력이 끊긴다
    let cut = &DUMP[..DUMP.find("# at 370").unwrap()];
    tokio_test::assert_ok!(
        pump(feed(cut, 97), h.store.clone(), &mut h.pipeline, &h.checkpoints, &tx, settings()).await
    );
    drop(tx);
    let first = collect(rx).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].op, OperationType::Insert);
    let saved = h.checkpoints.load().await.unwrap().unwrap();
    assert_eq!(saved, Checkpoint::new("mysql-bin.000001", 225));
    drop(h.store);

    // 같은 디렉터리로 재시작: 읽기 위치 이후만 읽고, 체크포인트부터 다시 받은 출력을 처리한다
    let store = Arc::new(
        LogStore::open(&LogStoreConfig {
            dir: h.dir.path().join("logs"),
            rotate_bytes: 256,
        })
        .unwrap(),
    );
    let mut pipeline = EventPipeline::new(catalog(), RowDecoder::default(), &saved);
    let rest = &DUMP[DUMP.find("# at 256\n#210101 10:00:02").unwrap()..];
    let replay = format!("{}{}", RESUMED_DUMP, rest);

    let (tx, rx) = mpsc::channel(16);
    tokio_test::assert_ok!(
        pump(feed(&replay, 97), store, &mut pipeline, &h.checkpoints, &tx, settings()).await
    );
    drop(tx);
    let second = collect(rx).await;

    let seen: Vec<(OperationType, &str, u64)> = second
        .iter()
        .map(|e| (e.op, e.file.as_str(), e.position))
        .collect();
    assert_eq!(
        seen,
        vec![
            (OperationType::Update, "mysql-bin.000001", 370),
            (OperationType::Delete, "mysql-bin.000002", 225),
        ]
    );
    assert_eq!(
        second[0].update.as_ref().and_then(|after| after.get("col2")),
        Some(&CellValue::String("y".to_string()))
    );
    assert_eq!(
        h.checkpoints.load().await.unwrap(),
        Some(Checkpoint::new("mysql-bin.000002", 225))
    );
}
