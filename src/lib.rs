//! mysqlbinlog 텍스트 출력 기반 MySQL CDC (Change Data Capture)
//!
//! `mysqlbinlog -R --stop-never -v` 출력을 읽어 행 단위 변경 이벤트를 만듭니다.
//! 주요 기능:
//! - 서브프로세스 출력의 로컬 로그 버퍼링 (로테이션 및 재개)
//! - 텍스트 이벤트 해석 (헤더 / 종결자 / 위치 보정)
//! - 스키마 기반 행 디코딩 및 UPDATE 변경 컬럼 추출
//! - 체크포인트 저장 및 재시작

pub mod cdc_engine;
pub mod config;
pub mod connection;
pub mod ddl;
pub mod decoder;
pub mod dump;
pub mod error;
pub mod events;
pub mod log_store;
pub mod offset;
pub mod resolver;
pub mod schema;

pub use cdc_engine::{CdcEngine, EventPipeline};
pub use config::CdcConfig;
pub use connection::MySqlConnection;
pub use error::{CdcError, Result};
pub use events::{CellValue, EventKind, OperationType, RowChangeEvent};
pub use log_store::LogStore;
pub use offset::{Checkpoint, CheckpointStore};
pub use schema::SchemaCatalog;
