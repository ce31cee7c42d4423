//! mysqlbinlog 텍스트 이벤트 및 변경 이벤트 데이터 구조 정의

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 이벤트 종류별 확장 필드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// 포맷 디스크립션 이벤트 (`Start: binlog v 4, ...`)
    FormatDescription { description: String },
    /// GTID 이벤트 (익명 GTID 포함)
    Gtid {
        last_committed: u64,
        sequence_number: u64,
    },
    /// 이전 GTID 집합 이벤트
    PreviousGtids,
    /// 쿼리 이벤트 (BEGIN, DDL 등)
    Query {
        thread_id: u64,
        exec_time: u64,
        error_code: u64,
    },
    /// 테이블 맵 이벤트
    TableMap {
        table_id: u64,
        database: String,
        table: String,
    },
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRows { table_id: u64, statement_end: bool },
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRows { table_id: u64, statement_end: bool },
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRows { table_id: u64, statement_end: bool },
    /// 트랜잭션 커밋
    Xid { xid: u64 },
    /// 로테이션 이벤트 (새 binlog 파일)
    Rotate { file: String, position: u64 },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FormatDescription { .. } => "format_description",
            EventKind::Gtid { .. } => "gtid",
            EventKind::PreviousGtids => "previous_gtids",
            EventKind::Query { .. } => "query",
            EventKind::TableMap { .. } => "table_map",
            EventKind::WriteRows { .. } => "write_rows",
            EventKind::UpdateRows { .. } => "update_rows",
            EventKind::DeleteRows { .. } => "delete_rows",
            EventKind::Xid { .. } => "xid",
            EventKind::Rotate { .. } => "rotate",
        }
    }

    /// 행 변경 이벤트라면 (연산 타입, 테이블 ID) 반환
    pub fn row_operation(&self) -> Option<(OperationType, u64)> {
        match *self {
            EventKind::WriteRows { table_id, .. } => Some((OperationType::Insert, table_id)),
            EventKind::UpdateRows { table_id, .. } => Some((OperationType::Update, table_id)),
            EventKind::DeleteRows { table_id, .. } => Some((OperationType::Delete, table_id)),
            _ => None,
        }
    }
}

/// 헤더 라인에서 읽어낸 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHead {
    /// 이벤트 발생 시각
    pub emitted_at: DateTime<Utc>,
    /// 다음 이벤트 위치 (end_log_pos)
    pub end_log_pos: u64,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 종류 및 확장 필드
    pub kind: EventKind,
    /// 이벤트가 속한 binlog 파일명
    pub file: String,
    /// 원본 헤더 라인
    pub raw: String,
}

/// 종결자까지 읽힌 완성된 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub head: EventHead,
    /// `### INSERT|UPDATE|DELETE` 단위로 나뉜 본문 블록 (행 이벤트만)
    pub blocks: Vec<String>,
}

/// 테이블 ID에 매핑된 테이블
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEntry {
    pub database: String,
    pub table: String,
}

/// 셀 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

/// CDC 행 변경 이벤트 (application-level view)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    /// 연산 타입
    pub op: OperationType,
    /// 데이터베이스명 (해석 실패 시 빈 문자열)
    pub database: String,
    /// 테이블명 (해석 실패 시 빈 문자열)
    pub table: String,
    /// 기본 키 컬럼명
    pub primary_key: Option<String>,
    /// 유니크 키 컬럼명들
    pub unique_keys: Vec<String>,
    /// 변경 전 데이터 (INSERT는 삽입된 행)
    pub source: HashMap<String, CellValue>,
    /// 변경된 컬럼만 담은 변경 후 데이터 (UPDATE 전용)
    pub update: Option<HashMap<String, CellValue>>,
    /// 행의 기본 키 값
    pub value: CellValue,
    /// 이벤트 발생 시각
    pub timestamp: DateTime<Utc>,
    /// binlog 파일명
    pub file: String,
    /// binlog 위치 (end_log_pos)
    pub position: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_operation() {
        let kind = EventKind::UpdateRows {
            table_id: 7,
            statement_end: true,
        };
        assert_eq!(kind.row_operation(), Some((OperationType::Update, 7)));
        assert_eq!(EventKind::Xid { xid: 1 }.row_operation(), None);
    }

    #[test]
    fn test_cell_value_serializes_untagged() {
        let json = serde_json::to_value(CellValue::Int64(42)).unwrap();
        assert_eq!(json, serde_json::json!(42));
        let json = serde_json::to_value(CellValue::Null).unwrap();
        assert!(json.is_null());
    }
}
