//! MySQL 데이터베이스 연결 관리
//!
//! 스키마 조회(`information_schema.COLUMNS`)와 시작 위치 결정을 위한
//! `SHOW BINARY LOGS` 조회만 담당합니다. 변경 스트림 자체는 mysqlbinlog가 읽습니다.

use crate::error::{CdcError, Result};
use crate::offset::{file_sequence, Checkpoint};
use crate::schema::{Column, ColumnKey, SchemaSource};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row};
use tracing::{debug, info};

const COLUMNS_QUERY: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, ORDINAL_POSITION, \
     DATA_TYPE, IS_NULLABLE, COLUMN_KEY, CHARACTER_MAXIMUM_LENGTH, NUMERIC_PRECISION, NUMERIC_SCALE \
     FROM information_schema.COLUMNS";

/// MySQL 연결 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// `SHOW BINARY LOGS`의 한 행
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLogFile {
    pub name: String,
    pub size: u64,
}

/// 가장 최신(시퀀스 번호가 가장 큰) binlog 파일과 그 크기
pub fn newest_binlog(logs: &[BinaryLogFile]) -> Option<Checkpoint> {
    logs.iter()
        .max_by_key(|log| file_sequence(&log.name).unwrap_or(0))
        .map(|log| Checkpoint::new(log.name.clone(), log.size))
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    pool: Pool,
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let pool = Pool::new(config.build_opts());

        let conn = pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        info!("Connected to MySQL at {}:{}", config.hostname, config.port);
        Ok(MySqlConnection { pool, conn })
    }

    /// 모든 데이터베이스의 컬럼 메타데이터 조회
    pub async fn get_columns(&mut self) -> Result<Vec<Column>> {
        let rows: Vec<Row> = self
            .conn
            .query(COLUMNS_QUERY)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query columns: {}", e)))?;

        let columns = rows
            .into_iter()
            .map(column_from_row)
            .collect::<Result<Vec<_>>>()?;
        debug!("Fetched {} columns from information_schema", columns.len());
        Ok(columns)
    }

    /// 서버의 binlog 파일 목록 조회
    pub async fn get_binary_logs(&mut self) -> Result<Vec<BinaryLogFile>> {
        let rows: Vec<Row> = self
            .conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query binary logs: {}", e)))?;

        rows.into_iter()
            .map(|mut row| {
                Ok(BinaryLogFile {
                    name: take(&mut row, 0, "Log_name")?,
                    size: take(&mut row, 1, "File_size")?,
                })
            })
            .collect()
    }

    /// 체크포인트가 없을 때의 시작 위치: 최신 binlog 파일의 끝
    pub async fn newest_binlog(&mut self) -> Result<Checkpoint> {
        let logs = self.get_binary_logs().await?;
        newest_binlog(&logs)
            .ok_or_else(|| CdcError::QueryError("No binary logs available".to_string()))
    }

    pub async fn close(self) -> Result<()> {
        drop(self.conn);
        self.pool
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to disconnect: {}", e)))
    }
}

impl SchemaSource for MySqlConnection {
    async fn fetch_columns(&mut self) -> Result<Vec<Column>> {
        self.get_columns().await
    }
}

fn column_from_row(mut row: Row) -> Result<Column> {
    let data_type: String = take(&mut row, 4, "DATA_TYPE")?;
    let is_nullable: String = take(&mut row, 5, "IS_NULLABLE")?;
    let column_key: String = take(&mut row, 6, "COLUMN_KEY")?;

    Ok(Column {
        database: take(&mut row, 0, "TABLE_SCHEMA")?,
        table: take(&mut row, 1, "TABLE_NAME")?,
        name: take(&mut row, 2, "COLUMN_NAME")?,
        ordinal: take(&mut row, 3, "ORDINAL_POSITION")?,
        data_type: data_type.to_lowercase(),
        nullable: is_nullable == "YES",
        key: ColumnKey::parse(&column_key),
        char_max_length: take(&mut row, 7, "CHARACTER_MAXIMUM_LENGTH")?,
        numeric_precision: take(&mut row, 8, "NUMERIC_PRECISION")?,
        numeric_scale: take(&mut row, 9, "NUMERIC_SCALE")?,
    })
}

fn take<T: FromValue>(row: &mut Row, index: usize, name: &str) -> Result<T> {
    row.take_opt(index)
        .ok_or_else(|| CdcError::SchemaError(format!("Missing column {}", name)))?
        .map_err(|e| CdcError::SchemaError(format!("Invalid value in {}: {}", name, e)))
}
