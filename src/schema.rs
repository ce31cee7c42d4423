//! 스키마 카탈로그 - database → table → column 메타데이터 캐시
//!
//! 프로세스 시작 시 한 번 로드하고 이후로는 갱신하지 않습니다.
//! 로드 이후의 스키마 변경은 감지하지 않습니다.

use crate::ddl;
use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info};

/// `information_schema.COLUMNS.COLUMN_KEY`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnKey {
    #[default]
    None,
    Primary,
    Unique,
    Multiple,
}

impl ColumnKey {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PRI" => ColumnKey::Primary,
            "UNI" => ColumnKey::Unique,
            "MUL" => ColumnKey::Multiple,
            _ => ColumnKey::None,
        }
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Column {
    pub database: String,
    pub table: String,
    pub name: String,
    /// 1부터 시작하는 컬럼 순서 (`@1`, `@2`, ...)
    pub ordinal: u32,
    /// 소문자 DATA_TYPE (e.g., "varchar", "bigint")
    pub data_type: String,
    pub nullable: bool,
    pub key: ColumnKey,
    pub char_max_length: Option<u64>,
    pub numeric_precision: Option<u64>,
    pub numeric_scale: Option<u64>,
}

/// 한 테이블의 컬럼들과 키 정보
#[derive(Debug, Clone)]
pub struct TableSchema {
    columns: Vec<Column>,
    by_ordinal: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
    primary_key: Option<String>,
    unique_keys: Vec<String>,
}

impl TableSchema {
    pub fn new(mut columns: Vec<Column>) -> Self {
        columns.sort_by_key(|c| c.ordinal);

        let by_ordinal = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.ordinal, i))
            .collect();
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        // 복합 키인 경우 첫 번째 컬럼을 대표 키로 사용
        let primary_key = columns
            .iter()
            .find(|c| c.key == ColumnKey::Primary)
            .map(|c| c.name.clone());
        let unique_keys = columns
            .iter()
            .filter(|c| c.key == ColumnKey::Unique)
            .map(|c| c.name.clone())
            .collect();

        TableSchema {
            columns,
            by_ordinal,
            by_name,
            primary_key,
            unique_keys,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn column_at(&self, ordinal: u32) -> Option<&Column> {
        self.by_ordinal.get(&ordinal).map(|&i| &self.columns[i])
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    /// 기본 키를 구성하는 모든 컬럼 (순서대로)
    pub fn primary_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.key == ColumnKey::Primary)
    }

    pub fn unique_keys(&self) -> &[String] {
        &self.unique_keys
    }
}

/// database → table → schema
pub type SchemaMap = HashMap<String, HashMap<String, TableSchema>>;

/// 컬럼 메타데이터 공급자
pub trait SchemaSource {
    fn fetch_columns(&mut self) -> impl Future<Output = Result<Vec<Column>>> + Send;
}

/// 지연 로드되는 스키마 캐시
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    databases: Option<SchemaMap>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 이미 조회된 컬럼 목록으로 카탈로그 구성
    pub fn from_columns(columns: Vec<Column>) -> Self {
        SchemaCatalog {
            databases: Some(group_columns(columns)),
        }
    }

    /// 처음 호출될 때만 source에서 조회하고 이후로는 캐시를 반환
    pub async fn load<S: SchemaSource>(&mut self, source: &mut S) -> Result<&SchemaMap> {
        if self.databases.is_none() {
            let columns = source.fetch_columns().await?;
            let databases = group_columns(columns);
            info!(
                "Loaded schema: {} databases, {} tables",
                databases.len(),
                databases.values().map(|t| t.len()).sum::<usize>()
            );
            self.databases = Some(databases);
        } else {
            debug!("Schema already loaded, using cache");
        }
        Ok(self.databases.get_or_insert_with(HashMap::new))
    }

    /// 캐시를 버리고 다시 로드
    pub async fn reload<S: SchemaSource>(&mut self, source: &mut S) -> Result<&SchemaMap> {
        self.databases = None;
        self.load(source).await
    }

    pub fn is_loaded(&self) -> bool {
        self.databases.is_some()
    }

    pub fn table(&self, database: &str, table: &str) -> Option<&TableSchema> {
        self.databases.as_ref()?.get(database)?.get(table)
    }

    pub fn column(&self, database: &str, table: &str, column: &str) -> Option<&Column> {
        self.table(database, table)?.column(column)
    }

    pub fn table_count(&self) -> usize {
        self.databases
            .as_ref()
            .map(|d| d.values().map(|t| t.len()).sum())
            .unwrap_or(0)
    }

    /// 테이블 스키마를 PostgreSQL CREATE TABLE 문으로 변환
    pub fn create_table_ddl(&self, database: &str, table: &str, target: &str) -> Option<String> {
        self.table(database, table)
            .map(|schema| ddl::translate_create_table(schema, target))
    }
}

fn group_columns(columns: Vec<Column>) -> SchemaMap {
    let mut grouped: HashMap<String, HashMap<String, Vec<Column>>> = HashMap::new();
    for column in columns {
        grouped
            .entry(column.database.clone())
            .or_default()
            .entry(column.table.clone())
            .or_default()
            .push(column);
    }

    grouped
        .into_iter()
        .map(|(database, tables)| {
            let tables = tables
                .into_iter()
                .map(|(table, columns)| (table, TableSchema::new(columns)))
                .collect();
            (database, tables)
        })
        .collect()
}
