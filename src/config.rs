//! CDC 엔진 설정
//!
//! 기본값은 `Default`, 실행 환경에서는 `from_env()`로 환경 변수를 읽습니다.

use crate::connection::ConnectionConfig;
use crate::decoder::TemporalFallback;
use crate::error::{CdcError, Result};
use crate::log_store::LogStoreConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// CDC 엔진 설정
#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    /// mysqlbinlog 실행 파일 경로
    pub mysqlbinlog_path: PathBuf,
    pub log_store: LogStoreConfig,
    /// 체크포인트 JSON 파일 경로
    pub checkpoint_file: PathBuf,
    /// 로그 저장소 폴링 주기
    pub poll_interval: Duration,
    /// 주기적 체크포인트 저장 간격
    pub checkpoint_interval: Duration,
    pub temporal_fallback: TemporalFallback,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            connection: ConnectionConfig::default(),
            mysqlbinlog_path: PathBuf::from("mysqlbinlog"),
            log_store: LogStoreConfig::default(),
            checkpoint_file: PathBuf::from("checkpoint.json"),
            poll_interval: Duration::from_millis(50),
            checkpoint_interval: Duration::from_secs(3),
            temporal_fallback: TemporalFallback::default(),
        }
    }
}

impl CdcConfig {
    /// 환경 변수에서 설정 읽기 (없는 값은 기본값)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// `lookup`으로 값을 찾아 설정 구성
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CdcConfig::default();

        let connection = ConnectionConfig {
            hostname: lookup("DB_HOST").unwrap_or(defaults.connection.hostname),
            port: parse_var(&lookup, "DB_PORT")?.unwrap_or(defaults.connection.port),
            username: lookup("DB_USER").unwrap_or(defaults.connection.username),
            password: lookup("DB_PASSWORD").unwrap_or(defaults.connection.password),
            database: lookup("DB_NAME").filter(|db| !db.is_empty()),
        };

        let log_store = LogStoreConfig {
            dir: lookup("CDC_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_store.dir),
            rotate_bytes: parse_var(&lookup, "CDC_ROTATE_BYTES")?
                .unwrap_or(defaults.log_store.rotate_bytes),
        };

        let temporal_fallback = match lookup("CDC_TEMPORAL_FALLBACK").as_deref() {
            None | Some("raw") => TemporalFallback::RawText,
            Some("now") => TemporalFallback::CurrentTime,
            Some(other) => {
                return Err(CdcError::ConfigError(format!(
                    "CDC_TEMPORAL_FALLBACK must be 'raw' or 'now', got '{}'",
                    other
                )))
            }
        };

        Ok(CdcConfig {
            connection,
            mysqlbinlog_path: lookup("MYSQLBINLOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.mysqlbinlog_path),
            log_store,
            checkpoint_file: lookup("CDC_CHECKPOINT_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_file),
            poll_interval: parse_var(&lookup, "CDC_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            checkpoint_interval: parse_var(&lookup, "CDC_CHECKPOINT_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.checkpoint_interval),
            temporal_fallback,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CdcError::ConfigError(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(None),
    }
}
