//! 행 이벤트 본문 → 타입이 지정된 변경 이벤트
//!
//! 본문 블록은 `@1=<raw> @2=<raw> ...` 할당으로 이루어지며, UPDATE는
//! `### SET` 마커를 기준으로 변경 전(WHERE)과 변경 후(SET)로 나뉩니다.
//! 스키마를 찾지 못해도 이벤트는 버리지 않고 `@N` 키와 문자열 값으로 내보냅니다.

use crate::events::{CellValue, EventHead, OperationType, RowChangeEvent, TableMapEntry};
use crate::resolver::qualified_table;
use crate::schema::{Column, SchemaCatalog, TableSchema};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::debug;

const SET_MARKER: &str = "### SET";

/// 날짜 텍스트를 해석하지 못했을 때의 처리
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TemporalFallback {
    /// 원본 텍스트를 문자열 값으로 유지
    #[default]
    RawText,
    /// 현재 시각으로 대체 (결과가 실행 시점에 따라 달라짐)
    CurrentTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeFamily {
    Numeric,
    Temporal,
    Text,
}

fn type_family(data_type: &str) -> TypeFamily {
    match data_type {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "decimal"
        | "numeric" | "float" | "double" | "real" | "year" | "bit" => TypeFamily::Numeric,
        "date" | "datetime" | "timestamp" | "time" => TypeFamily::Temporal,
        _ => TypeFamily::Text,
    }
}

/// 스키마 기반 행 디코더
#[derive(Debug, Clone, Default)]
pub struct RowDecoder {
    temporal_fallback: TemporalFallback,
}

impl RowDecoder {
    pub fn new(temporal_fallback: TemporalFallback) -> Self {
        RowDecoder { temporal_fallback }
    }

    /// 행 이벤트의 블록 하나를 변경 이벤트로 변환
    ///
    /// `table`은 테이블 맵에서 찾은 항목이며, 없으면 블록의
    /// `` `db`.`table` `` 표기에서 복구한다. 행 이벤트가 아니면 `None`.
    pub fn decode(
        &self,
        head: &EventHead,
        block: &str,
        table: Option<&TableMapEntry>,
        schema: &SchemaCatalog,
    ) -> Option<RowChangeEvent> {
        let (op, table_id) = head.kind.row_operation()?;

        let (database, table) = match table {
            Some(entry) => (entry.database.clone(), entry.table.clone()),
            None => {
                let recovered = qualified_table(block).unwrap_or_default();
                debug!(
                    "Table id {} not mapped, recovered `{}`.`{}` from row block",
                    table_id, recovered.0, recovered.1
                );
                recovered
            }
        };
        let table_schema = schema.table(&database, &table);

        let (before, after) = match op {
            OperationType::Update => match block.find(SET_MARKER) {
                Some(idx) => (
                    parse_assignments(&block[..idx]),
                    parse_assignments(&block[idx + SET_MARKER.len()..]),
                ),
                None => (parse_assignments(block), Vec::new()),
            },
            OperationType::Insert | OperationType::Delete => (parse_assignments(block), Vec::new()),
        };

        let source = self.typed_row(&before, table_schema);
        let update = match op {
            OperationType::Update => {
                let unchanged: HashMap<u32, &str> =
                    before.iter().map(|(o, raw)| (*o, raw.as_str())).collect();
                let changed: Vec<(u32, String)> = after
                    .into_iter()
                    .filter(|(ordinal, raw)| unchanged.get(ordinal) != Some(&raw.as_str()))
                    .collect();
                Some(self.typed_row(&changed, table_schema))
            }
            _ => None,
        };

        let primary_key = table_schema.and_then(|t| t.primary_key()).map(str::to_string);
        let value = primary_key
            .as_ref()
            .and_then(|pk| {
                update
                    .as_ref()
                    .and_then(|u| u.get(pk))
                    .or_else(|| source.get(pk))
            })
            .cloned()
            .unwrap_or(CellValue::Int64(0));

        Some(RowChangeEvent {
            op,
            database,
            table,
            primary_key,
            unique_keys: table_schema
                .map(|t| t.unique_keys().to_vec())
                .unwrap_or_default(),
            source,
            update,
            value,
            timestamp: head.emitted_at,
            file: head.file.clone(),
            position: head.end_log_pos,
        })
    }

    fn typed_row(
        &self,
        assignments: &[(u32, String)],
        table: Option<&TableSchema>,
    ) -> HashMap<String, CellValue> {
        assignments
            .iter()
            .map(|(ordinal, raw)| match table.and_then(|t| t.column_at(*ordinal)) {
                Some(column) => (column.name.clone(), self.convert(column, raw)),
                None => (format!("@{}", ordinal), CellValue::String(unquote(raw).to_string())),
            })
            .collect()
    }

    /// 컬럼 타입에 맞게 원본 텍스트 변환
    pub fn convert(&self, column: &Column, raw: &str) -> CellValue {
        if raw == "NULL" && column.nullable {
            return CellValue::Null;
        }
        let value = unquote(raw);
        match type_family(&column.data_type) {
            TypeFamily::Numeric => {
                parse_number(value).unwrap_or_else(|| CellValue::String(value.to_string()))
            }
            TypeFamily::Temporal => self.parse_temporal(&column.data_type, value),
            TypeFamily::Text => CellValue::String(value.to_string()),
        }
    }

    fn parse_temporal(&self, data_type: &str, value: &str) -> CellValue {
        if value.len() <= 2 {
            return CellValue::DateTime(DateTime::<Utc>::UNIX_EPOCH);
        }

        let epoch_date = DateTime::<Utc>::UNIX_EPOCH.date_naive();
        let parsed = match data_type {
            "date" => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
            "time" => NaiveTime::parse_from_str(value, "%H:%M:%S%.f")
                .ok()
                .map(|t| epoch_date.and_time(t)),
            "timestamp" if value.bytes().all(|b| b.is_ascii_digit()) => value
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|dt| dt.naive_utc()),
            _ => NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(value, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                }),
        };

        match (parsed, self.temporal_fallback) {
            (Some(naive), _) => CellValue::DateTime(Utc.from_utc_datetime(&naive)),
            (None, TemporalFallback::CurrentTime) => CellValue::DateTime(Utc::now()),
            (None, TemporalFallback::RawText) => {
                debug!("Unparseable {} value '{}', keeping raw text", data_type, value);
                CellValue::String(value.to_string())
            }
        }
    }
}

/// `'abc'` → `abc`
fn unquote(raw: &str) -> &str {
    raw.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw)
}

fn parse_number(value: &str) -> Option<CellValue> {
    let unsigned = value.strip_prefix('-').unwrap_or(value);
    let is_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    if is_digits(unsigned) {
        return value
            .parse::<i64>()
            .ok()
            .map(CellValue::Int64)
            .or_else(|| value.parse::<u64>().ok().map(CellValue::UInt64));
    }
    match unsigned.split_once('.') {
        Some((int, frac)) if is_digits(int) && is_digits(frac) => {
            value.parse::<f64>().ok().map(CellValue::Double)
        }
        _ => None,
    }
}

/// 블록 텍스트의 `@N=<raw>` 할당들을 순서대로 추출
///
/// 한 라인에 여러 할당이 있어도 되고 `###` 접두어나 `-vv`의
/// `/* INT meta=0 ... */` 주석이 붙어 있어도 된다.
pub fn parse_assignments(text: &str) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut rest = line;
        while let Some(start) = seek_assignment(rest) {
            let Some((ordinal, after)) = assignment_head(start) else {
                break;
            };
            let (raw, remainder) = take_value(after);
            out.push((ordinal, raw.to_string()));
            rest = remainder;
        }
    }
    out
}

/// 토큰 경계에서 시작하는 첫 `@N=` 위치
fn seek_assignment(s: &str) -> Option<&str> {
    s.char_indices()
        .filter(|&(i, c)| {
            c == '@' && s[..i].chars().next_back().map_or(true, char::is_whitespace)
        })
        .map(|(i, _)| &s[i..])
        .find(|tail| assignment_head(tail).is_some())
}

/// `@12=...` → (12, "...")
fn assignment_head(s: &str) -> Option<(u32, &str)> {
    let body = s.strip_prefix('@')?;
    let digits = body.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let ordinal = body[..digits].parse().ok()?;
    let after = body[digits..].strip_prefix('=')?;
    Some((ordinal, after))
}

/// 값 하나와 나머지 텍스트. 따옴표 문자열은 `\'` 이스케이프를 고려한다
fn take_value(s: &str) -> (&str, &str) {
    if s.starts_with('\'') {
        let bytes = s.as_bytes();
        let mut i = 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'\'' => return (&s[..=i], skip_comment(&s[i + 1..])),
                _ => i += 1,
            }
        }
        return (s.trim_end(), "");
    }

    let end = s
        .char_indices()
        .find(|&(i, c)| {
            c.is_whitespace() && {
                let tail = s[i..].trim_start();
                tail.starts_with("/*") || assignment_head(tail).is_some()
            }
        })
        .map_or(s.len(), |(i, _)| i);
    (s[..end].trim(), skip_comment(&s[end..]))
}

fn skip_comment(s: &str) -> &str {
    let s = s.trim_start();
    match s.strip_prefix("/*") {
        Some(comment) => comment.find("*/").map_or("", |end| &comment[end + 2..]),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::schema::tests::{column, sample_catalog};
    use crate::schema::ColumnKey;

    fn head(kind: EventKind) -> EventHead {
        EventHead {
            emitted_at: Utc.with_ymd_and_hms(2021, 1, 1, 10, 0, 0).unwrap(),
            end_log_pos: 500,
            server_id: 1,
            kind,
            file: "mysql-bin.000001".to_string(),
            raw: String::new(),
        }
    }

    fn insert_head() -> EventHead {
        head(EventKind::WriteRows {
            table_id: 10,
            statement_end: true,
        })
    }

    fn update_head() -> EventHead {
        head(EventKind::UpdateRows {
            table_id: 10,
            statement_end: true,
        })
    }

    fn entry() -> TableMapEntry {
        TableMapEntry {
            database: "d".to_string(),
            table: "t".to_string(),
        }
    }

    fn string(s: &str) -> CellValue {
        CellValue::String(s.to_string())
    }

    #[test]
    fn test_parse_assignments_inline_and_prefixed() {
        assert_eq!(
            parse_assignments("@1=1 @2='x'"),
            vec![(1, "1".to_string()), (2, "'x'".to_string())]
        );
        assert_eq!(
            parse_assignments("### SET\n###   @1=7 /* INT meta=0 nullable=0 is_null=0 */\n###   @2='a b @3=c'"),
            vec![(1, "7".to_string()), (2, "'a b @3=c'".to_string())]
        );
        assert_eq!(
            parse_assignments("###   @3='it\\'s'"),
            vec![(3, "'it\\'s'".to_string())]
        );
        assert!(parse_assignments("### INSERT INTO `d`.`t`").is_empty());
    }

    #[test]
    fn test_insert_scenario() {
        let decoder = RowDecoder::default();
        let event = decoder
            .decode(
                &insert_head(),
                "### INSERT INTO `d`.`t`\n@1=1 @2='x'",
                Some(&entry()),
                &sample_catalog(),
            )
            .unwrap();

        assert_eq!(event.op, OperationType::Insert);
        assert_eq!(event.database, "d");
        assert_eq!(event.table, "t");
        assert_eq!(event.primary_key.as_deref(), Some("col1"));
        assert_eq!(event.source.get("col1"), Some(&CellValue::Int64(1)));
        assert_eq!(event.source.get("col2"), Some(&string("x")));
        assert_eq!(event.source.len(), 2);
        assert!(event.update.is_none());
        assert_eq!(event.value, CellValue::Int64(1));
        assert_eq!(event.position, 500);
        assert_eq!(event.file, "mysql-bin.000001");
    }

    #[test]
    fn test_update_scenario_drops_unchanged_columns() {
        let decoder = RowDecoder::default();
        let event = decoder
            .decode(
                &update_head(),
                "### UPDATE `d`.`t`\n@1=1 @2='x' ### SET @1=1 @2='y'",
                Some(&entry()),
                &sample_catalog(),
            )
            .unwrap();

        assert_eq!(event.source.get("col1"), Some(&CellValue::Int64(1)));
        assert_eq!(event.source.get("col2"), Some(&string("x")));
        let update = event.update.unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update.get("col2"), Some(&string("y")));
        assert_eq!(event.value, CellValue::Int64(1));
    }

    #[test]
    fn test_value_prefers_changed_primary_key() {
        let decoder = RowDecoder::default();
        let event = decoder
            .decode(
                &update_head(),
                "### UPDATE `d`.`t`\n### WHERE\n###   @1=1\n###   @2='x'\n### SET\n###   @1=2\n###   @2='x'",
                Some(&entry()),
                &sample_catalog(),
            )
            .unwrap();

        let update = event.update.unwrap();
        assert_eq!(update.get("col1"), Some(&CellValue::Int64(2)));
        assert!(!update.contains_key("col2"));
        assert_eq!(event.value, CellValue::Int64(2));
    }

    #[test]
    fn test_delete_without_schema_keeps_raw_columns() {
        let decoder = RowDecoder::default();
        let event = decoder
            .decode(
                &head(EventKind::DeleteRows {
                    table_id: 99,
                    statement_end: true,
                }),
                "### DELETE FROM `other`.`log`\n### WHERE\n###   @1=5\n###   @2='gone'",
                None,
                &sample_catalog(),
            )
            .unwrap();

        assert_eq!(event.op, OperationType::Delete);
        assert_eq!(event.database, "other");
        assert_eq!(event.table, "log");
        assert_eq!(event.primary_key, None);
        assert_eq!(event.source.get("@1"), Some(&string("5")));
        assert_eq!(event.source.get("@2"), Some(&string("gone")));
        assert_eq!(event.value, CellValue::Int64(0));
    }

    #[test]
    fn test_unresolvable_table_is_still_emitted() {
        let decoder = RowDecoder::default();
        let event = decoder
            .decode(&insert_head(), "@1=1", None, &sample_catalog())
            .unwrap();
        assert_eq!(event.database, "");
        assert_eq!(event.table, "");
        assert_eq!(event.source.get("@1"), Some(&string("1")));
    }

    #[test]
    fn test_non_row_event_is_ignored() {
        let decoder = RowDecoder::default();
        let xid = head(EventKind::Xid { xid: 1 });
        assert!(decoder.decode(&xid, "@1=1", Some(&entry()), &sample_catalog()).is_none());
    }

    #[test]
    fn test_null_depends_on_nullable() {
        let decoder = RowDecoder::default();
        let nullable = column("t", "note", 3, "varchar", ColumnKey::None);
        let not_null = column("t", "id", 1, "int", ColumnKey::Primary);

        assert_eq!(decoder.convert(&nullable, "NULL"), CellValue::Null);
        assert_eq!(decoder.convert(&not_null, "NULL"), string("NULL"));
    }

    #[test]
    fn test_numeric_conversion() {
        let decoder = RowDecoder::default();
        let amount = column("t", "amount", 1, "decimal", ColumnKey::None);

        assert_eq!(decoder.convert(&amount, "42"), CellValue::Int64(42));
        assert_eq!(decoder.convert(&amount, "-7"), CellValue::Int64(-7));
        assert_eq!(decoder.convert(&amount, "12.50"), CellValue::Double(12.5));
        assert_eq!(
            decoder.convert(&amount, "18446744073709551615"),
            CellValue::UInt64(u64::MAX)
        );
        assert_eq!(decoder.convert(&amount, "1e5"), string("1e5"));
    }

    #[test]
    fn test_temporal_conversion() {
        let decoder = RowDecoder::default();
        let created = column("t", "created_at", 1, "datetime", ColumnKey::None);
        let day = column("t", "day", 2, "date", ColumnKey::None);
        let ts = column("t", "ts", 3, "timestamp", ColumnKey::None);
        let at = column("t", "at", 4, "time", ColumnKey::None);

        assert_eq!(
            decoder.convert(&created, "'2021-01-01 10:00:00'"),
            CellValue::DateTime(Utc.with_ymd_and_hms(2021, 1, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(
            decoder.convert(&day, "'2021-03-04'"),
            CellValue::DateTime(Utc.with_ymd_and_hms(2021, 3, 4, 0, 0, 0).unwrap())
        );
        assert_eq!(
            decoder.convert(&ts, "1609495200"),
            CellValue::DateTime(Utc.with_ymd_and_hms(2021, 1, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(
            decoder.convert(&at, "'12:30:00'"),
            CellValue::DateTime(Utc.with_ymd_and_hms(1970, 1, 1, 12, 30, 0).unwrap())
        );
        assert_eq!(
            decoder.convert(&created, "''"),
            CellValue::DateTime(DateTime::<Utc>::UNIX_EPOCH)
        );
    }

    #[test]
    fn test_invalid_temporal_fallback() {
        let created = column("t", "created_at", 1, "datetime", ColumnKey::None);

        let raw = RowDecoder::default();
        assert_eq!(
            raw.convert(&created, "'0000-00-00 00:00:00'"),
            string("0000-00-00 00:00:00")
        );

        let now = RowDecoder::new(TemporalFallback::CurrentTime);
        let before = Utc::now();
        match now.convert(&created, "'0000-00-00 00:00:00'") {
            CellValue::DateTime(dt) => assert!(dt >= before),
            other => panic!("expected date-time, got {:?}", other),
        }
    }

    #[test]
    fn test_unique_keys_attached() {
        let catalog = SchemaCatalog::from_columns(vec![
            column("users", "id", 1, "int", ColumnKey::Primary),
            column("users", "email", 2, "varchar", ColumnKey::Unique),
        ]);
        let event = RowDecoder::default()
            .decode(
                &insert_head(),
                "### INSERT INTO `d`.`users`\n### SET\n###   @1=3\n###   @2='a@b.c'",
                None,
                &catalog,
            )
            .unwrap();
        assert_eq!(event.unique_keys, vec!["email".to_string()]);
        assert_eq!(event.source.get("email"), Some(&string("a@b.c")));
        assert_eq!(event.value, CellValue::Int64(3));
    }
}
