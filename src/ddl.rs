//! MySQL 테이블 스키마 → PostgreSQL CREATE TABLE 변환

use crate::schema::{Column, TableSchema};

/// 테이블 스키마를 `target` 이름의 PostgreSQL CREATE TABLE 문으로 변환
pub fn translate_create_table(schema: &TableSchema, target: &str) -> String {
    let mut lines: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| {
            let mut line = format!("  \"{}\" {}", c.name, postgres_type(c));
            if !c.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();

    let keys: Vec<String> = schema
        .primary_key_columns()
        .map(|c| format!("\"{}\"", c.name))
        .collect();
    if !keys.is_empty() {
        lines.push(format!("  PRIMARY KEY ({})", keys.join(", ")));
    }

    format!("CREATE TABLE {} (\n{}\n);", target, lines.join(",\n"))
}

fn postgres_type(column: &Column) -> String {
    match column.data_type.as_str() {
        "tinyint" | "smallint" | "year" => "SMALLINT".to_string(),
        "mediumint" | "int" | "integer" => "INTEGER".to_string(),
        "bigint" => "BIGINT".to_string(),
        "float" => "REAL".to_string(),
        "double" | "real" => "DOUBLE PRECISION".to_string(),
        "decimal" | "numeric" => match (column.numeric_precision, column.numeric_scale) {
            (Some(p), Some(s)) => format!("NUMERIC({}, {})", p, s),
            (Some(p), None) => format!("NUMERIC({})", p),
            _ => "NUMERIC".to_string(),
        },
        "char" => match column.char_max_length {
            Some(len) => format!("CHAR({})", len),
            None => "CHAR".to_string(),
        },
        "varchar" => match column.char_max_length {
            Some(len) => format!("VARCHAR({})", len),
            None => "TEXT".to_string(),
        },
        "tinytext" | "text" | "mediumtext" | "longtext" | "enum" | "set" => "TEXT".to_string(),
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            "BYTEA".to_string()
        }
        "bit" => "BIT VARYING".to_string(),
        "date" => "DATE".to_string(),
        "time" => "TIME".to_string(),
        "datetime" => "TIMESTAMP".to_string(),
        "timestamp" => "TIMESTAMPTZ".to_string(),
        "json" => "JSONB".to_string(),
        _ => "TEXT".to_string(),
    }
}
