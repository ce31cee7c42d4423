//! mysqlbinlog 텍스트 출력 → 이벤트 변환기
//!
//! `mysqlbinlog -v` 출력은 다음과 같은 형태입니다:
//!
//! ```text
//! # at 404
//! #210101 10:00:01 server id 1  end_log_pos 450 CRC32 0x6d6f7a12 	Write_rows: table id 10 flags: STMT_END_F
//! BINLOG '...'/*!*/;
//! ### INSERT INTO `d`.`t`
//! ### SET
//! ###   @1=1
//! # at 450
//! ```
//!
//! 헤더 라인이 이벤트를 열고, `# at <end_log_pos + offset_correction>` 라인이 닫습니다.
//! 상태는 두 가지뿐입니다:
//!   - `AwaitingHeader`: 완성된 라인 중 헤더를 찾는다. 다른 라인은 버린다.
//!   - `AwaitingTerminator`: 헤더 이후 라인에서 종결자를 찾는다.
//!     종결자가 아직 버퍼에 없으면 아무것도 소비하지 않고 다음 데이터를 기다린다.
//!
//! 청크 경계가 이벤트 중간을 잘라도 결과는 같습니다.

use crate::events::{EventHead, EventKind, ResolvedEvent};
use bytes::{Buf, BytesMut};
use chrono::{NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, trace, warn};

enum ResolverState {
    AwaitingHeader,
    AwaitingTerminator {
        head: EventHead,
        /// 기대 위치와 다른 마지막 `# at` 라인의 시작 오프셋
        last_at: Option<usize>,
    },
}

enum Scan {
    Closed {
        body_end: usize,
        consumed: usize,
        terminator: Option<u64>,
    },
    Pending {
        last_at: Option<usize>,
    },
}

/// 상태를 가진 텍스트 이벤트 파서
pub struct EventResolver {
    buffer: BytesMut,
    state: ResolverState,
    /// 아직 완성되지 않은 라인의 시작 (다음 스캔 재개 지점)
    scan_from: usize,
    offset_correction: Option<i64>,
    file: String,
    mismatch_reported: bool,
}

impl Default for EventResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl EventResolver {
    pub fn new() -> Self {
        EventResolver {
            buffer: BytesMut::new(),
            state: ResolverState::AwaitingHeader,
            scan_from: 0,
            offset_correction: None,
            file: String::new(),
            mismatch_reported: false,
        }
    }

    /// 시작 파일을 알고 있는 경우 (rotate 이벤트가 오면 덮어씀)
    pub fn with_file(file: impl Into<String>) -> Self {
        EventResolver {
            file: file.into(),
            ..Self::new()
        }
    }

    /// 새 데이터 추가
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn current_file(&self) -> &str {
        &self.file
    }

    pub fn offset_correction(&self) -> Option<i64> {
        self.offset_correction
    }

    /// 아직 이벤트로 소비되지 않은 바이트 수
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// 버퍼에서 완성된 다음 이벤트를 꺼낸다. 없으면 `None`
    pub fn next_event(&mut self) -> Option<ResolvedEvent> {
        loop {
            match std::mem::replace(&mut self.state, ResolverState::AwaitingHeader) {
                ResolverState::AwaitingHeader => {
                    let head = self.scan_header()?;
                    self.state = ResolverState::AwaitingTerminator {
                        head,
                        last_at: None,
                    };
                }
                ResolverState::AwaitingTerminator { head, last_at } => {
                    match self.scan_terminator(&head, last_at) {
                        Scan::Closed {
                            body_end,
                            consumed,
                            terminator,
                        } => return Some(self.complete(head, body_end, consumed, terminator)),
                        Scan::Pending { last_at } => {
                            self.state = ResolverState::AwaitingTerminator { head, last_at };
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// 완성된 이벤트를 모두 꺼낸다
    pub fn drain(&mut self) -> Vec<ResolvedEvent> {
        std::iter::from_fn(|| self.next_event()).collect()
    }

    fn scan_header(&mut self) -> Option<EventHead> {
        let mut pos = 0;
        while let Some(len) = find_newline(&self.buffer[pos..]) {
            let end = pos + len;
            let parsed = {
                let line = String::from_utf8_lossy(trim_cr(&self.buffer[pos..end]));
                parse_header(&line, &self.file)
            };
            if let Some(head) = parsed {
                self.buffer.advance(end + 1);
                self.scan_from = 0;
                if let EventKind::Rotate { file, .. } = &head.kind {
                    debug!("Rotate to {}", file);
                    self.file = file.clone();
                }
                return Some(head);
            }
            pos = end + 1;
        }

        // 헤더가 아닌 완성된 라인은 버린다
        self.buffer.advance(pos);
        self.scan_from = 0;
        None
    }

    fn expected_terminator(&self, head: &EventHead) -> Option<u64> {
        self.offset_correction
            .map(|c| (head.end_log_pos as i64 + c).max(0) as u64)
    }

    fn scan_terminator(&mut self, head: &EventHead, mut last_at: Option<usize>) -> Scan {
        let expected = self.expected_terminator(head);
        let mut pos = self.scan_from;

        while let Some(len) = find_newline(&self.buffer[pos..]) {
            let end = pos + len;
            let line = trim_cr(&self.buffer[pos..end]);

            if let Some(at) = parse_at_line(line) {
                if expected.map_or(true, |e| e == at) {
                    return Scan::Closed {
                        body_end: pos,
                        consumed: end + 1,
                        terminator: Some(at),
                    };
                }
                last_at = Some(pos);
            } else if is_header_line(line) {
                // 다음 헤더가 보이면 현재 이벤트는 이미 끝난 것
                self.report_mismatch(head, expected);
                return Scan::Closed {
                    body_end: last_at.unwrap_or(pos),
                    consumed: pos,
                    terminator: None,
                };
            }
            pos = end + 1;
        }

        self.scan_from = pos;
        Scan::Pending { last_at }
    }

    fn report_mismatch(&mut self, head: &EventHead, expected: Option<u64>) {
        if matches!(head.kind, EventKind::Rotate { .. }) || self.mismatch_reported {
            debug!(
                "Event {} at end_log_pos {} closed by next header (expected # at {:?})",
                head.kind.as_str(),
                head.end_log_pos,
                expected
            );
            return;
        }
        self.mismatch_reported = true;
        warn!(
            "Terminator # at {:?} not found for {} event (end_log_pos {}, offset correction {:?}); closing at next header",
            expected,
            head.kind.as_str(),
            head.end_log_pos,
            self.offset_correction
        );
    }

    fn complete(
        &mut self,
        head: EventHead,
        body_end: usize,
        consumed: usize,
        terminator: Option<u64>,
    ) -> ResolvedEvent {
        let body = String::from_utf8_lossy(&self.buffer[..body_end]).into_owned();
        self.buffer.advance(consumed);
        self.scan_from = 0;

        if let (EventKind::FormatDescription { .. }, Some(at), None) =
            (&head.kind, terminator, self.offset_correction)
        {
            let correction = at as i64 - head.end_log_pos as i64;
            info!(
                "Derived offset correction {} from format description (end_log_pos {}, # at {})",
                correction, head.end_log_pos, at
            );
            self.offset_correction = Some(correction);
        }

        let blocks = if head.kind.row_operation().is_some() {
            split_blocks(&body)
        } else {
            Vec::new()
        };

        trace!(
            "Resolved {} event at {}:{} ({} blocks)",
            head.kind.as_str(),
            head.file,
            head.end_log_pos,
            blocks.len()
        );
        ResolvedEvent { head, blocks }
    }
}

struct Grammar {
    header: Regex,
    crc: Regex,
    start: Regex,
    gtid: Regex,
    query: Regex,
    table_map: Regex,
    rows: Regex,
    xid: Regex,
    rotate: Regex,
    qualified: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).expect("static regex");
        Grammar {
            header: re(r"^#(\d{6})\s+(\d{1,2}:\d{2}:\d{2})\s+server id\s+(\d+)\s+end_log_pos\s+(\d+)\s*(.*)$"),
            crc: re(r"^CRC32\s+0x[0-9a-fA-F]+\s*"),
            start: re(r"^Start:\s*(.*)$"),
            gtid: re(r"^(?:Anonymous_)?GTID(?:\s+last_committed=(\d+)\s+sequence_number=(\d+))?"),
            query: re(r"^Query\s+thread_id=(\d+)\s+exec_time=(\d+)\s+error_code=(\d+)"),
            table_map: re(r"^Table_map:\s+(.+?)\s+mapped to number\s+(\d+)"),
            rows: re(r"^(Write|Update|Delete)_rows\w*:\s+table id\s+(\d+)(?:\s+flags:\s+(\w+))?"),
            xid: re(r"^Xid\s*=\s*(\d+)"),
            rotate: re(r"^Rotate to\s+(\S+)\s+pos:\s+(\d+)"),
            qualified: re(r"`([^`]*)`\.`([^`]*)`"),
        }
    })
}

/// `` `db`.`table` `` 형태의 정규화된 테이블명 추출
pub fn qualified_table(text: &str) -> Option<(String, String)> {
    grammar()
        .qualified
        .captures(text)
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

fn is_header_line(line: &[u8]) -> bool {
    line.first() == Some(&b'#')
        && std::str::from_utf8(line).map_or(false, |s| grammar().header.is_match(s))
}

/// 헤더 라인 파싱. 알 수 없는 종류이거나 형식이 깨진 경우 `None`
fn parse_header(line: &str, file: &str) -> Option<EventHead> {
    if !line.starts_with('#') {
        return None;
    }
    let g = grammar();
    let caps = g.header.captures(line)?;

    let emitted_at = parse_header_time(&caps[1], &caps[2])?;
    let server_id = caps[3].parse().ok()?;
    let end_log_pos = caps[4].parse().ok()?;
    let rest = g.crc.replace(caps[5].trim(), "");
    let kind = match parse_kind(rest.trim()) {
        Some(kind) => kind,
        None => {
            trace!("Skipping unrecognized header: {}", line);
            return None;
        }
    };

    let file = match &kind {
        EventKind::Rotate { file, .. } => file.clone(),
        _ => file.to_string(),
    };

    Some(EventHead {
        emitted_at,
        end_log_pos,
        server_id,
        kind,
        file,
        raw: line.to_string(),
    })
}

/// `210101` + `8:00:00` → 2021-01-01T08:00:00Z
///
/// 두 자리 연도 70 이상은 19xx (`-R`의 가짜 rotate 헤더는 `700101`).
fn parse_header_time(date: &str, time: &str) -> Option<chrono::DateTime<Utc>> {
    let century = if date.get(..2)? >= "70" { "19" } else { "20" };
    let text = format!("{}{} {:0>8}", century, date, time);
    let naive = NaiveDateTime::parse_from_str(&text, "%Y%m%d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn num(m: Option<regex::Match<'_>>) -> Option<u64> {
    m.and_then(|m| m.as_str().parse().ok())
}

fn parse_kind(rest: &str) -> Option<EventKind> {
    let g = grammar();

    if let Some(c) = g.start.captures(rest) {
        return Some(EventKind::FormatDescription {
            description: c[1].trim().to_string(),
        });
    }
    if rest.starts_with("Previous-GTIDs") {
        return Some(EventKind::PreviousGtids);
    }
    if let Some(c) = g.gtid.captures(rest) {
        return Some(EventKind::Gtid {
            last_committed: num(c.get(1)).unwrap_or(0),
            sequence_number: num(c.get(2)).unwrap_or(0),
        });
    }
    if let Some(c) = g.query.captures(rest) {
        return Some(EventKind::Query {
            thread_id: num(c.get(1))?,
            exec_time: num(c.get(2))?,
            error_code: num(c.get(3))?,
        });
    }
    if let Some(c) = g.table_map.captures(rest) {
        let table_id = num(c.get(2))?;
        let (database, table) =
            qualified_table(&c[1]).unwrap_or_else(|| (String::new(), c[1].to_string()));
        return Some(EventKind::TableMap {
            table_id,
            database,
            table,
        });
    }
    if let Some(c) = g.rows.captures(rest) {
        let table_id = num(c.get(2))?;
        let statement_end = c.get(3).map_or(false, |m| m.as_str() == "STMT_END_F");
        return match &c[1] {
            "Write" => Some(EventKind::WriteRows {
                table_id,
                statement_end,
            }),
            "Update" => Some(EventKind::UpdateRows {
                table_id,
                statement_end,
            }),
            _ => Some(EventKind::DeleteRows {
                table_id,
                statement_end,
            }),
        };
    }
    if let Some(c) = g.xid.captures(rest) {
        return Some(EventKind::Xid { xid: num(c.get(1))? });
    }
    if let Some(c) = g.rotate.captures(rest) {
        return Some(EventKind::Rotate {
            file: c[1].to_string(),
            position: num(c.get(2))?,
        });
    }
    None
}

/// `# at 1234` → 1234
fn parse_at_line(line: &[u8]) -> Option<u64> {
    let rest = line.strip_prefix(b"# at ")?;
    std::str::from_utf8(rest).ok()?.trim().parse().ok()
}

fn is_block_marker(line: &str) -> bool {
    ["### INSERT", "### UPDATE", "### DELETE"]
        .iter()
        .any(|marker| line.starts_with(marker))
}

/// 행 이벤트 본문을 `### INSERT|UPDATE|DELETE` 단위 블록으로 나눈다
///
/// 첫 마커 이전 라인(BINLOG base64 등)은 버리고, 이후 라인은 모두
/// 직전 블록에 이어 붙인다.
fn split_blocks(body: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in body.lines().map(|l| l.trim_end_matches('\r')) {
        if is_block_marker(line) {
            blocks.extend(current.take());
            current = Some(line.to_string());
        } else if let Some(block) = current.as_mut() {
            if !line.trim().is_empty() {
                block.push('\n');
                block.push_str(line);
            }
        }
    }
    blocks.extend(current);
    blocks
}

fn find_newline(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == b'\n')
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
