//! Read-only SQL sandbox for the free-form query tool.
//!
//! Statements are vetted lexically: comments are stripped, quoted text is
//! skipped, and only the top nesting level is inspected for `LIMIT`. The
//! storage layer additionally executes every allowed query on a connection
//! with `PRAGMA query_only = ON`.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlGuardDecision {
    Allow { query: String, limit: u32 },
    Deny { reason_code: &'static str, user_message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SqlGuardPolicy {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for SqlGuardPolicy {
    fn default() -> Self {
        Self { default_limit: 100, max_limit: 500 }
    }
}

impl SqlGuardPolicy {
    pub fn new(default_limit: u32, max_limit: u32) -> Self {
        let max_limit = max_limit.max(1);
        Self { default_limit: default_limit.clamp(1, max_limit), max_limit }
    }

    /// Row cap for a caller-supplied limit: missing or non-positive values
    /// fall back to the default, everything is clamped to the ceiling.
    pub fn effective_limit(&self, requested: Option<i64>) -> u32 {
        match requested {
            Some(value) if value > 0 => {
                u32::try_from(value).unwrap_or(u32::MAX).min(self.max_limit)
            }
            _ => self.default_limit.min(self.max_limit),
        }
    }

    pub fn evaluate(&self, statement: &str, requested_limit: Option<i64>) -> SqlGuardDecision {
        let stripped = match strip_comments(statement) {
            Ok(text) => text,
            Err(error) => return error.into_decision(),
        };
        let text = stripped.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        if text.is_empty() {
            return deny("empty_statement", "SQL 语句不能为空");
        }

        let scanned = match scan(text) {
            Ok(scanned) => scanned,
            Err(error) => return error.into_decision(),
        };

        let starts_with_select = scanned.words.first().is_some_and(|&(start, end)| {
            start == 0 && text[start..end].eq_ignore_ascii_case("SELECT")
        });
        if !starts_with_select {
            return deny("not_select", "只允许执行 SELECT 查询语句");
        }
        if scanned.has_semicolon {
            return deny("multiple_statements", "不允许一次执行多条 SQL 语句");
        }

        let cap = self.effective_limit(requested_limit);
        let last_limit = scanned
            .words
            .iter()
            .rev()
            .find(|&&(start, end)| text[start..end].eq_ignore_ascii_case("LIMIT"));

        let Some(&(limit_start, limit_end)) = last_limit else {
            return SqlGuardDecision::Allow { query: format!("{text} LIMIT {cap}"), limit: cap };
        };

        let prefix = text[..limit_start].trim_end();
        match parse_limit_tail(&text[limit_end..]) {
            Some(LimitTail::Count(count)) => {
                let limit = clamp_count(count, cap);
                SqlGuardDecision::Allow { query: format!("{prefix} LIMIT {limit}"), limit }
            }
            Some(LimitTail::CountOffset(count, offset)) => {
                let limit = clamp_count(count, cap);
                SqlGuardDecision::Allow {
                    query: format!("{prefix} LIMIT {limit} OFFSET {offset}"),
                    limit,
                }
            }
            Some(LimitTail::OffsetCount(offset, count)) => {
                let limit = clamp_count(count, cap);
                SqlGuardDecision::Allow { query: format!("{prefix} LIMIT {offset}, {limit}"), limit }
            }
            None => SqlGuardDecision::Allow {
                query: format!("SELECT * FROM ({text}) LIMIT {cap}"),
                limit: cap,
            },
        }
    }
}

fn deny(reason_code: &'static str, user_message: &str) -> SqlGuardDecision {
    SqlGuardDecision::Deny { reason_code, user_message: user_message.to_string() }
}

fn clamp_count(count: u64, cap: u32) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX).min(cap)
}

#[derive(Debug, PartialEq, Eq)]
enum LimitTail {
    Count(u64),
    CountOffset(u64, u64),
    OffsetCount(u64, u64),
}

fn parse_limit_tail(tail: &str) -> Option<LimitTail> {
    let spaced = tail.replace(',', " , ");
    let tokens: Vec<&str> = spaced.split_whitespace().collect();
    let number = |token: &str| -> Option<u64> {
        if token.bytes().all(|b| b.is_ascii_digit()) {
            token.parse().ok()
        } else {
            None
        }
    };

    match tokens.as_slice() {
        [count] => number(count).map(LimitTail::Count),
        [count, keyword, offset] if keyword.eq_ignore_ascii_case("OFFSET") => {
            Some(LimitTail::CountOffset(number(count)?, number(offset)?))
        }
        [offset, ",", count] => Some(LimitTail::OffsetCount(number(offset)?, number(count)?)),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ScanError {
    Unterminated,
}

impl ScanError {
    fn into_decision(self) -> SqlGuardDecision {
        match self {
            Self::Unterminated => deny("unterminated_token", "SQL 语句包含未闭合的引号或注释"),
        }
    }
}

/// Returns the byte index just past the closing delimiter of the quoted token
/// starting at `start`.
fn skip_quoted(text: &str, start: usize, open: char) -> Result<usize, ScanError> {
    let close = if open == '[' { ']' } else { open };
    let bytes = text.as_bytes();
    let mut index = start + open.len_utf8();

    while index < bytes.len() {
        if bytes[index] == close as u8 {
            // doubled quote is an escaped quote
            if close != ']' && bytes.get(index + 1) == Some(&(close as u8)) {
                index += 2;
                continue;
            }
            return Ok(index + 1);
        }
        index += 1;
    }

    Err(ScanError::Unterminated)
}

fn strip_comments(statement: &str) -> Result<String, ScanError> {
    let mut out = String::with_capacity(statement.len());
    let mut index = 0;

    while let Some(ch) = statement[index..].chars().next() {
        let rest = &statement[index..];
        match ch {
            '\'' | '"' | '`' | '[' => {
                let end = skip_quoted(statement, index, ch)?;
                out.push_str(&statement[index..end]);
                index = end;
            }
            '-' if rest.starts_with("--") => {
                index += rest.find('\n').unwrap_or(rest.len());
                out.push(' ');
            }
            '/' if rest.starts_with("/*") => {
                let close = rest[2..].find("*/").ok_or(ScanError::Unterminated)?;
                index += close + 4;
                out.push(' ');
            }
            _ => {
                out.push(ch);
                index += ch.len_utf8();
            }
        }
    }

    Ok(out)
}

struct Scanned {
    /// Byte ranges of bare words at nesting depth zero.
    words: Vec<(usize, usize)>,
    has_semicolon: bool,
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

fn scan(text: &str) -> Result<Scanned, ScanError> {
    let mut words = Vec::new();
    let mut has_semicolon = false;
    let mut depth: i32 = 0;
    let mut word_start: Option<usize> = None;
    let mut index = 0;

    while let Some(ch) = text[index..].chars().next() {
        if !is_word_char(ch) {
            if let Some(start) = word_start.take() {
                if depth == 0 {
                    words.push((start, index));
                }
            }
        }

        match ch {
            '\'' | '"' | '`' | '[' => {
                index = skip_quoted(text, index, ch)?;
                continue;
            }
            '(' => depth += 1,
            ')' => depth -= 1,
            ';' => has_semicolon = true,
            _ if is_word_char(ch) && word_start.is_none() => word_start = Some(index),
            _ => {}
        }
        index += ch.len_utf8();
    }

    if let Some(start) = word_start {
        if depth == 0 {
            words.push((start, text.len()));
        }
    }

    Ok(Scanned { words, has_semicolon })
}
