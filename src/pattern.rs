//! Text patterns for the data log.
//! `DataPattern` renders one sample (three axis values) using fmt-style `{}` placeholders.
//! `LogEntryPattern` lays out a whole sink record using spdlog-style `%` flags
//! (timestamp, logger name, level, message).

use chrono::{DateTime, TimeZone};
use log::Level;
use std::fmt::{Display, Write as _};
use thiserror::Error;

/// Sample format used when the settings file has no `data_pattern`.
pub const DEFAULT_DATA_PATTERN: &str = "{} ,{}, {}";
/// Record layout used when the settings file has no `pattern`.
pub const DEFAULT_ENTRY_PATTERN: &str = "[%Y-%m-%d %H:%M:%S.%e] [%n] [%l] %v";

const ARGUMENT_COUNT: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("unclosed '{{' at byte {0}")]
    UnclosedBrace(usize),
    #[error("unmatched '}}' at byte {0}")]
    StrayBrace(usize),
    #[error("unsupported placeholder '{{{0}}}' (only {{}} or {{0}}..{{2}} are allowed)")]
    UnsupportedPlaceholder(String),
    #[error("placeholder refers to argument {0}, but a sample only has three values")]
    ArgumentOutOfRange(usize),
    #[error("cannot mix automatic '{{}}' and numbered '{{N}}' placeholders")]
    MixedIndexing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Arg(usize),
}

/// Three-argument sample format, validated once at configuration time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPattern {
    source: String,
    pieces: Vec<Piece>,
}

impl DataPattern {
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut next_auto = 0usize;
        let mut saw_auto = false;
        let mut saw_manual = false;
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(PatternError::UnclosedBrace(pos));
                    }

                    let index = if inner.is_empty() {
                        saw_auto = true;
                        next_auto += 1;
                        next_auto - 1
                    } else {
                        saw_manual = true;
                        inner
                            .parse::<usize>()
                            .map_err(|_| PatternError::UnsupportedPlaceholder(inner.clone()))?
                    };
                    if saw_auto && saw_manual {
                        return Err(PatternError::MixedIndexing);
                    }
                    if index >= ARGUMENT_COUNT {
                        return Err(PatternError::ArgumentOutOfRange(index));
                    }

                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Arg(index));
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(PatternError::StrayBrace(pos)),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self { source: source.to_string(), pieces })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Substitutes the axis values in order (x, y, z).
    pub fn render(&self, values: [i16; 3]) -> String {
        let mut out = String::with_capacity(self.source.len() + 18);
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Arg(index) => {
                    let _ = write!(out, "{}", values[*index]);
                }
            }
        }
        out
    }
}

impl Default for DataPattern {
    fn default() -> Self {
        Self {
            source: DEFAULT_DATA_PATTERN.to_string(),
            pieces: vec![
                Piece::Arg(0),
                Piece::Literal(" ,".to_string()),
                Piece::Arg(1),
                Piece::Literal(", ".to_string()),
                Piece::Arg(2),
            ],
        }
    }
}

/// spdlog level names, which differ from `log`'s for warnings.
fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warning",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

fn level_short(level: Level) -> &'static str {
    match level {
        Level::Error => "E",
        Level::Warn => "W",
        Level::Info => "I",
        Level::Debug => "D",
        Level::Trace => "T",
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Literal(String),
    Time(&'static str),
    Message,
    LoggerName,
    Level,
    ShortLevel,
    ThreadId,
    ProcessId,
}

/// spdlog-style record layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntryPattern {
    tokens: Vec<Token>,
}

impl LogEntryPattern {
    /// Unknown flags are kept literally, the way spdlog treats them.
    pub fn parse(source: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            let Some(flag) = chars.next() else {
                literal.push('%');
                break;
            };

            let token = match flag {
                'v' => Some(Token::Message),
                'n' => Some(Token::LoggerName),
                'l' => Some(Token::Level),
                'L' => Some(Token::ShortLevel),
                't' => Some(Token::ThreadId),
                'P' => Some(Token::ProcessId),
                '+' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.extend(Self::parse(DEFAULT_ENTRY_PATTERN).tokens);
                    continue;
                }
                // color range markers; files have no color
                '^' | '$' => continue,
                // source location is never attached to data records
                's' | 'g' | '#' | '!' => continue,
                '%' => {
                    literal.push('%');
                    continue;
                }
                other => time_format(other).map(Token::Time),
            };

            match token {
                Some(token) => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(token);
                }
                None => {
                    literal.push('%');
                    literal.push(flag);
                }
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self { tokens }
    }

    pub fn render<Tz>(&self, at: &DateTime<Tz>, logger: &str, level: Level, message: &str) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut out = String::with_capacity(message.len() + 48);
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Time(format) => {
                    let _ = write!(out, "{}", at.format(format));
                }
                Token::Message => out.push_str(message),
                Token::LoggerName => out.push_str(logger),
                Token::Level => out.push_str(level_name(level)),
                Token::ShortLevel => out.push_str(level_short(level)),
                Token::ThreadId => out.push_str(&thread_id()),
                Token::ProcessId => {
                    let _ = write!(out, "{}", std::process::id());
                }
            }
        }
        out
    }
}

impl Default for LogEntryPattern {
    fn default() -> Self {
        Self::parse(DEFAULT_ENTRY_PATTERN)
    }
}

/// spdlog time flag -> chrono strftime.
fn time_format(flag: char) -> Option<&'static str> {
    let format = match flag {
        'Y' => "%Y",
        'y' | 'C' => "%y",
        'm' => "%m",
        'd' => "%d",
        'H' => "%H",
        'I' => "%I",
        'M' => "%M",
        'S' => "%S",
        'e' => "%3f",
        'f' => "%6f",
        'F' => "%9f",
        'p' => "%p",
        'a' => "%a",
        'A' => "%A",
        'b' | 'h' => "%b",
        'B' => "%B",
        'c' => "%a %b %d %H:%M:%S %Y",
        'D' | 'x' => "%m/%d/%y",
        'T' | 'X' => "%H:%M:%S",
        'R' => "%H:%M",
        'r' => "%I:%M:%S %p",
        'z' => "%:z",
        'E' => "%s",
        _ => return None,
    };
    Some(format)
}

fn thread_id() -> String {
    let raw = format!("{:?}", std::thread::current().id());
    raw.trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .to_string()
}
