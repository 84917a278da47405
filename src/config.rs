//! Session and per-query settings.
use std::{path::PathBuf, time::Duration};

use crate::{
    error::{Error, Result},
    protocol::{request::Template, transport::MAX_BLOCK_SIZE},
};

/// Payload size of the blocks a server sends.
pub const DEFAULT_BLOCK_SIZE: usize = 8190;
/// Rows requested per chunk when the caller did not pin a fetch size.
pub const DEFAULT_FETCH_SIZE: usize = 250;
/// Row budget that bounds adaptive chunk growth.
pub const DEFAULT_FETCH_MEMORY_BUDGET: usize = 250_000;

/// Query language negotiated during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Language {
    #[default]
    Sql,
    Mal,
    Other(String),
}

impl Language {
    /// Template wrapped around ordinary queries.
    pub fn query_template(&self) -> Template {
        match self {
            Language::Sql => Template::new("s", "\n;"),
            Language::Mal => Template::new("", ";\n"),
            Language::Other(_) => Template::new("", ""),
        }
    }

    /// Template wrapped around control commands such as `reply_size`.
    pub fn command_template(&self) -> Template {
        match self {
            Language::Sql => Template::new("X", ""),
            Language::Mal | Language::Other(_) => Template::new("", ""),
        }
    }

    /// Only SQL sessions understand tabular control commands.
    pub fn is_sql(&self) -> bool {
        matches!(self, Language::Sql)
    }
}

impl From<&str> for Language {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "" | "sql" => Language::Sql,
            "mal" => Language::Mal,
            other => Language::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub language: Language,
    /// Largest block the client writes, and the threshold above which a
    /// query goes through the writer thread. Incoming blocks are accepted up
    /// to this or [`DEFAULT_BLOCK_SIZE`], whichever is larger.
    pub block_size: usize,
    pub default_fetch_size: usize,
    pub fetch_memory_budget: usize,
    /// Only honoured for TCP sessions.
    pub read_timeout: Option<Duration>,
    pub debug_log: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: Language::Sql,
            block_size: DEFAULT_BLOCK_SIZE,
            default_fetch_size: DEFAULT_FETCH_SIZE,
            fetch_memory_budget: DEFAULT_FETCH_MEMORY_BUDGET,
            read_timeout: None,
            debug_log: None,
        }
    }
}

impl SessionConfig {
    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_block_size(mut self, size: usize) -> Self {
        assert!(size > 0 && size <= MAX_BLOCK_SIZE);
        self.block_size = size;
        self
    }

    pub fn with_default_fetch_size(mut self, size: usize) -> Self {
        assert!(size > 0);
        self.default_fetch_size = size;
        self
    }

    pub fn with_fetch_memory_budget(mut self, rows: usize) -> Self {
        self.fetch_memory_budget = rows;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_log = Some(path.into());
        self
    }

    /// Checks the fields the builders assert on, for configs assembled by hand.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "block size {} not in 1..={MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.default_fetch_size == 0 {
            return Err(Error::InvalidConfig("default fetch size must be positive".into()));
        }
        Ok(())
    }

    /// Largest block accepted from the server.
    pub(crate) fn read_block_size(&self) -> usize {
        self.block_size.max(DEFAULT_BLOCK_SIZE)
    }
}

/// How a tabular result is going to be traversed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CursorKind {
    /// Rows are read once, in increasing order; consumed chunks are dropped.
    #[default]
    ForwardOnly,
    /// Rows may be revisited; chunks stay resident until the result is closed.
    Scrollable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Pins the chunk size; disables adaptive growth.
    pub fetch_size: Option<usize>,
    /// Upper bound on the number of rows a table result exposes.
    pub max_rows: Option<usize>,
    pub cursor: CursorKind,
}

impl QueryOptions {
    pub fn scrollable() -> Self {
        Self {
            cursor: CursorKind::Scrollable,
            ..Self::default()
        }
    }

    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = Some(size).filter(|s| *s > 0);
        self
    }

    pub fn with_max_rows(mut self, rows: usize) -> Self {
        self.max_rows = Some(rows).filter(|r| *r > 0);
        self
    }

    /// Reply size to negotiate with the server for this query.
    pub(crate) fn reply_size(&self, default: usize) -> usize {
        let size = self.fetch_size.unwrap_or(default);
        match self.max_rows {
            Some(max) => max.min(size),
            None => size,
        }
    }
}
