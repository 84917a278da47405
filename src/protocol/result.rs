//! Tabular results and their row cache.
//!
//! A [`Table`] announces how many rows the result has in total, but only the
//! first [`Chunk`] arrives with the query. The remaining rows are pulled from
//! the server on demand with `export <id> <offset> <size>`, one chunk per cache
//! miss.
//!
//! For forward-only cursors chunks before the current one are discarded on
//! every miss and each row can be taken only once. When nothing else was sent
//! on the session since this table's query and the caller did not pin a fetch
//! size, every miss also multiplies the chunk size by ten (bounded by half the
//! configured row budget), so long sequential scans need few round-trips.
use log::{debug, info, warn};

use super::{
    header::{HeaderField, HeaderLine},
    line::{Line, LineKind},
    request::Request,
    session::Session,
};
use crate::{
    config::{CursorKind, QueryOptions},
    error::{Error, Failure, QueryError, Result},
};

/// A bounded batch of result rows.
#[derive(Debug, Clone)]
pub struct Chunk {
    rows: Vec<Option<String>>,
    capacity: usize,
    forward_only: bool,
}

impl Chunk {
    pub fn new(capacity: usize, forward_only: bool) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            capacity,
            forward_only,
        }
    }

    pub fn add_line(&mut self, line: Line) -> Result<(), String> {
        if line.kind() != LineKind::ResultRow {
            return Err(format!(
                "protocol violation: unexpected line in data block: {}",
                line.text()
            ));
        }
        if self.rows.len() == self.capacity {
            return Err(format!("data block already holds {} rows", self.capacity));
        }
        self.rows.push(Some(line.into_text()));
        Ok(())
    }

    pub fn wants_more(&self) -> bool {
        self.rows.len() < self.capacity
    }

    pub fn complete(&self) -> Result<(), String> {
        if self.rows.len() != self.capacity {
            return Err(format!(
                "inconsistent state detected: current block capacity: {}, block usage: {}",
                self.capacity,
                self.rows.len()
            ));
        }
        Ok(())
    }

    /// Returns row `i`; forward-only chunks hand each row out once.
    pub fn row(&mut self, i: usize) -> Option<String> {
        let slot = self.rows.get_mut(i)?;
        if self.forward_only {
            slot.take()
        } else {
            slot.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub table: String,
    pub width: usize,
}

#[derive(Debug, Default)]
struct Headers {
    names: Option<Vec<String>>,
    types: Option<Vec<String>>,
    tables: Option<Vec<String>>,
    widths: Option<Vec<usize>>,
}

impl Headers {
    /// Builds the column list once all four headers arrived.
    fn take_columns(&mut self) -> Option<Vec<Column>> {
        if self.names.is_none() || self.types.is_none() || self.tables.is_none() || self.widths.is_none() {
            return None;
        }
        let headers = std::mem::take(self);
        let columns = headers
            .names?
            .into_iter()
            .zip(headers.types?)
            .zip(headers.tables?)
            .zip(headers.widths?)
            .map(|(((name, type_name), table), width)| Column {
                name,
                type_name,
                table,
                width,
            })
            .collect();
        Some(columns)
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.names.is_none() {
            missing.push("name header missing");
        }
        if self.types.is_none() {
            missing.push("type header missing");
        }
        if self.tables.is_none() {
            missing.push("table name header missing");
        }
        if self.widths.is_none() {
            missing.push("column width header missing");
        }
        missing
    }
}

/// Values of the `&1`/`&5` line that announced a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHeader {
    pub id: i64,
    pub tuple_count: usize,
    pub column_count: usize,
    pub row_count: usize,
    pub prepared: bool,
}

pub struct Table {
    id: i64,
    tuple_count: usize,
    column_count: usize,
    first_rows: usize,
    prepared: bool,
    headers: Headers,
    columns: Option<Vec<Column>>,
    chunk_size: usize,
    pinned: bool,
    block_offset: usize,
    low_water: usize,
    chunks: Vec<Option<Chunk>>,
    cursor: CursorKind,
    seq: u64,
    release_on_close: bool,
    closed: bool,
    session: Session,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("tuple_count", &self.tuple_count)
            .field("column_count", &self.column_count)
            .field("chunk_size", &self.chunk_size)
            .field("cursor", &self.cursor)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Table {
    pub(crate) fn new(
        header: TableHeader,
        session: Session,
        options: &QueryOptions,
        seq: u64,
    ) -> Self {
        let mut chunk_size = options
            .fetch_size
            .unwrap_or(session.config().default_fetch_size);
        // Pseudo results (EXPLAIN and friends) ignore the reply size and
        // arrive in one piece.
        if header.row_count > chunk_size {
            chunk_size = header.row_count;
        }
        let chunk_size = chunk_size.max(1);

        let tuple_count = options
            .max_rows
            .map_or(header.tuple_count, |max| max.min(header.tuple_count));
        let forward_only = options.cursor == CursorKind::ForwardOnly;
        let mut chunks = vec![None; slots(tuple_count, chunk_size)];
        chunks[0] = Some(Chunk::new(header.row_count, forward_only));

        Self {
            id: header.id,
            tuple_count,
            column_count: header.column_count,
            first_rows: header.row_count,
            prepared: header.prepared,
            headers: Headers::default(),
            columns: None,
            chunk_size,
            pinned: options.fetch_size.is_some(),
            block_offset: 0,
            low_water: 0,
            chunks,
            cursor: options.cursor,
            seq,
            release_on_close: header.id > 0 && header.tuple_count > header.row_count,
            closed: false,
            session,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Total number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.tuple_count
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn columns(&self) -> &[Column] {
        self.columns.as_deref().unwrap_or_default()
    }

    /// Whether this describes a prepared statement rather than query output.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn cursor(&self) -> CursorKind {
        self.cursor
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of chunks currently held in memory.
    pub fn resident_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub(crate) fn add_line(&mut self, line: Line) -> Result<(), String> {
        if self.columns.is_some() {
            return match self.chunks.first_mut() {
                Some(Some(chunk)) => chunk.add_line(line),
                _ => Err("result rows arrived for a closed result".to_string()),
            };
        }

        if line.kind() != LineKind::Header {
            return Err(format!("header expected, got: {}", line.text()));
        }

        let header = HeaderLine::parse(line.text()).map_err(|e| e.to_string())?;
        if !matches!(header.field, HeaderField::Other(_)) && header.values.len() != self.column_count {
            return Err(format!(
                "{} header has {} values, expected {}",
                header.field,
                header.values.len(),
                self.column_count
            ));
        }

        match header.field {
            HeaderField::Name => self.headers.names = Some(header.values),
            HeaderField::Type => self.headers.types = Some(header.values),
            HeaderField::Table => self.headers.tables = Some(header.values),
            HeaderField::Length => {
                self.headers.widths = Some(header.int_values(line.text()).map_err(|e| e.to_string())?)
            }
            HeaderField::Other(_) => {}
        }

        if let Some(columns) = self.headers.take_columns() {
            self.columns = Some(columns);
        }
        Ok(())
    }

    pub(crate) fn wants_more(&self) -> bool {
        match (&self.columns, self.chunks.first()) {
            (None, _) => true,
            (Some(_), Some(Some(chunk))) => chunk.wants_more(),
            _ => false,
        }
    }

    pub(crate) fn complete(&self) -> Result<(), String> {
        if self.columns.is_none() {
            return Err(self.headers.missing().join("\n"));
        }
        match self.chunks.first() {
            Some(Some(chunk)) => chunk.complete(),
            _ => Ok(()),
        }
    }

    /// Cursor kind for an incoming chunk of table `id`, or `None` if this
    /// table does not expect one.
    pub(crate) fn expects_chunk(&self, id: i64) -> Option<CursorKind> {
        (id == self.id && self.tuple_count > self.first_rows && !self.closed).then_some(self.cursor)
    }

    pub(crate) fn attach(&mut self, offset: usize, chunk: Chunk) {
        if offset < self.block_offset {
            warn!("dropping chunk at offset {offset} before block offset {}", self.block_offset);
            return;
        }
        let block = (offset - self.block_offset) / self.chunk_size;
        match self.chunks.get_mut(block) {
            Some(slot) => *slot = Some(chunk),
            None => warn!("dropping chunk at offset {offset}: result {} has no block {block}", self.id),
        }
    }

    /// Returns the raw text of row `row`, fetching its chunk from the server
    /// when it is not resident. Rows outside the result, rows of a closed
    /// result and rows a forward-only cursor already consumed are `None`.
    pub fn row(&mut self, row: usize) -> Result<Option<String>> {
        if self.closed || row >= self.tuple_count || row < self.low_water {
            return Ok(None);
        }

        let mut block = (row - self.block_offset) / self.chunk_size;
        if !matches!(self.chunks.get(block), Some(Some(_))) {
            if self.cursor == CursorKind::ForwardOnly {
                self.discard_before(block);
                if self.may_grow() {
                    self.grow(block);
                    block = (row - self.block_offset) / self.chunk_size;
                }
            }

            let request = Request::Export {
                id: self.id,
                offset: block * self.chunk_size + self.block_offset,
                size: self.chunk_size,
            };
            debug!("fetching block {block} of result {}: {request}", self.id);
            let session = self.session.clone();
            session.fetch_chunk(self, &request)?;

            if !matches!(self.chunks.get(block), Some(Some(_))) {
                return Err(Error::Query(QueryError::new(vec![Failure::consistency(
                    format!("block {block} should have been fetched by now"),
                )])));
            }
        }

        let line = (row - self.block_offset) % self.chunk_size;
        Ok(self.chunks[block].as_mut().and_then(|chunk| chunk.row(line)))
    }

    /// Iterates over the rows from `start` on, fetching as needed.
    pub fn rows_from(&mut self, start: usize) -> Rows<'_> {
        Rows { table: self, next: start }
    }

    pub fn rows(&mut self) -> Rows<'_> {
        self.rows_from(self.low_water)
    }

    fn discard_before(&mut self, block: usize) {
        for slot in self.chunks.iter_mut().take(block) {
            *slot = None;
        }
        self.low_water = self.low_water.max(self.block_offset + block * self.chunk_size);
    }

    fn may_grow(&self) -> bool {
        !self.pinned && self.session.last_seq() == self.seq && self.growth_cap() > self.chunk_size
    }

    fn growth_cap(&self) -> usize {
        self.session.config().fetch_memory_budget / 2
    }

    /// Re-bases the chunk grid at `block` with a ten times larger chunk size.
    fn grow(&mut self, block: usize) {
        let size = self.chunk_size.saturating_mul(10).min(self.growth_cap());
        self.block_offset += block * self.chunk_size;
        self.chunk_size = size;
        self.chunks = vec![None; slots(self.tuple_count - self.block_offset, size)];
        info!(
            "result {}: chunk size grown to {size} rows at offset {}",
            self.id, self.block_offset
        );
    }

    /// Releases all rows and, if the server still holds part of the result,
    /// tells it to drop its side as well.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.chunks.clear();

        if self.release_on_close && !self.session.is_closed() {
            info!("releasing server side of result {}", self.id);
            self.session.release(self.id)?;
        }
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to release result {}: {e}", self.id);
        }
    }
}

fn slots(rows: usize, chunk_size: usize) -> usize {
    rows / chunk_size.max(1) + 1
}

/// Row iterator returned by [`Table::rows`].
pub struct Rows<'a> {
    table: &'a mut Table,
    next: usize,
}

impl Iterator for Rows<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.table.row_count() {
            let row = self.next;
            self.next += 1;
            match self.table.row(row) {
                Ok(Some(line)) => return Some(Ok(line)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
