use std::fmt;

use super::{
    line::Line,
    result::{Chunk, Table},
};
use crate::{config::CursorKind, error::Result};

/// Outcome of a data-modifying statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCount {
    pub count: i64,
    /// Key generated by the statement, if any.
    pub last_id: Option<String>,
}

/// One semantically complete unit of server output.
#[derive(Debug)]
pub enum Response {
    Table(Table),
    Update(UpdateCount),
    Schema,
    Transaction { auto_commit: bool },
}

impl Response {
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Response::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_table_mut(&mut self) -> Option<&mut Table> {
        match self {
            Response::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn into_table(self) -> Option<Table> {
        match self {
            Response::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn update_count(&self) -> Option<&UpdateCount> {
        match self {
            Response::Update(update) => Some(update),
            _ => None,
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Response::Table(table) => table.close(),
            _ => Ok(()),
        }
    }
}

/// A response that is still being fed lines by the session.
#[derive(Debug)]
pub(crate) enum Pending {
    Response(Response),
    /// Continuation rows for the table with the given id.
    Chunk { id: i64, offset: usize, chunk: Chunk },
}

impl Pending {
    pub(crate) fn add_line(&mut self, line: Line) -> Result<(), String> {
        let kind = match self {
            Pending::Response(Response::Table(table)) => return table.add_line(line),
            Pending::Chunk { chunk, .. } => return chunk.add_line(line),
            Pending::Response(Response::Update(_)) => "an update",
            Pending::Response(Response::Schema) => "a schema",
            Pending::Response(Response::Transaction { .. }) => "an auto commit",
        };
        Err(format!("header lines are not supported for {kind} response"))
    }

    pub(crate) fn wants_more(&self) -> bool {
        match self {
            Pending::Response(Response::Table(table)) => table.wants_more(),
            Pending::Chunk { chunk, .. } => chunk.wants_more(),
            Pending::Response(_) => false,
        }
    }

    pub(crate) fn complete(&self) -> Result<(), String> {
        match self {
            Pending::Response(Response::Table(table)) => table.complete(),
            Pending::Chunk { chunk, .. } => chunk.complete(),
            Pending::Response(_) => Ok(()),
        }
    }
}

/// The responses of one query, in the order the server sent them.
#[derive(Debug)]
pub struct ResponseList {
    responses: Vec<Option<Response>>,
    cursor: CursorKind,
    next: usize,
}

impl ResponseList {
    pub(crate) fn new(responses: Vec<Response>, cursor: CursorKind) -> Self {
        Self {
            responses: responses.into_iter().map(Some).collect(),
            cursor,
            next: 0,
        }
    }

    /// Advances to the next response. With a forward-only cursor the
    /// previously returned response is closed first.
    pub fn next_response(&mut self) -> Result<Option<&mut Response>> {
        if self.cursor == CursorKind::ForwardOnly && self.next > 0 {
            if let Some(mut previous) = self.responses[self.next - 1].take() {
                previous.close()?;
            }
        }
        if self.next >= self.responses.len() {
            return Ok(None);
        }
        self.next += 1;
        Ok(self.responses[self.next - 1].as_mut())
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut Response> {
        self.responses.get_mut(i).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Closes every response still held, reporting the first failure.
    pub fn close(&mut self) -> Result<()> {
        let mut first = Ok(());
        for mut response in self.responses.iter_mut().filter_map(Option::take) {
            let res = response.close();
            if first.is_ok() {
                first = res;
            }
        }
        first
    }
}

impl IntoIterator for ResponseList {
    type Item = Response;
    type IntoIter = std::iter::Flatten<std::vec::IntoIter<Option<Response>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.responses.into_iter().flatten()
    }
}

/// Informational message attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub sqlstate: Option<String>,
    pub message: String,
}

impl Warning {
    pub fn new(message: impl Into<String>, sqlstate: &str) -> Self {
        Self {
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "{state}!{}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
