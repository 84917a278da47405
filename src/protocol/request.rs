use std::fmt;

/// Text placed around a query before it is framed and sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    prefix: &'static str,
    suffix: &'static str,
}

impl Template {
    pub const fn new(prefix: &'static str, suffix: &'static str) -> Self {
        Self { prefix, suffix }
    }

    pub fn render(&self, body: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + body.len() + self.suffix.len());
        out.push_str(self.prefix);
        out.push_str(body);
        out.push_str(self.suffix);
        out
    }
}

/// Control commands the client sends on its own behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Number of rows the server should put in the first chunk of a table.
    ReplySize(usize),
    /// Releases the server-side state of a partially fetched table.
    Release { id: i64 },
    /// Requests `size` rows of table `id` starting at `offset`.
    Export { id: i64, offset: usize, size: usize },
    AutoCommit(bool),
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::ReplySize(size) => write!(f, "reply_size {size}"),
            Request::Release { id } => write!(f, "close {id}"),
            Request::Export { id, offset, size } => write!(f, "export {id} {offset} {size}"),
            Request::AutoCommit(on) => write!(f, "auto_commit {}", if *on { 1 } else { 0 }),
        }
    }
}
