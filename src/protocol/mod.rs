//! Client side of the MAPI protocol.
//!
//! This module turns an authenticated byte stream into typed query results.
//! It is layered bottom-up:
//!
//! - [`transport`]: block framing. Messages travel as blocks of at most
//!   `block_size` bytes, each prefixed by a two byte little-endian header
//!   holding the payload length and a final-block flag.
//! - [`line`]: every reassembled line is classified by its leading byte.
//! - [`header`]: parsers for start-of-header (`&`), column header (`%`) and
//!   result row (`[`) lines.
//! - [`Session`]: the response state machine. It sends one query at a time,
//!   reads lines until the prompt and dispatches them into [`Response`]s.
//! - [`Table`]: a tabular response with a lazily filled row cache that pulls
//!   further chunks through its session.
//! - [`WriterThread`]: writes queries larger than one block from a background
//!   thread so the caller can drain the answer at the same time.
//!
//! # Wire format
//!
//! ```text
//! client:  Xreply_size 250            control command (SQL)
//!          sselect * from t\n;        query (SQL)
//! server:  &1 0 1000 2 250            table 0: 1000 rows, 2 columns, 250 sent
//!          % sys.t,\tsys.t # table_name
//!          % a,\tb # name
//!          % int,\tvarchar # type
//!          % 1,\t5 # length
//!          [ 1,\t"hello"\t]
//!          ...
//!          \x01\x01                   prompt: the server waits for input
//! ```
//!
//! Whatever the server sends that the client does not understand is reported
//! as a protocol violation after reading up to the prompt, so one bad answer
//! never leaves the stream out of sync.
pub mod header;
pub mod line;
pub mod request;
mod response;
mod result;
mod session;
mod thread;
pub mod trace;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use line::{Line, LineKind, classify};
pub use request::{Request, Template};
pub use response::{Response, ResponseList, UpdateCount, Warning};
pub use result::{Chunk, Column, Rows, Table};
pub use session::Session;
pub use thread::WriterThread;
pub use trace::DebugLog;
pub use transport::{BlockReader, BlockWriter, TransportError};
