//! A client core for the MAPI protocol spoken by MonetDB.
//!
//! The crate takes over an already authenticated connection, sends queries in
//! the framed line protocol and hands back typed responses, fetching the rows
//! of large results chunk by chunk as they are read.
//!
//! ```no_run
//! use std::net::TcpStream;
//!
//! use mapi::{Session, SessionConfig};
//!
//! # fn main() -> mapi::Result<()> {
//! # let stream: TcpStream = unimplemented!();
//! let session = Session::connect_tcp(stream, SessionConfig::default())?;
//! for mut response in session.query("select name from sys.tables")? {
//!     if let Some(table) = response.as_table_mut() {
//!         for row in table.rows() {
//!             println!("{}", row?);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;

pub use cli::{Command, prompt};
pub use config::{CursorKind, Language, QueryOptions, SessionConfig};
pub use error::{Error, Failure, FailureKind, QueryError, Result};
pub use protocol::{Column, Response, ResponseList, Session, Table, UpdateCount, Warning};
