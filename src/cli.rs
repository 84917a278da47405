//! CLI utilities for interactive MAPI tools.
//!
//! Input is read line by line. Lines starting with a dot are commands for the
//! tool itself; anything else is a query for the server.
use std::io::{BufRead, Write};

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `.exit`, or the end of input
    Exit,
    /// `.warnings`: show and clear the session warnings
    Warnings,
    /// Query text, without its trailing newline
    Query(String),
}

/// Prompt user for the next command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")
        .and_then(|_| writer.flush())
        .map_err(|e| format!("failed to write prompt: {e}"))?;

    let read = reader
        .read_line(&mut s)
        .map_err(|e| format!("failed to read input: {e}"))?;
    if read == 0 {
        return Ok(Command::Exit);
    }

    match s.trim_end() {
        ".exit" => Ok(Command::Exit),
        ".warnings" => Ok(Command::Warnings),
        s if !s.starts_with('.') => Ok(Command::Query(s.to_string())),
        s => Err(format!("unrecognized command '{s}'")),
    }
}
