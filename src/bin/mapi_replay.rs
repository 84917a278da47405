use clap::Parser;
use std::{
    error::Error,
    fs::File,
    io::{self, BufReader, Write},
    path::PathBuf,
    process,
};

use mapi::{
    Command, Language, Response, ResponseList, Session, SessionConfig, prompt,
    protocol::header::parse_tuple,
};

/// Replays a recorded server byte stream against the queries typed on stdin.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Recorded server output, as raw blocks
    transcript: PathBuf,
    /// Mirror all traffic to this file
    #[arg(long)]
    debug_log: Option<PathBuf>,
    /// Query language of the recorded session
    #[arg(long, default_value = "sql")]
    language: String,
    /// Rows to request per chunk
    #[arg(long)]
    fetch_size: Option<usize>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut config = SessionConfig::default().with_language(Language::from(cli.language.as_str()));
    if let Some(path) = cli.debug_log {
        config = config.with_debug_log(path);
    }
    if let Some(size) = cli.fetch_size.filter(|s| *s > 0) {
        config = config.with_default_fetch_size(size);
    }

    let transcript = BufReader::new(File::open(&cli.transcript)?);
    let session = Session::new(transcript, io::sink(), config)?;

    let handle = session.clone();
    ctrlc::set_handler(move || {
        handle.close();
        eprintln!("interrupted");
        process::exit(130);
    })?;

    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();

    loop {
        match prompt(&mut stdin, &mut stdout) {
            Ok(Command::Exit) => break,
            Ok(Command::Warnings) => {
                for warning in session.warnings() {
                    writeln!(stdout, "warning: {warning}")?;
                }
                session.clear_warnings();
            }
            Ok(Command::Query(query)) if query.trim().is_empty() => {}
            Ok(Command::Query(query)) => match session.query(&query) {
                Ok(responses) => print_responses(&mut stdout, responses)?,
                Err(e) if e.is_fatal() => {
                    eprintln!("error: {e}");
                    break;
                }
                Err(e) => eprintln!("error: {e}"),
            },
            Err(e) => eprintln!("error: {e}"),
        }
    }

    session.close();
    Ok(())
}

fn print_responses(out: &mut impl Write, responses: ResponseList) -> Result<(), Box<dyn Error>> {
    for response in responses {
        match response {
            Response::Table(mut table) => {
                let names: Vec<String> = table.columns().iter().map(|c| c.name.clone()).collect();
                writeln!(out, "{}", names.join(" | "))?;
                for row in table.rows() {
                    let values: Vec<String> = parse_tuple(&row?)?
                        .into_iter()
                        .map(|v| v.unwrap_or_else(|| "NULL".into()))
                        .collect();
                    writeln!(out, "{}", values.join(" | "))?;
                }
                writeln!(out, "({} rows)", table.row_count())?;
            }
            Response::Update(update) => writeln!(out, "{} affected rows", update.count)?,
            Response::Schema => writeln!(out, "operation successful")?,
            Response::Transaction { auto_commit } => {
                writeln!(out, "auto commit {}", if auto_commit { "on" } else { "off" })?
            }
        }
    }
    Ok(())
}
