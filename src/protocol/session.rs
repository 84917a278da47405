//! The response state machine.
//!
//! A [`Session`] owns one block stream and runs at most one query on it at a
//! time. Sending a query and draining every line of its answer happens under
//! the session lock, and the lines are dispatched into typed [`Response`]s in
//! the order the server emits them. Tables keep a handle to their session so
//! they can fetch further chunks and release their server-side cursor later.
//!
//! Failures come in two flavours. Anything that leaves the stream position
//! unknown (I/O errors, EOF, timeouts, a failed background write) closes the
//! session. Everything else is collected while draining to the prompt and
//! reported as a [`QueryError`], after which the session is ready for the next
//! query.
use std::{
    fmt,
    io::{BufWriter, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use log::{debug, info, warn};

use super::{
    header::StartOfHeader,
    line::{Line, LineKind},
    request::Request,
    response::{Pending, Response, ResponseList, UpdateCount, Warning},
    result::{Chunk, Table, TableHeader},
    thread::WriterThread,
    trace::DebugLog,
    transport::{BlockReader, BlockWriter, TransportError},
};
use crate::{
    config::{CursorKind, Language, QueryOptions, SessionConfig},
    error::{Error, Failure, QueryError, Result},
};

const INCOMPLETE_QUERY: &str = "incomplete query: server expects more input";
const NO_SUCH_RESULT: &str = "M0M12";
const AUTO_COMMIT_REDUNDANT: &str = "01M11";
const SERVER_INFO: &str = "01000";

type Reader = BlockReader<Box<dyn Read + Send>>;
type Writer = BlockWriter<Box<dyn Write + Send>>;

/// State only touched while a query is in flight.
struct Conversation {
    reader: Reader,
    /// Reply size the server was last told about.
    reply_size: Option<usize>,
    writer: Option<WriterThread>,
}

struct Core {
    conversation: Mutex<Conversation>,
    sender: Arc<Mutex<Writer>>,
    config: SessionConfig,
    seq: AtomicU64,
    auto_commit: AtomicBool,
    closed: AtomicBool,
    warnings: Mutex<Vec<Warning>>,
    /// Results whose release came in while the session was busy.
    deferred: Mutex<Vec<i64>>,
    socket: Option<TcpStream>,
}

/// Handle to one authenticated connection. Clones share the connection.
#[derive(Clone)]
pub struct Session {
    core: Arc<Core>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("language", &self.core.config.language)
            .field("seq", &self.last_seq())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Where the rows of a continuation block go.
enum Target<'a> {
    Query { options: &'a QueryOptions, seq: u64 },
    Fetch(&'a mut Table),
}

impl Target<'_> {
    fn chunk_cursor(&self, id: i64, responses: &[Response]) -> Option<CursorKind> {
        if let Target::Fetch(table) = self {
            if let Some(cursor) = table.expects_chunk(id) {
                return Some(cursor);
            }
        }
        responses
            .iter()
            .filter_map(Response::as_table)
            .find_map(|table| table.expects_chunk(id))
    }

    fn attach(&mut self, id: i64, offset: usize, chunk: Chunk, responses: &mut [Response]) {
        if let Target::Fetch(table) = self {
            if table.expects_chunk(id).is_some() {
                table.attach(offset, chunk);
                return;
            }
        }
        match responses
            .iter_mut()
            .filter_map(Response::as_table_mut)
            .find(|table| table.expects_chunk(id).is_some())
        {
            Some(table) => table.attach(offset, chunk),
            None => warn!("dropping block for unknown result {id}"),
        }
    }
}

/// Everything one query produced.
#[derive(Default)]
struct Outcome {
    responses: Vec<Response>,
    failures: QueryError,
}

impl Outcome {
    fn fail(&mut self, failure: Failure) {
        debug!("query failure: {}", failure.message);
        self.failures.push(failure);
    }

    fn extend(&mut self, failures: Vec<Failure>) {
        for failure in failures {
            self.fail(failure);
        }
    }

    /// Must be called without holding the session lock: dropping the
    /// responses of a failed query releases their server-side results.
    fn into_list(self, cursor: CursorKind) -> Result<ResponseList> {
        if !self.failures.is_empty() {
            return Err(Error::Query(self.failures));
        }
        Ok(ResponseList::new(self.responses, cursor))
    }
}

impl Session {
    /// Wraps an authenticated stream pair. The reader must be positioned right
    /// after the server's last prompt.
    pub fn new<R, W>(reader: R, writer: W, config: SessionConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::build(Box::new(reader), Box::new(writer), config, None)
    }

    /// Wraps an authenticated TCP connection. Closing the session shuts the
    /// socket down, which also wakes up a reader blocked on it.
    pub fn connect_tcp(stream: TcpStream, config: SessionConfig) -> Result<Self> {
        stream.set_nodelay(true).map_err(TransportError::from)?;
        stream
            .set_read_timeout(config.read_timeout)
            .map_err(TransportError::from)?;
        let reader = stream.try_clone().map_err(TransportError::from)?;
        let writer = BufWriter::new(stream.try_clone().map_err(TransportError::from)?);
        Self::build(Box::new(reader), Box::new(writer), config, Some(stream))
    }

    fn build(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: SessionConfig,
        socket: Option<TcpStream>,
    ) -> Result<Self> {
        config.validate()?;
        let debug = config
            .debug_log
            .as_deref()
            .map(DebugLog::create)
            .transpose()
            .map_err(Error::DebugLog)?;

        let reader = BlockReader::new(reader, config.read_block_size()).with_debug(debug.clone());
        let sender = BlockWriter::new(writer, config.block_size).with_debug(debug);
        debug!("new {:?} session, block size {}", config.language, config.block_size);

        Ok(Self {
            core: Arc::new(Core {
                conversation: Mutex::new(Conversation {
                    reader,
                    reply_size: None,
                    writer: None,
                }),
                sender: Arc::new(Mutex::new(sender)),
                config,
                seq: AtomicU64::new(0),
                auto_commit: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                warnings: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
                socket,
            }),
        })
    }

    pub fn query(&self, text: &str) -> Result<ResponseList> {
        self.query_with(text, QueryOptions::default())
    }

    /// Sends `text` wrapped in the query template and collects all responses.
    pub fn query_with(&self, text: &str, options: QueryOptions) -> Result<ResponseList> {
        let mut conv = self.lock()?;
        self.begin(&mut conv)?;

        let language = &self.core.config.language;
        if language.is_sql() {
            let size = options.reply_size(self.core.config.default_fetch_size);
            if conv.reply_size != Some(size) {
                self.control(&mut conv, &Request::ReplySize(size).to_string())?;
                conv.reply_size = Some(size);
            }
        }

        let seq = self.core.seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("query {seq}: {text}");
        let query = language.query_template().render(text);
        let outcome = self.converse(
            &mut conv,
            &query,
            Target::Query {
                options: &options,
                seq,
            },
        );
        drop(conv);
        outcome?.into_list(options.cursor)
    }

    /// Fetches the chunk `request` asks for and attaches it to `table`.
    pub(crate) fn fetch_chunk(&self, table: &mut Table, request: &Request) -> Result<()> {
        let mut conv = self.lock()?;
        self.begin(&mut conv)?;

        let text = self
            .core
            .config
            .language
            .command_template()
            .render(&request.to_string());
        let outcome = self.converse(&mut conv, &text, Target::Fetch(table));
        drop(conv);
        outcome?.into_list(CursorKind::ForwardOnly).map(drop)
    }

    /// Sends a control command and waits for the prompt; output other than
    /// errors is discarded.
    pub fn send_control_command(&self, command: &str) -> Result<()> {
        let mut conv = self.lock()?;
        self.begin(&mut conv)?;
        self.control(&mut conv, command)
    }

    pub fn send_request(&self, request: &Request) -> Result<()> {
        let mut conv = self.lock()?;
        self.begin(&mut conv)?;
        self.control(&mut conv, &request.to_string())?;
        if let Request::ReplySize(size) = request {
            conv.reply_size = Some(*size);
        }
        Ok(())
    }

    /// Like [`send_control_command`](Self::send_control_command), but wraps
    /// `command` in the query template.
    pub fn send_independent_command(&self, command: &str) -> Result<()> {
        let mut conv = self.lock()?;
        self.begin(&mut conv)?;
        let text = self.core.config.language.query_template().render(command);
        self.exchange(&mut conv, &text)
    }

    pub fn set_auto_commit(&self, on: bool) -> Result<()> {
        self.send_request(&Request::AutoCommit(on))?;
        self.core.auto_commit.store(on, Ordering::SeqCst);
        Ok(())
    }

    pub fn auto_commit(&self) -> bool {
        self.core.auto_commit.load(Ordering::SeqCst)
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.core
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_warnings(&self) {
        self.core
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Closes the session. A thread blocked reading from a TCP session is
    /// woken up with a transport error.
    pub fn close(&self) {
        info!("closing session");
        self.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn language(&self) -> &Language {
        &self.core.config.language
    }

    /// Sequence number of the most recent query.
    pub fn last_seq(&self) -> u64 {
        self.core.seq.load(Ordering::SeqCst)
    }

    /// Releases the server side of result `id`. When the session is busy the
    /// release is sent at the start of the next conversation instead.
    pub(crate) fn release(&self, id: i64) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match self.core.conversation.try_lock() {
            Ok(mut conv) => {
                self.begin(&mut conv)?;
                self.control(&mut conv, &Request::Release { id }.to_string())
            }
            Err(TryLockError::WouldBlock) => {
                debug!("session busy, deferring release of result {id}");
                self.core
                    .deferred
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(id);
                Ok(())
            }
            Err(TryLockError::Poisoned(_)) => Err(self.poisoned()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Conversation>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.core.conversation.lock().map_err(|_| self.poisoned())
    }

    /// Resynchronises at the prompt and sends deferred releases.
    fn begin(&self, conv: &mut Conversation) -> Result<()> {
        let stale = self.drain(conv)?;
        if !stale.is_empty() {
            debug!("discarding {} stale errors", stale.len());
        }

        let deferred = std::mem::take(
            &mut *self
                .core
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in deferred {
            info!("releasing server side of result {id}");
            if let Err(e) = self.control(conv, &Request::Release { id }.to_string()) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("failed to release result {id}: {e}");
            }
        }
        Ok(())
    }

    fn control(&self, conv: &mut Conversation, command: &str) -> Result<()> {
        let text = self.core.config.language.command_template().render(command);
        self.exchange(conv, &text)
    }

    /// Sends `text` and reads up to the prompt, keeping only errors.
    fn exchange(&self, conv: &mut Conversation, text: &str) -> Result<()> {
        self.write_framed(text)?;

        let mut failures = QueryError::default();
        let line = self.read(conv)?;
        if line.kind() == LineKind::Error {
            failures.push(Failure::server(line.payload()));
        }
        for failure in self.drain(conv)? {
            failures.push(failure);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Query(failures))
        }
    }

    /// Sends `text` and dispatches every line up to the prompt.
    fn converse(&self, conv: &mut Conversation, text: &str, mut target: Target<'_>) -> Result<Outcome> {
        let via_writer = text.len() > self.core.config.block_size;
        if via_writer {
            self.submit(conv, text)?;
        } else {
            self.write_framed(text)?;
        }

        let mut outcome = Outcome::default();
        let mut line = self.read(conv)?;
        loop {
            match line.kind() {
                LineKind::Prompt => break,
                LineKind::MorePrompt => {
                    outcome.fail(Failure::protocol(INCOMPLETE_QUERY));
                    self.write_framed("")?;
                }
                LineKind::StartOfHeader => {
                    self.dispatch(conv, &line, &mut target, &mut outcome)?;
                    if conv.reader.last_kind() == LineKind::Prompt {
                        break;
                    }
                }
                LineKind::Info => self.add_warning(Warning::new(line.payload(), SERVER_INFO)),
                LineKind::Error => {
                    outcome.fail(Failure::server(line.payload()));
                    outcome.extend(self.drain(conv)?);
                    break;
                }
                _ => {
                    outcome.fail(Failure::protocol(format!(
                        "protocol violation, unexpected line: {}",
                        line.text()
                    )));
                    outcome.extend(self.drain(conv)?);
                    break;
                }
            }
            line = self.read(conv)?;
        }

        if via_writer {
            if let Some(err) = conv.writer.as_ref().and_then(WriterThread::wait) {
                return Err(self.fatal(format!("writer thread failed: {err}")));
            }
        }
        Ok(outcome)
    }

    /// Builds the response announced by a start-of-header line and feeds it
    /// until it is satisfied.
    fn dispatch(
        &self,
        conv: &mut Conversation,
        line: &Line,
        target: &mut Target<'_>,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let header = match StartOfHeader::parse(line.text()) {
            Ok(header) => header,
            Err(e) => {
                let failure = Failure::protocol(format!("error while parsing start of header: {e}"));
                return self.abort(conv, outcome, failure);
            }
        };

        let mut pending = match header {
            StartOfHeader::Parse => {
                let failure = Failure::protocol("Q_PARSE header not allowed here");
                return self.abort(conv, outcome, failure);
            }
            StartOfHeader::Table {
                id,
                tuple_count,
                column_count,
                row_count,
                prepared,
            } => {
                let (options, seq) = match target {
                    Target::Query { options, seq } => (**options, *seq),
                    Target::Fetch(_) => (QueryOptions::default(), self.last_seq()),
                };
                debug!("result {id}: {tuple_count} rows, {column_count} columns, {row_count} sent");
                let header = TableHeader {
                    id,
                    tuple_count,
                    column_count,
                    row_count,
                    prepared,
                };
                Pending::Response(Response::Table(Table::new(header, self.clone(), &options, seq)))
            }
            StartOfHeader::Update { count, last_id } => {
                Pending::Response(Response::Update(UpdateCount { count, last_id }))
            }
            StartOfHeader::Schema => Pending::Response(Response::Schema),
            StartOfHeader::Transaction { auto_commit } => {
                if self.core.auto_commit.swap(auto_commit, Ordering::SeqCst) && auto_commit {
                    self.add_warning(Warning::new(
                        "Server enabled auto commit mode while local state already was auto commit.",
                        AUTO_COMMIT_REDUNDANT,
                    ));
                }
                Pending::Response(Response::Transaction { auto_commit })
            }
            StartOfHeader::Block {
                id,
                row_count,
                offset,
                ..
            } => {
                let Some(cursor) = target.chunk_cursor(id, &outcome.responses) else {
                    let failure = Failure::protocol(format!("no result with id {id} found"))
                        .with_sqlstate(NO_SUCH_RESULT);
                    return self.abort(conv, outcome, failure);
                };
                debug!("block of {row_count} rows for result {id} at offset {offset}");
                Pending::Chunk {
                    id,
                    offset,
                    chunk: Chunk::new(row_count, cursor == CursorKind::ForwardOnly),
                }
            }
        };

        while pending.wants_more() {
            let next = self.read(conv)?;
            if let Err(e) = pending.add_line(next) {
                return self.abort(conv, outcome, Failure::protocol(e));
            }
        }
        if let Err(e) = pending.complete() {
            outcome.fail(Failure::consistency(e));
            return Ok(());
        }

        match pending {
            Pending::Response(response) => outcome.responses.push(response),
            Pending::Chunk { id, offset, chunk } => {
                target.attach(id, offset, chunk, &mut outcome.responses)
            }
        }
        Ok(())
    }

    fn abort(&self, conv: &mut Conversation, outcome: &mut Outcome, failure: Failure) -> Result<()> {
        outcome.fail(failure);
        outcome.extend(self.drain(conv)?);
        Ok(())
    }

    /// Reads up to the next prompt, collecting error lines. A more-prompt is
    /// answered with an empty block so the server gives up on the input.
    fn drain(&self, conv: &mut Conversation) -> Result<Vec<Failure>> {
        let mut failures = Vec::new();
        loop {
            let errors = conv.reader.wait_for_prompt().map_err(|e| self.fatal(e))?;
            failures.extend(errors.iter().map(|e| Failure::server(e)));
            if conv.reader.last_kind() != LineKind::MorePrompt {
                return Ok(failures);
            }

            failures.push(Failure::protocol(INCOMPLETE_QUERY));
            self.write_framed("")?;
            let line = self.read(conv)?;
            if line.kind() == LineKind::Error {
                failures.push(Failure::server(line.payload()));
            }
        }
    }

    fn submit(&self, conv: &mut Conversation, text: &str) -> Result<()> {
        let writer = match conv.writer.take() {
            Some(writer) => writer,
            None => WriterThread::new(Arc::clone(&self.core.sender)).map_err(|e| self.fatal(e))?,
        };
        debug!("handing {} bytes to the writer thread", text.len());
        let res = writer.submit(text.to_string());
        conv.writer = Some(writer);
        res
    }

    fn read(&self, conv: &mut Conversation) -> Result<Line> {
        conv.reader.read_line().map_err(|e| self.fatal(e))
    }

    fn write_framed(&self, text: &str) -> Result<()> {
        let mut sender = self.core.sender.lock().map_err(|_| self.poisoned())?;
        sender.write_framed(text).map_err(|e| self.fatal(e))
    }

    fn add_warning(&self, warning: Warning) {
        debug!("warning: {warning}");
        self.core
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning);
    }

    /// Marks the session unusable. Tables dropped from here on skip their
    /// server-side release.
    fn fatal(&self, reason: impl fmt::Display) -> Error {
        warn!("session failed: {reason}");
        self.shutdown();
        Error::TransportClosed(reason.to_string())
    }

    fn poisoned(&self) -> Error {
        self.fatal("session lock poisoned")
    }

    fn shutdown(&self) {
        self.core.closed.store(true, Ordering::SeqCst);
        if let Some(socket) = &self.core.socket {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!("socket shutdown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::{self, Cursor, Read},
        net::TcpListener,
        sync::mpsc,
        thread,
        time::Duration,
    };

    use tempdir::TempDir;

    use super::*;
    use crate::{
        config::Language,
        error::FailureKind,
        protocol::mock::{self, Script, blocks},
    };

    /// A loopback server that reads everything and never answers. Each
    /// received chunk is reported on the returned channel; the thread yields
    /// the byte count once the client goes away.
    fn silent_server() -> (TcpStream, thread::JoinHandle<usize>, mpsc::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen, seen_rx) = mpsc::channel();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0_u8; 1024];
            let mut total = 0;
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return total,
                    Ok(n) => {
                        total += n;
                        let _ = seen.send(());
                    }
                }
            }
        });

        (TcpStream::connect(addr).unwrap(), server, seen_rx)
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("connection reset"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const HEADERS: [&str; 4] = [
        "% sys.t # table_name",
        "% n # name",
        "% int # type",
        "% 3 # length",
    ];

    fn table_reply(sof: &str, rows: std::ops::Range<usize>) -> Vec<String> {
        let mut lines = vec![sof.to_string()];
        lines.extend(HEADERS.iter().map(|h| h.to_string()));
        lines.extend(rows.map(|i| format!("[ {i}\t]")));
        lines
    }

    fn block_reply(sof: &str, rows: std::ops::Range<usize>) -> Vec<String> {
        let mut lines = vec![sof.to_string()];
        lines.extend(rows.map(|i| format!("[ {i}\t]")));
        lines
    }

    #[test]
    fn responses_keep_server_order() {
        let mut reply = table_reply("&1 1 2 1 2", 0..2);
        reply.extend(["&2 5 -1".to_string(), "&3".to_string()]);
        let script = Script::new().reply(&[]).reply_all(&reply);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let list = session.query("select n from t").unwrap();
        let kinds: Vec<&str> = list
            .into_iter()
            .map(|r| match r {
                Response::Table(_) => "table",
                Response::Update(_) => "update",
                Response::Schema => "schema",
                Response::Transaction { .. } => "transaction",
            })
            .collect();
        assert_eq!(kinds, vec!["table", "update", "schema"]);
        assert_eq!(capture.messages(), ["Xreply_size 250", "sselect n from t\n;"]);
    }

    #[test]
    fn table_exposes_columns_and_rows() {
        let script = Script::new()
            .reply(&[])
            .reply_all(&table_reply("&1 4 3 1 3", 0..3));
        let (session, _) = mock::session(script, SessionConfig::default());

        let mut list = session.query("select n from t").unwrap();
        let table = list.next_response().unwrap().unwrap().as_table_mut().unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.columns()[0].name, "n");
        assert_eq!(table.columns()[0].type_name, "int");
        assert_eq!(table.columns()[0].width, 3);

        let rows: Vec<String> = table.rows().collect::<Result<_>>().unwrap();
        assert_eq!(rows, vec!["[ 0\t]", "[ 1\t]", "[ 2\t]"]);
    }

    #[test]
    fn server_error_leaves_session_usable() {
        let script = Script::new()
            .reply(&[])
            .reply(&["!permission denied"])
            .reply(&["&2 1 42"]);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let err = session.query("drop table t").unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "permission denied");

        let mut list = session.query("insert into t values (1)").unwrap();
        let update = list.next_response().unwrap().unwrap().update_count().unwrap().clone();
        assert_eq!(update.count, 1);
        assert_eq!(update.last_id.as_deref(), Some("42"));
        assert_eq!(capture.messages().len(), 3);
    }

    #[test]
    fn error_lines_are_collected_until_prompt() {
        let script = Script::new()
            .reply(&[])
            .reply(&["!42000!syntax error", "!42000!and another"]);
        let (session, _) = mock::session(script, SessionConfig::default());

        let Error::Query(err) = session.query("selec 1").unwrap_err() else {
            panic!("expected a query error");
        };
        assert_eq!(err.sqlstate(), Some("42000"));
        assert_eq!(err.to_string(), "syntax error\nand another");
    }

    #[test]
    fn unexpected_line_is_a_protocol_violation() {
        let script = Script::new()
            .reply(&[])
            .reply(&["garbage", "!also this"])
            .reply(&["&3"]);
        let (session, _) = mock::session(script, SessionConfig::default());

        let Error::Query(err) = session.query("select 1").unwrap_err() else {
            panic!("expected a query error");
        };
        let kinds: Vec<FailureKind> = err.failures().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FailureKind::Protocol, FailureKind::Server]);
        assert_eq!(err.sqlstate(), Some("M0M10"));
        assert!(err.failures()[0].message.ends_with("garbage"));

        assert_eq!(session.query("create table u (a int)").unwrap().len(), 1);
    }

    #[test]
    fn block_for_unknown_result() {
        let script = Script::new().reply(&[]).reply(&["&6 9 1 1 0", "[ 1\t]"]);
        let (session, _) = mock::session(script, SessionConfig::default());

        let Error::Query(err) = session.query("select 1").unwrap_err() else {
            panic!("expected a query error");
        };
        assert_eq!(err.sqlstate(), Some("M0M12"));
    }

    #[test]
    fn parse_header_is_rejected() {
        let script = Script::new().reply(&[]).reply(&["&0 1 2"]);
        let (session, _) = mock::session(script, SessionConfig::default());

        let err = session.query("select 1").unwrap_err();
        assert_eq!(err.to_string(), "Q_PARSE header not allowed here");
    }

    #[test]
    fn info_lines_become_warnings() {
        let script = Script::new().reply(&[]).reply(&["#note this", "&3"]);
        let (session, _) = mock::session(script, SessionConfig::default());

        let list = session.query("create table t (a int)").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(session.warnings(), vec![Warning::new("note this", "01000")]);

        session.clear_warnings();
        assert!(session.warnings().is_empty());
    }

    #[test]
    fn forward_only_rows_are_read_once() {
        let script = Script::new()
            .reply(&[])
            .reply_all(&table_reply("&1 1 2 1 2", 0..2));
        let (session, _) = mock::session(script, SessionConfig::default());

        let mut list = session.query("select n from t").unwrap();
        let table = list.next_response().unwrap().unwrap().as_table_mut().unwrap();
        assert_eq!(table.row(0).unwrap().as_deref(), Some("[ 0\t]"));
        assert_eq!(table.row(0).unwrap(), None);
        assert_eq!(table.row(1).unwrap().as_deref(), Some("[ 1\t]"));
        assert_eq!(table.row(2).unwrap(), None);
    }

    #[test]
    fn sequential_scan_grows_chunks() {
        let script = Script::new()
            .reply(&[])
            .reply_all(&table_reply("&1 1 300 1 2", 0..2))
            .reply_all(&block_reply("&6 1 1 20 2", 2..22))
            .reply_all(&block_reply("&6 1 1 200 22", 22..222))
            .reply_all(&block_reply("&6 1 1 78 222", 222..300))
            .reply(&[]);
        let config = SessionConfig::default()
            .with_default_fetch_size(2)
            .with_fetch_memory_budget(400);
        let (session, capture) = mock::session(script, config);

        let mut list = session.query("select n from t").unwrap();
        let table = list.next_response().unwrap().unwrap().as_table_mut().unwrap();
        let rows: Vec<String> = table.rows().collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 300);
        assert_eq!(rows[299], "[ 299\t]");
        assert_eq!(table.chunk_size(), 200);
        assert_eq!(table.row(5).unwrap(), None);
        drop(list);

        assert_eq!(
            capture.messages(),
            [
                "Xreply_size 2",
                "sselect n from t\n;",
                "Xexport 1 2 20",
                "Xexport 1 22 200",
                "Xexport 1 222 200",
                "Xclose 1",
            ]
        );
    }

    #[test]
    fn scrollable_cursor_keeps_chunks() {
        let script = Script::new()
            .reply(&[])
            .reply_all(&table_reply("&1 3 5 1 2", 0..2))
            .reply_all(&block_reply("&6 3 1 1 4", 4..5))
            .reply(&[]);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let options = QueryOptions::scrollable().with_fetch_size(2);
        let mut list = session.query_with("select n from t", options).unwrap();
        let table = list.next_response().unwrap().unwrap().as_table_mut().unwrap();

        assert_eq!(table.row(4).unwrap().as_deref(), Some("[ 4\t]"));
        assert_eq!(table.row(0).unwrap().as_deref(), Some("[ 0\t]"));
        assert_eq!(table.row(0).unwrap().as_deref(), Some("[ 0\t]"));
        assert_eq!(table.resident_chunks(), 2);
        assert_eq!(table.chunk_size(), 2);

        table.close().unwrap();
        assert!(table.is_closed());
        assert_eq!(table.row(0).unwrap(), None);
        assert_eq!(
            capture.messages(),
            ["Xreply_size 2", "sselect n from t\n;", "Xexport 3 4 2", "Xclose 3"]
        );
    }

    #[test]
    fn release_of_failed_table_is_deferred() {
        let mut reply = table_reply("&1 7 10 1 2", 0..1);
        reply.push("oops".to_string());
        let script = Script::new()
            .reply(&[])
            .reply_all(&reply)
            .reply(&[])
            .reply(&["&3"]);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let err = session.query("select n from t").unwrap_err();
        assert!(err.to_string().contains("unexpected line in data block"));

        session.query("create table u (a int)").unwrap();
        assert_eq!(
            capture.messages(),
            [
                "Xreply_size 250",
                "sselect n from t\n;",
                "Xclose 7",
                "screate table u (a int)\n;",
            ]
        );
    }

    #[test]
    fn reply_size_only_for_sql() {
        let script = Script::new().reply(&["&3"]);
        let config = SessionConfig::default().with_language(Language::Mal);
        let (session, capture) = mock::session(script, config);

        session.query("io.print(1)").unwrap();
        assert_eq!(capture.messages(), ["io.print(1);\n"]);
    }

    #[test]
    fn transport_failure_closes_session() {
        let script = Script::new().reply(&[]);
        let (session, _) = mock::session(script, SessionConfig::default());

        let err = session.query("select 1").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::TransportClosed(_)));
        assert!(session.is_closed());
        assert!(matches!(session.query("select 1"), Err(Error::Closed)));
    }

    #[test]
    fn explicit_close() {
        let (session, capture) = mock::session(Script::new(), SessionConfig::default());
        session.close();
        assert!(matches!(session.query("select 1"), Err(Error::Closed)));
        assert!(capture.bytes().is_empty());
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let (client, server, seen) = silent_server();
        let session = Session::connect_tcp(client, SessionConfig::default()).unwrap();

        let handle = session.clone();
        let query = thread::spawn(move || handle.query("select 1"));
        seen.recv_timeout(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(50));
        session.close();

        let err = query.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::TransportClosed(_)));
        assert!(err.is_fatal());
        assert!(matches!(session.query("select 1"), Err(Error::Closed)));
        assert!(server.join().unwrap() > 0);
    }

    #[test]
    fn read_timeout_closes_session() {
        let (client, server, _seen) = silent_server();
        let config = SessionConfig::default().with_read_timeout(Duration::from_millis(50));
        let session = Session::connect_tcp(client, config).unwrap();

        let err = session.query("select 1").unwrap_err();
        assert!(matches!(err, Error::TransportClosed(_)));
        assert!(err.is_fatal());
        assert!(session.is_closed());
        server.join().unwrap();
    }

    #[test]
    fn writer_thread_failure_closes_session() {
        let script = Script::new().reply(&["&3"]);
        let config = SessionConfig::default().with_language(Language::Other("raw".into()));
        let session = Session::new(Cursor::new(script.into_bytes()), Broken, config).unwrap();

        let err = session.query(&"x".repeat(50_000)).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("writer thread failed"), "{err}");
        assert!(session.is_closed());
    }

    #[test]
    fn invalid_block_size_is_an_error() {
        let config = SessionConfig {
            block_size: 0,
            ..SessionConfig::default()
        };
        let res = Session::new(Cursor::new(Vec::new()), io::sink(), config);
        assert!(matches!(res, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn small_block_size_still_reads_server_blocks() {
        let script = Script::new()
            .reply(&[])
            .reply_all(&table_reply("&1 0 3 1 3", 0..3));
        let (session, capture) = mock::session(script, SessionConfig::default().with_block_size(16));

        let mut list = session.query("select n from t").unwrap();
        let table = list.next_response().unwrap().unwrap().as_table_mut().unwrap();
        assert_eq!(table.rows().count(), 3);
        assert!(blocks(&capture.bytes()).iter().all(|(len, _)| *len <= 16));
    }

    #[test]
    fn max_rows_caps_row_count() {
        let script = Script::new()
            .reply(&[])
            .reply_all(&table_reply("&1 1 1000 1 5", 0..5))
            .reply(&[]);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let options = QueryOptions::default().with_max_rows(5);
        let mut list = session.query_with("select n from t", options).unwrap();
        let table = list.next_response().unwrap().unwrap().as_table_mut().unwrap();
        assert_eq!(table.row_count(), 5);

        let rows: Vec<String> = table.rows().collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 5);
        drop(list);

        assert_eq!(
            capture.messages(),
            ["Xreply_size 5", "sselect n from t\n;", "Xclose 1"]
        );
    }

    #[test]
    fn debug_log_mirrors_traffic() {
        let temp = TempDir::new("session-log").unwrap();
        let path = temp.path().join("mapi.log");
        let script = Script::new().reply(&[]).reply(&["&3"]);
        let (session, _) = mock::session(script, SessionConfig::default().with_debug_log(&path));

        session.query("create table t (a int)").unwrap();

        let out = fs::read_to_string(&path).unwrap();
        let position = |entry: &str| out.find(entry).unwrap_or_else(|| panic!("no {entry} in {out}"));
        assert!(position("TX") < position("RD"));
        assert!(position("RD") < position("RX"));
        assert!(out.contains(": Xreply_size 250"));
        assert!(out.lines().any(|l| l.starts_with("RX ") && l.ends_with(": &3")));
    }

    #[test]
    fn auto_commit_state() {
        let script = Script::new().reply(&[]).reply(&["&4 t"]).reply(&[]);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let mut list = session.query("commit").unwrap();
        assert!(matches!(
            list.next_response().unwrap(),
            Some(Response::Transaction { auto_commit: true })
        ));
        assert_eq!(session.warnings()[0].sqlstate.as_deref(), Some("01M11"));

        session.set_auto_commit(false).unwrap();
        assert!(!session.auto_commit());
        assert_eq!(capture.messages().last().unwrap(), "Xauto_commit 0");
    }

    #[test]
    fn more_prompt_is_answered_with_empty_block() {
        let script = Script::new().reply(&[]).reply(&["\u{1}\u{2}"]).reply(&[]);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let err = session.query("select 1 +").unwrap_err();
        assert!(err.to_string().starts_with("incomplete query"));
        assert!(!err.is_fatal());
        assert_eq!(capture.messages().last().unwrap(), "");
    }

    #[test]
    fn independent_command_reports_errors() {
        let script = Script::new().reply(&["!42000!no such schema"]);
        let (session, capture) = mock::session(script, SessionConfig::default());

        let Error::Query(err) = session.send_independent_command("set schema x").unwrap_err() else {
            panic!("expected a query error");
        };
        assert_eq!(err.sqlstate(), Some("42000"));
        assert_eq!(capture.messages(), ["sset schema x\n;"]);
    }

    #[test]
    fn large_query_goes_through_writer_thread() {
        let script = Script::new().reply(&["&3"]);
        let config = SessionConfig::default().with_language(Language::Other("raw".into()));
        let (session, capture) = mock::session(script, config);

        let query = "x".repeat(50_000);
        assert_eq!(session.query(&query).unwrap().len(), 1);

        let blocks = blocks(&capture.bytes());
        assert_eq!(blocks.len(), 50_000_usize.div_ceil(8190));
        assert!(blocks[..6].iter().all(|(_, last)| !last));
        assert!(blocks[6].1);
        assert_eq!(capture.messages(), [query]);
    }
}
