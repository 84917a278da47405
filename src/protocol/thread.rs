//! Background writer for queries that span several blocks.
//!
//! A query larger than the socket buffers can fill our send buffer while the
//! server, busy answering the first part, blocks on its own full send buffer.
//! Handing the write to a worker lets the caller start reading the answer as
//! soon as the first block went out.
use std::{
    io::{self, Write},
    sync::{Arc, Condvar, Mutex, mpsc},
    thread,
};

use log::{debug, trace};

use super::transport::BlockWriter;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Writing,
}

#[derive(Debug)]
struct Status {
    state: State,
    /// The current job holds the send lock and has begun writing.
    started: bool,
    error: Option<String>,
}

type Shared = Arc<(Mutex<Status>, Condvar)>;

#[derive(Debug)]
pub struct WriterThread {
    sender: Option<mpsc::Sender<String>>,
    status: Shared,
    thread: Option<thread::JoinHandle<()>>,
}

impl WriterThread {
    pub fn new<W>(out: Arc<Mutex<BlockWriter<W>>>) -> io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let status: Shared = Arc::new((
            Mutex::new(Status {
                state: State::Idle,
                started: false,
                error: None,
            }),
            Condvar::new(),
        ));

        let shared = Arc::clone(&status);
        let thread = thread::Builder::new()
            .name("mapi-writer".into())
            .spawn(move || run(receiver, out, shared))?;

        Ok(Self {
            sender: Some(sender),
            status,
            thread: Some(thread),
        })
    }

    /// Hands `text` to the worker and returns once it started writing.
    pub fn submit(&self, text: String) -> Result<()> {
        let (lock, cvar) = &*self.status;
        let mut status = lock.lock().map_err(|_| poisoned())?;
        if status.state == State::Writing {
            return Err(Error::WriterBusy);
        }
        status.state = State::Writing;
        status.started = false;
        status.error = None;

        let sent = self.sender.as_ref().map(|s| s.send(text));
        if !matches!(sent, Some(Ok(()))) {
            status.state = State::Idle;
            return Err(Error::TransportClosed("writer thread is gone".into()));
        }

        let _status = cvar
            .wait_while(status, |s| s.state == State::Writing && !s.started)
            .map_err(|_| poisoned())?;
        Ok(())
    }

    /// Blocks until the worker is idle again and returns the error of the last
    /// job, if it failed.
    pub fn wait(&self) -> Option<String> {
        let (lock, cvar) = &*self.status;
        let status = match lock.lock() {
            Ok(status) => status,
            Err(_) => return Some("writer status lock poisoned".into()),
        };
        match cvar.wait_while(status, |s| s.state == State::Writing) {
            Ok(mut status) => status.error.take(),
            Err(_) => Some("writer status lock poisoned".into()),
        }
    }
}

impl Drop for WriterThread {
    fn drop(&mut self) {
        drop(self.sender.take());

        if let Some(thread) = self.thread.take() {
            debug!("shutting down writer thread");
            if thread.join().is_err() {
                debug!("writer thread panicked");
            }
        }
    }
}

fn poisoned() -> Error {
    Error::TransportClosed("writer status lock poisoned".into())
}

fn signal(status: &Shared, update: impl FnOnce(&mut Status)) {
    let (lock, cvar) = &**status;
    if let Ok(mut status) = lock.lock() {
        update(&mut status);
        cvar.notify_all();
    }
}

fn run<W: Write>(receiver: mpsc::Receiver<String>, out: Arc<Mutex<BlockWriter<W>>>, status: Shared) {
    for text in receiver {
        let res = match out.lock() {
            Ok(mut writer) => {
                signal(&status, |s| s.started = true);
                writer
                    .write_framed_with(&text, |written, total| {
                        trace!("writer thread sent block {written}/{total}");
                        signal(&status, |s| s.started = true);
                    })
                    .map_err(|e| e.to_string())
            }
            Err(_) => Err("send lock poisoned".to_string()),
        };

        signal(&status, |s| {
            s.state = State::Idle;
            s.started = true;
            s.error = res.err();
        });
    }
    debug!("writer thread disconnected");
}
