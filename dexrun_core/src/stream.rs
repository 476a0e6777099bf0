use std::io::{BufRead, BufReader, Read};
use std::mem;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Errors arising from misuse of a [`StreamConsumer`].
///
/// Read failures on the stream itself are not errors: they are logged on the
/// worker thread and simply end the drain.
#[derive(Error, Debug)]
pub enum StreamError {
    /// `start` was called on a consumer whose worker is already running.
    #[error("Stream consumer '{0}' was already started")]
    AlreadyStarted(&'static str),

    /// A stream was handed over before `start`.
    #[error("Stream consumer '{0}' has not been started")]
    NotStarted(&'static str),

    /// A new stream was handed over before `process_finished` was called for
    /// the previous one.
    #[error("Stream consumer '{0}' is still consuming a previous stream")]
    AlreadyConsuming(&'static str),

    /// `process_finished` was called with no stream being consumed.
    #[error("Stream consumer '{0}' is not consuming any stream")]
    NotConsuming(&'static str),

    /// The consumer was shut down and cannot be reused.
    #[error("Stream consumer '{0}' has been shut down")]
    ShutDown(&'static str),

    /// The worker thread exited unexpectedly.
    #[error("Stream consumer '{0}' lost its worker thread")]
    WorkerGone(&'static str),

    #[error("Failed to spawn worker thread for stream consumer '{0}': {1}")]
    Spawn(&'static str, std::io::Error),
}

enum Job {
    Consume(Box<dyn Read + Send>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Ready,
    Consuming,
    ShutDown,
}

/// Drains a child process output stream on a dedicated, long-lived thread.
///
/// A consumer is started once and then reused for any number of sequential
/// processes: hand it a stream with [`give_stream_and_start_consuming`],
/// wait for the process, call [`process_finished`] and collect the lines with
/// [`get_output`]. Keeping the thread alive between processes avoids paying
/// for a thread spawn on every execution.
///
/// [`give_stream_and_start_consuming`]: StreamConsumer::give_stream_and_start_consuming
/// [`process_finished`]: StreamConsumer::process_finished
/// [`get_output`]: StreamConsumer::get_output
pub struct StreamConsumer {
    name: &'static str,
    state: State,
    jobs: Option<Sender<Job>>,
    drained: Option<Receiver<Vec<String>>>,
    worker: Option<JoinHandle<()>>,
    output: Vec<String>,
}

impl StreamConsumer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: State::Idle,
            jobs: None,
            drained: None,
            worker: None,
            output: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn start(&mut self) -> Result<(), StreamError> {
        match self.state {
            State::Idle => {}
            State::ShutDown => return Err(StreamError::ShutDown(self.name)),
            State::Ready | State::Consuming => return Err(StreamError::AlreadyStarted(self.name)),
        }

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (done_tx, done_rx) = mpsc::channel::<Vec<String>>();
        let name = self.name;
        let worker = thread::Builder::new()
            .name(format!("stream-{name}"))
            .spawn(move || {
                for job in job_rx {
                    match job {
                        Job::Consume(stream) => {
                            let lines = drain_lines(name, stream);
                            if done_tx.send(lines).is_err() {
                                break;
                            }
                        }
                        Job::Shutdown => break,
                    }
                }
            })
            .map_err(|e| StreamError::Spawn(self.name, e))?;

        self.jobs = Some(job_tx);
        self.drained = Some(done_rx);
        self.worker = Some(worker);
        self.state = State::Ready;
        Ok(())
    }

    /// Starts draining `stream`, which should belong to a process that was
    /// just spawned.
    pub fn give_stream_and_start_consuming<R>(&mut self, stream: R) -> Result<(), StreamError>
    where
        R: Read + Send + 'static,
    {
        match self.state {
            State::Ready => {}
            State::Idle => return Err(StreamError::NotStarted(self.name)),
            State::Consuming => return Err(StreamError::AlreadyConsuming(self.name)),
            State::ShutDown => return Err(StreamError::ShutDown(self.name)),
        }
        let jobs = self.jobs.as_ref().ok_or(StreamError::NotStarted(self.name))?;
        jobs.send(Job::Consume(Box::new(stream)))
            .map_err(|_| StreamError::WorkerGone(self.name))?;
        self.output.clear();
        self.state = State::Consuming;
        Ok(())
    }

    /// Blocks until the current stream reaches end-of-stream. Call only after
    /// the owning process has been waited on.
    pub fn process_finished(&mut self) -> Result<(), StreamError> {
        if self.state != State::Consuming {
            return Err(StreamError::NotConsuming(self.name));
        }
        let drained = self
            .drained
            .as_ref()
            .ok_or(StreamError::NotStarted(self.name))?;
        let received = drained.recv();
        self.state = State::Ready;
        self.output = received.map_err(|_| StreamError::WorkerGone(self.name))?;
        Ok(())
    }

    /// Hands over the lines collected for the last finished process and
    /// clears the buffer for the next one.
    pub fn get_output(&mut self) -> Vec<String> {
        mem::take(&mut self.output)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Ready | State::Consuming)
    }

    pub fn shutdown(&mut self) {
        if let Some(jobs) = self.jobs.take() {
            let _ = jobs.send(Job::Shutdown);
            drop(jobs);
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    log::error!("Stream consumer '{}' worker panicked", self.name);
                }
            }
        }
        self.drained = None;
        self.state = State::ShutDown;
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

fn drain_lines(name: &str, stream: Box<dyn Read + Send>) -> Vec<String> {
    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                lines.push(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("Error reading {name} stream, keeping {} lines: {e}", lines.len());
                break;
            }
        }
    }
    lines
}
