//! A single remote host and the worker that runs its requests.
//!
//! # One thread per node
//!
//! [Node::connect] starts a worker thread that owns the node's connection and a single-threaded
//! Tokio runtime. The worker takes [Request]s off the node's queue one at a time, in the order
//! they were submitted, and runs each to completion before starting the next. This keeps at most
//! one command in flight per host, keeps per-host output ordered, and lets every node make
//! progress independently of the others.
//!
//! Nodes are always handled through an [Arc], because every [Response] points back at the node
//! that produced it. The worker holds only a [Weak] reference, so a node that nobody else
//! references shuts its worker down on its own.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --> Listening --close--> Closed
//!      ^                        |
//!      +------- failure --------+
//! ```
//!
//! A failed [Node::connect] leaves the node disconnected, so it can be retried. While a node is
//! connecting, [Node::execute] fails right away rather than waiting for the dial. A closed node
//! never reopens.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::request::{Job, Request, Response, LOCAL_FAILURE};
use crate::transport::{Connection, Dial, RemoteProcess, Target};
use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use std::fmt;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// One remote host.
pub struct Node {
    target: Target,
    dialer: Arc<dyn Dial>,
    request_timeout: Option<Duration>,
    queue_capacity: Option<usize>,
    state: Mutex<State>,
}

enum State {
    Disconnected,
    /// A call to [Node::connect] is dialing. Requests are refused until it is done.
    Connecting,
    Listening {
        /// The sending half of the worker's queue. Dropping it tells the worker to finish up.
        requests: Sender<Request>,
        worker: JoinHandle<()>,
    },
    Closed,
}

impl Node {
    /// Creates a disconnected node that will reach `target` with the system's OpenSSH client.
    #[cfg(feature = "openssh")]
    pub fn new(target: Target, settings: &Settings) -> Arc<Self> {
        let dialer = Arc::new(crate::transport::openssh::OpenSsh::new(settings));
        Self::with_dialer(target, settings, dialer)
    }

    /// Creates a disconnected node that will reach `target` with `dialer`.
    pub fn with_dialer(target: Target, settings: &Settings, dialer: Arc<dyn Dial>) -> Arc<Self> {
        Arc::new(Node {
            target,
            dialer,
            request_timeout: settings.request_timeout(),
            queue_capacity: settings.queue_capacity,
            state: Mutex::new(State::Disconnected),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Whether the node is connected and accepting requests.
    pub fn is_listening(&self) -> bool {
        matches!(*self.lock_state(), State::Listening { .. })
    }

    /// Connects to the host and starts the node's worker.
    ///
    /// Blocks until the connection is established or has failed.
    ///
    /// # Errors
    ///
    /// - [Error::AlreadyListening] if the node is already connected.
    /// - [Error::AlreadyConnecting] if another call is still dialing.
    /// - [Error::Closed] if the node has been closed.
    /// - [Error::Connection] if the host could not be reached. The node stays disconnected.
    /// - [Error::Spawn] if the worker thread could not be started.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.lock_state();
            match *state {
                State::Disconnected => {}
                State::Connecting => {
                    return Err(Error::AlreadyConnecting { target: self.name() })
                }
                State::Listening { .. } => {
                    return Err(Error::AlreadyListening { target: self.name() })
                }
                State::Closed => return Err(Error::Closed { target: self.name() }),
            }
            // Dialing can take a while; the rest of the node stays usable meanwhile.
            *state = State::Connecting;
        }

        match self.dial() {
            Ok((requests, worker)) => {
                *self.lock_state() = State::Listening { requests, worker };
                info!(node = %self.target, "connected");
                Ok(())
            }
            Err(error) => {
                *self.lock_state() = State::Disconnected;
                Err(error)
            }
        }
    }

    /// Starts the worker and waits for it to connect. Called with the node in `Connecting`.
    fn dial(self: &Arc<Self>) -> Result<(Sender<Request>, JoinHandle<()>)> {
        let (requests, queue) = match self.queue_capacity {
            Some(capacity) => channel::bounded(capacity),
            None => channel::unbounded(),
        };
        let (ready_send, ready) = channel::bounded(1);
        let worker = Worker {
            node: Arc::downgrade(self),
            target: self.target.clone(),
            dialer: self.dialer.clone(),
            request_timeout: self.request_timeout,
            queue,
        };

        debug!(node = %self.target, "connecting");
        let handle = thread::Builder::new()
            .name(format!("muster-{}", self.target.host))
            .spawn(move || worker.run(ready_send))
            .map_err(|source| Error::Spawn {
                target: self.name(),
                source,
            })?;

        let failure = match ready.recv() {
            Ok(Ok(())) => return Ok((requests, handle)),
            Ok(Err(error)) => error,
            Err(_) => anyhow::anyhow!("the worker thread stopped before connecting"),
        };

        // The worker exits right after reporting a failure.
        if handle.join().is_err() {
            warn!(node = %self.target, "the worker thread panicked while connecting");
        }
        warn!(node = %self.target, error = %format!("{failure:#}"), "failed to connect");
        Err(Error::Connection {
            target: self.name(),
            source: failure.into(),
        })
    }

    /// Queues `request` to run on this node.
    ///
    /// Returns once the request is queued, not once it has run; the outcome goes to the
    /// request's responder. If the node was built with a bounded `queue_capacity`, this blocks
    /// while the queue is full.
    ///
    /// # Errors
    ///
    /// - [Error::NotConnected] if the node is not listening. The request is dropped.
    /// - [Error::Dispatch] if the node's worker has died. The request is dropped.
    pub fn execute(&self, request: Request) -> Result<()> {
        // Clone the sender so that a full queue doesn't block other callers on the state lock.
        let requests = match &*self.lock_state() {
            State::Listening { requests, .. } => requests.clone(),
            _ => return Err(Error::NotConnected { target: self.name() }),
        };

        debug!(node = %self.target, command = request.command(), "queuing request");
        requests.send(request).map_err(|_| Error::Dispatch {
            target: self.name(),
            reason: "the node's worker has stopped".to_string(),
        })
    }

    /// Stops accepting requests, waits for queued requests to finish, and disconnects.
    ///
    /// # Errors
    ///
    /// [Error::NotListening] if the node was never connected or is already closed.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock_state();
        let (requests, worker) = match std::mem::replace(&mut *state, State::Closed) {
            State::Listening { requests, worker } => (requests, worker),
            previous => {
                *state = previous;
                return Err(Error::NotListening { target: self.name() });
            }
        };
        drop(state);
        drop(requests);

        if worker.thread().id() == thread::current().id() {
            // Called from a responder running on the worker itself. It will finish on its own.
            debug!(node = %self.target, "closing from the worker thread");
        } else if worker.join().is_err() {
            warn!(node = %self.target, "the worker thread panicked");
        }
        info!(node = %self.target, "closed");
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> String {
        self.target.to_string()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.lock_state() {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Listening { .. } => "listening",
            State::Closed => "closed",
        };
        f.debug_struct("Node")
            .field("target", &self.target)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// Everything a node's worker thread needs, moved into the thread.
struct Worker {
    node: Weak<Node>,
    target: Target,
    dialer: Arc<dyn Dial>,
    request_timeout: Option<Duration>,
    queue: Receiver<Request>,
}

impl Worker {
    /// Connects, reports the outcome on `ready`, then serves the queue until every sender is gone.
    fn run(self, ready: Sender<anyhow::Result<()>>) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start the async runtime");
        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(error) => {
                let _ = ready.send(Err(error));
                return;
            }
        };

        let connection = match runtime.block_on(self.dialer.dial(&self.target)) {
            Ok(connection) => connection,
            Err(error) => {
                let _ = ready.send(Err(error));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        drop(ready);

        while let Ok(request) = self.queue.recv() {
            let (job, responder) = request.into_parts();
            debug!(node = %self.target, command = %job.command, "running request");
            let outcome = runtime.block_on(self.run_remote(&*connection, job));

            let Some(node) = self.node.upgrade() else {
                debug!(node = %self.target, "the node is gone; dropping the response");
                continue;
            };
            let response = match outcome {
                Ok(Output {
                    exit: Ok(exit_code),
                    stdout,
                    stderr,
                }) => Response::new(node, exit_code, stdout, stderr),
                Ok(Output {
                    exit: Err(error),
                    stdout,
                    mut stderr,
                }) => {
                    warn!(node = %self.target, error = %format!("{error:#}"), "request failed");
                    stderr.extend_from_slice(format!("{error:#}\n").as_bytes());
                    Response::new(node, LOCAL_FAILURE, stdout, stderr)
                }
                Err(error) => {
                    warn!(node = %self.target, error = %format!("{error:#}"), "request failed");
                    Response::failure(node, format!("{error:#}"))
                }
            };
            responder.deliver(response);
        }

        if let Err(error) = runtime.block_on(connection.close()) {
            warn!(node = %self.target, error = %format!("{error:#}"), "failed to disconnect cleanly");
        }
        debug!(node = %self.target, "worker finished");
    }

    /// Runs `job`'s command, feeds it the job's stdin, and collects its output and exit status.
    ///
    /// Gives up once the job's deadline, or else the node's request timeout, has passed. The
    /// command's pipes and process handle are dropped before this returns, so a command that is
    /// given up on sees end-of-input and is detached before the next one starts. Whatever output
    /// arrived in time is kept.
    ///
    /// Fails outright only if the command could not be started.
    async fn run_remote(&self, connection: &dyn Connection, job: Job) -> anyhow::Result<Output> {
        let RemoteProcess {
            stdin: mut input,
            mut stdout,
            mut stderr,
            exit,
        } = connection.spawn(&job.command).await?;

        // Feed stdin on its own task. A command that never reads its input must not stall the rest.
        let stdin = job.stdin;
        let feeder = Feeder(tokio::spawn(async move {
            input.write_all(&stdin).await?;
            input.shutdown().await
        }));

        let mut out = vec![];
        let mut err = vec![];
        let collect = async {
            let (out_read, err_read, status) = tokio::join!(
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err),
                exit,
            );
            match (out_read, err_read) {
                (Err(error), _) | (_, Err(error)) => {
                    Err(anyhow::Error::new(error).context("failed to read the command's output"))
                }
                _ => status,
            }
        };
        let status = match job.deadline.or(self.request_timeout) {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(status) => status,
                Err(_) => Err(Error::TimedOut {
                    target: self.target.to_string(),
                    after: limit,
                }
                .into()),
            },
            None => collect.await,
        };

        drop(stdout);
        drop(stderr);
        feeder.finish(&job.command).await;
        Ok(Output {
            exit: status,
            stdout: out,
            stderr: err,
        })
    }
}

/// The task writing a remote command's stdin. Aborted if dropped before it is done.
struct Feeder(tokio::task::JoinHandle<std::io::Result<()>>);

impl Feeder {
    /// Stops writing if the command is done without reading everything, then waits until the
    /// task has let go of the pipe.
    async fn finish(mut self, command: &str) {
        if !self.0.is_finished() {
            debug!(command, "the command finished without reading all of its input");
            self.0.abort();
        }
        match (&mut self.0).await {
            // The remote side may close its input early; that is the command's business.
            Ok(Err(error)) if error.kind() == ErrorKind::BrokenPipe => {
                debug!(command, "the command closed its input early");
            }
            Ok(Err(error)) => debug!(command, %error, "failed to write the command's input"),
            Ok(Ok(())) | Err(_) => {}
        }
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What came back from a remote command.
///
/// `exit` is an error if the command's exit status could not be observed. Whatever output
/// arrived before that is kept.
struct Output {
    exit: anyhow::Result<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}
