//! The unit of work a [Node] runs and the outcome it reports.

use crate::node::Node;
use bytes::Bytes;
use crossbeam::channel::Sender;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The exit code of a [Response] that never reached the remote host, or whose remote process
/// could not be observed to finish.
///
/// Remote exit codes are always in `0..=255`, so this value never collides with one.
pub const LOCAL_FAILURE: i32 = -1;

/// Receives the [Response] to a [Request].
///
/// [Respond::deliver] consumes the responder, so each one hands over at most one [Response].
pub trait Respond: Send {
    fn deliver(self: Box<Self>, response: Response);
}

/// Sends the [Response] down a channel. Delivery is skipped if the receiver is gone.
impl Respond for Sender<Response> {
    fn deliver(self: Box<Self>, response: Response) {
        // A closed channel means nobody is waiting for this response any more.
        let _ = self.send(response);
    }
}

/// A responder that throws the [Response] away.
#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl Respond for Discard {
    fn deliver(self: Box<Self>, _response: Response) {}
}

/// A command to run on a single [Node], the bytes to feed its standard input, and the
/// [Respond]er that receives the outcome.
pub struct Request {
    pub(crate) command: String,
    pub(crate) stdin: Bytes,
    pub(crate) deadline: Option<Duration>,
    pub(crate) responder: Box<dyn Respond>,
}

impl Request {
    /// Creates a request with empty standard input whose response is discarded.
    ///
    /// Use [Self::respond_to] to collect the response.
    pub fn new(command: impl Into<String>) -> Self {
        Request {
            command: command.into(),
            stdin: Bytes::new(),
            deadline: None,
            responder: Box::new(Discard),
        }
    }

    /// Feeds `stdin` to the remote command. The pipe is closed once every byte is written.
    pub fn with_stdin(mut self, stdin: impl Into<Bytes>) -> Self {
        self.stdin = stdin.into();
        self
    }

    /// Fails the request if it has not finished within `deadline` of starting to run.
    ///
    /// Overrides the node's `request_timeout_secs` setting.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sends the response to `responder` instead of the current one.
    pub fn respond_to(mut self, responder: impl Respond + 'static) -> Self {
        self.responder = Box::new(responder);
        self
    }

    /// Returns a copy of this request that answers to `responder`.
    ///
    /// The standard input bytes are shared, not copied.
    pub fn reply_to(&self, responder: impl Respond + 'static) -> Self {
        Request {
            command: self.command.clone(),
            stdin: self.stdin.clone(),
            deadline: self.deadline,
            responder: Box::new(responder),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdin(&self) -> &Bytes {
        &self.stdin
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Splits the request into the part that runs and the part that answers.
    pub(crate) fn into_parts(self) -> (Job, Box<dyn Respond>) {
        let job = Job {
            command: self.command,
            stdin: self.stdin,
            deadline: self.deadline,
        };
        (job, self.responder)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("stdin", &self.stdin.len())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// What a node's worker needs to run a [Request].
#[derive(Clone, Debug)]
pub(crate) struct Job {
    pub command: String,
    pub stdin: Bytes,
    pub deadline: Option<Duration>,
}

/// The outcome of one [Request] on one [Node].
///
/// A response is immutable once delivered.
#[derive(Clone)]
pub struct Response {
    node: Arc<Node>,
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Response {
    pub(crate) fn new(node: Arc<Node>, exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Response {
            node,
            exit_code,
            stdout,
            stderr,
        }
    }

    /// A response for a request that failed on the controller side, e.g. because it could not
    /// be dispatched. `reason` becomes the response's standard error.
    pub(crate) fn failure(node: Arc<Node>, reason: impl fmt::Display) -> Self {
        let stderr = format!("{reason}\n").into_bytes();
        Response::new(node, LOCAL_FAILURE, vec![], stderr)
    }

    /// The node that produced this response.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// The remote exit status, or [LOCAL_FAILURE].
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Whether the remote command ran and exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the request failed on the controller rather than on the remote host.
    pub fn is_local_failure(&self) -> bool {
        self.exit_code == LOCAL_FAILURE
    }

    /// Consumes the response and returns its standard output and standard error.
    pub fn into_output(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("node", &self.node.target().to_string())
            .field("exit_code", &self.exit_code)
            .field("stdout", &String::from_utf8_lossy(&self.stdout))
            .field("stderr", &String::from_utf8_lossy(&self.stderr))
            .finish()
    }
}

#[cfg(test)]
mod test;
