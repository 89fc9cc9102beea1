//! Fans requests out to many [Node]s and merges their responses into one stream.
//!
//! Every fan-out is a *round*: [NodeList::each] hands each node a [Responder] and returns a
//! [Responses] stream that ends once every node in the list has been accounted for exactly once.
//! A node is accounted for when its responder delivers a [Response], or, if that can no longer
//! happen, when the round delivers a failure response on the node's behalf:
//!
//! - the build function returned an error, e.g. because the node is not connected;
//! - the build function returned `Ok` without handing the responder to anything;
//! - the responder was dropped before delivering, e.g. because the node's worker died.
//!
//! Failure responses carry [LOCAL_FAILURE] as their exit code and the reason in their standard
//! error, so a round always ends, whatever happens to its nodes.
//!
//! Responses from different nodes arrive in whatever order the nodes finish. Responses from the
//! same node arrive in the order its requests were queued.
//!
//! [LOCAL_FAILURE]: crate::LOCAL_FAILURE

use crate::copy::{self, Encoding};
use crate::error::Result;
use crate::node::Node;
use crate::request::{Request, Respond, Response};
use crossbeam::channel::{self, Receiver, Sender};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

const DROPPED: &str = "the request was dropped before it produced a response";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An ordered list of shared [Node]s.
///
/// A list does not own its nodes in any exclusive sense: the same node can appear in many lists,
/// and the selection methods return new lists that share the same nodes.
#[derive(Clone, Default)]
pub struct NodeList {
    nodes: Vec<Arc<Node>>,
}

impl NodeList {
    pub fn new(nodes: impl IntoIterator<Item = Arc<Node>>) -> Self {
        NodeList {
            nodes: nodes.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Node>> {
        self.nodes.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Node>> {
        self.nodes.iter()
    }

    /// The first `n` nodes, or all of them if there are fewer.
    pub fn take(&self, n: usize) -> NodeList {
        self.iter().take(n).cloned().collect()
    }

    /// Everything but the first `n` nodes.
    pub fn skip(&self, n: usize) -> NodeList {
        self.iter().skip(n).cloned().collect()
    }

    /// The nodes for which `predicate` returns `true`, in order.
    pub fn filter(&self, mut predicate: impl FnMut(&Arc<Node>) -> bool) -> NodeList {
        self.iter().filter(|node| predicate(node)).cloned().collect()
    }

    /// Connects every node in order, stopping at the first failure.
    pub fn connect(&self) -> Result<()> {
        self.iter().try_for_each(|node| node.connect())
    }

    /// Closes every node in order, stopping at the first failure.
    pub fn close(&self) -> Result<()> {
        self.iter().try_for_each(|node| node.close())
    }

    /// Starts a round: calls `build` once per node, in order, with a [Responder] for that node.
    ///
    /// `build` is expected to put the responder in a [Request] and queue it on the node, e.g. with
    /// [Request::respond_to] and [Node::execute]. Returns as soon as every node has been handed
    /// its request. The returned stream yields exactly one [Response] per node and then ends.
    pub fn each<F>(&self, mut build: F) -> Responses
    where
        F: FnMut(&Arc<Node>, Responder) -> Result<()>,
    {
        let (outbox, receiver) = channel::unbounded();
        // With no nodes, the round is over before it starts.
        let outbox = (!self.is_empty()).then_some(outbox);
        let round = Arc::new(Round {
            remaining: AtomicUsize::new(self.len()),
            outbox: Mutex::new(outbox),
        });
        debug!(nodes = self.len(), "starting a round");

        for node in self.iter() {
            let slot = Arc::new(Mutex::new(Slot::Building));
            let responder = Responder {
                node: node.clone(),
                round: round.clone(),
                slot: slot.clone(),
            };

            let outcome = build(node, responder);

            let mut state = lock(&slot);
            let failure = match (outcome, *state) {
                (_, Slot::Accounted) => None,
                (Ok(()), Slot::Building) => {
                    *state = Slot::Dispatched;
                    None
                }
                (Ok(()), _) => Some(DROPPED.to_string()),
                (Err(error), _) => {
                    warn!(node = %node.target(), %error, "failed to dispatch a request");
                    Some(format!("failed to dispatch: {error}"))
                }
            };
            if let Some(reason) = failure {
                *state = Slot::Accounted;
                drop(state);
                round.push(Response::failure(node.clone(), reason));
            }
        }

        Responses { receiver }
    }

    /// Sends a copy of `request` to every node.
    ///
    /// The copies share `request`'s standard input; its responder is not used.
    pub fn execute(&self, request: Request) -> Responses {
        self.each(|node, responder| node.execute(request.reply_to(responder)))
    }

    /// Runs `command` on every node with empty standard input.
    pub fn run(&self, command: &str) -> Responses {
        self.execute(Request::new(command))
    }

    /// Copies the local file `src` to `dest` on every node through an `scp` receiver.
    ///
    /// # Errors
    ///
    /// [Error::Io] if `src` cannot be read, in which case nothing is sent to any node. See
    /// [Encoding::request] for the rest.
    ///
    /// [Error::Io]: crate::Error::Io
    pub fn copy(&self, src: impl AsRef<Path>, dest: &str) -> Result<Responses> {
        self.copy_with(src, dest, Encoding::default())
    }

    /// Like [Self::copy], with a choice of receiver.
    pub fn copy_with(
        &self,
        src: impl AsRef<Path>,
        dest: &str,
        encoding: Encoding,
    ) -> Result<Responses> {
        let request = copy::copy_request(src, dest, encoding)?;
        Ok(self.execute(request))
    }

    /// Writes `content` to `dest` on every node through an `scp` receiver.
    pub fn write(&self, dest: &str, content: &[u8]) -> Result<Responses> {
        self.write_with(dest, content, Encoding::default())
    }

    /// Like [Self::write], with a choice of receiver.
    pub fn write_with(&self, dest: &str, content: &[u8], encoding: Encoding) -> Result<Responses> {
        let request = copy::write_request(dest, content, encoding)?;
        Ok(self.execute(request))
    }
}

impl fmt::Debug for NodeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|node| node.target().to_string()))
            .finish()
    }
}

impl From<Vec<Arc<Node>>> for NodeList {
    fn from(nodes: Vec<Arc<Node>>) -> Self {
        NodeList { nodes }
    }
}

impl FromIterator<Arc<Node>> for NodeList {
    fn from_iter<I: IntoIterator<Item = Arc<Node>>>(iter: I) -> Self {
        NodeList::new(iter)
    }
}

impl<'a> IntoIterator for &'a NodeList {
    type Item = &'a Arc<Node>;
    type IntoIter = std::slice::Iter<'a, Arc<Node>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for NodeList {
    type Item = Arc<Node>;
    type IntoIter = std::vec::IntoIter<Arc<Node>>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

/// The responses of one round, in the order they arrive.
///
/// Iterating blocks until the next response arrives, and ends once every node in the round has
/// been accounted for.
#[derive(Debug)]
pub struct Responses {
    receiver: Receiver<Response>,
}

impl Iterator for Responses {
    type Item = Response;

    fn next(&mut self) -> Option<Response> {
        self.receiver.recv().ok()
    }
}

/// What is shared by every [Responder] of a round.
struct Round {
    /// Nodes not yet accounted for.
    remaining: AtomicUsize,

    /// Taken, which ends the stream, when the last node is accounted for.
    outbox: Mutex<Option<Sender<Response>>>,
}

impl Round {
    /// Delivers `response` and accounts for its node. Call exactly once per node.
    fn push(&self, response: Response) {
        if let Some(outbox) = lock(&self.outbox).as_ref() {
            // The consumer may have stopped listening; the round still has to finish.
            let _ = outbox.send(response);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            lock(&self.outbox).take();
            debug!("round complete");
        }
    }
}

/// Where one node's part of a round stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    /// The build function has the responder.
    Building,

    /// The build function handed the responder off.
    Dispatched,

    /// The responder was dropped before the build function returned.
    Abandoned,

    /// The node has been accounted for.
    Accounted,
}

/// Delivers one node's [Response] into a round. Handed out by [NodeList::each].
///
/// Dropping a responder that has not delivered accounts for its node with a failure response.
pub struct Responder {
    node: Arc<Node>,
    round: Arc<Round>,
    slot: Arc<Mutex<Slot>>,
}

impl Responder {
    /// The node this responder answers for.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Respond for Responder {
    fn deliver(self: Box<Self>, response: Response) {
        let claimed = {
            let mut slot = lock(&self.slot);
            let claimed = *slot != Slot::Accounted;
            *slot = Slot::Accounted;
            claimed
        };
        if claimed {
            self.round.push(response);
        } else {
            debug!(node = %self.node.target(), "discarding a response for a finished round");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        match *slot {
            Slot::Building => *slot = Slot::Abandoned,
            Slot::Dispatched => {
                *slot = Slot::Accounted;
                drop(slot);
                debug!(node = %self.node.target(), "request dropped before responding");
                self.round.push(Response::failure(self.node.clone(), DROPPED));
            }
            Slot::Abandoned | Slot::Accounted => {}
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("node", &self.node.target().to_string())
            .field("slot", &*lock(&self.slot))
            .finish()
    }
}

#[cfg(test)]
mod test;
