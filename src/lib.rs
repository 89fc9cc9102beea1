//! Runs shell commands and copies files across many remote hosts at once.
//!
//! Muster keeps one connection per host and streams each host's results back as soon as they are
//! ready. There are three layers:
//!
//! - [Node]: one host. It owns its connection and runs the [Request]s queued on it one at a time,
//!   in order, answering each with a [Response].
//! - [NodeList]: many hosts. It fans a request out to every node in the list and merges their
//!   responses into a single [Responses] stream that ends once every node has answered.
//! - [copy]: turns file contents into requests that recreate the file on each host.
//!
//! ```no_run
//! use muster::{Node, NodeList, Settings, Target};
//!
//! # fn main() -> muster::Result<()> {
//! let settings = Settings::default();
//! let nodes: NodeList = ["web1", "web2", "db1"]
//!     .into_iter()
//!     .map(|host| Node::new(Target::new(host).user("deploy"), &settings))
//!     .collect();
//!
//! nodes.connect()?;
//! for response in nodes.run("uptime") {
//!     println!(
//!         "{}: {}",
//!         response.node().target(),
//!         String::from_utf8_lossy(response.stdout()),
//!     );
//! }
//! nodes.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Failures
//!
//! Lifecycle misuse and connection failures are [Error]s, returned right away. Anything that goes
//! wrong while a request is in flight is reported in that request's [Response] instead: a remote
//! command that fails keeps its exit code, and a request that failed on the controller side
//! carries [LOCAL_FAILURE] and an explanation in its standard error.
//!
//! # Logging
//!
//! Muster logs through [tracing] and never installs a subscriber of its own.

pub mod config;
pub mod copy;
pub mod error;
pub mod node;
pub mod node_list;
pub mod request;
pub mod transport;

#[doc(inline)]
pub use config::Settings;
#[doc(inline)]
pub use copy::Encoding;
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use node::Node;
#[doc(inline)]
pub use node_list::{NodeList, Responder, Responses};
#[doc(inline)]
pub use request::{Request, Respond, Response, LOCAL_FAILURE};
#[doc(inline)]
pub use transport::{Connection, Credential, Dial, RemoteProcess, Target};
