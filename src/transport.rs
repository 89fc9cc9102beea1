//! The boundary between Muster and the remote-shell transport that carries its commands.
//!
//! Muster does not speak SSH itself. A [Dial] implementation opens one [Connection] per [Node],
//! and each [Request] runs as one [RemoteProcess] over that connection. Connections are expensive
//! and live as long as the node is listening; processes are cheap and live for one request.
//!
//! The default implementation, [openssh::OpenSsh], drives the system's OpenSSH client. Anything
//! else that can run a command line and hand back its pipes and exit status can stand in for it.
//!
//! # Exit status
//!
//! [RemoteProcess::exit] resolves to `Ok(status)` whenever the remote command ran to completion,
//! including when `status` is non-zero. An `Err` means the transport itself failed, e.g. the
//! connection dropped, and is reported as a local failure rather than as a remote exit code.
//!
//! [Node]: crate::Node
//! [Request]: crate::Request

use crate::error::Error;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(feature = "openssh")]
pub mod openssh;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod fake;

/// The default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Opens connections to remote hosts.
#[async_trait]
pub trait Dial: Send + Sync {
    /// Connects and authenticates to `target`.
    async fn dial(&self, target: &Target) -> anyhow::Result<Box<dyn Connection>>;
}

/// An established, authenticated connection to one host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Starts `command` on the remote host in a fresh session and returns its pipes.
    ///
    /// The command line is interpreted by the remote user's shell.
    async fn spawn<'a>(&'a self, command: &str) -> anyhow::Result<RemoteProcess<'a>>;

    /// Shuts the connection down.
    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// Resolves to the remote exit status once the remote command has finished.
pub type ExitFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<i32>> + Send + 'a>>;

/// A command running on a remote host.
///
/// The caller must keep reading [Self::stdout] and [Self::stderr] while waiting on [Self::exit],
/// or a chatty command can fill its pipes and stall.
pub struct RemoteProcess<'a> {
    /// Closing (shutting down) this pipe signals end-of-input to the remote command.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: ExitFuture<'a>,
}

impl fmt::Debug for RemoteProcess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcess").finish_non_exhaustive()
    }
}

/// A way to authenticate with a remote host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// A private key file.
    Identity(PathBuf),

    /// Whatever ssh would use on its own: the agent, the user's ssh config, default keys.
    Agent,
}

impl Credential {
    /// Builds a [Credential::Identity], expanding a leading `~/` to the user's home directory.
    pub fn identity(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let expanded = match (path.strip_prefix("~"), home::home_dir()) {
            (Ok(rest), Some(mut home)) => {
                home.push(rest);
                home
            }
            _ => path.to_owned(),
        };
        Credential::Identity(expanded)
    }
}

/// Where a [Node] connects and how it authenticates.
///
/// [Node]: crate::Node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,

    /// The remote user. `None` leaves the choice to the transport, e.g. ssh config.
    pub user: Option<String>,

    /// Tried in order until one succeeds. Empty means "try the transport's defaults once".
    pub credentials: Vec<Credential>,
}

impl Target {
    /// A target on the default port with no explicit user or credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Target {
            host: host.into(),
            port: DEFAULT_PORT,
            user: None,
            credentials: vec![],
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Appends a credential to try after any already present.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credentials.push(credential);
        self
    }
}

/// Formats as `user@host:port`, omitting the user if there is none. IPv6 addresses are
/// bracketed.
impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `[user@]host[:port]`.
///
/// An IPv6 address needs brackets to carry a port, as in `[::1]:2222`. Without a port, the
/// brackets are optional.
///
/// ```
/// use muster::Target;
///
/// let target: Target = "deploy@db1:2222".parse().unwrap();
/// assert_eq!(Target::new("db1").user("deploy").port(2222), target);
///
/// let target: Target = "[fe80::1]:2222".parse().unwrap();
/// assert_eq!(Target::new("fe80::1").port(2222), target);
/// ```
impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| Error::InvalidTarget(format!("{s:?}: {reason}"));

        let (user, address) = match s.rsplit_once('@') {
            Some((user, _)) if user.contains(':') => {
                return Err(invalid("passwords are not supported; use a key or an agent"));
            }
            Some(("", _)) => return Err(invalid("empty user name")),
            Some((user, address)) => (Some(user), address),
            None => (None, s),
        };
        let parse_port = |port: &str| -> Result<u16, Error> {
            port.parse().map_err(|_| invalid("bad port"))
        };
        let (host, port) = if let Some(bracketed) = address.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '['"))?;
            match rest {
                "" => (host, DEFAULT_PORT),
                _ => match rest.strip_prefix(':') {
                    Some(port) => (host, parse_port(port)?),
                    None => return Err(invalid("junk after ']'")),
                },
            }
        } else if address.matches(':').count() > 1 {
            // A bare IPv6 address.
            (address, DEFAULT_PORT)
        } else {
            match address.split_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (address, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid("empty host name"));
        }

        let mut target = Target::new(host).port(port);
        target.user = user.map(str::to_owned);
        Ok(target)
    }
}
