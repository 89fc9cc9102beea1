//! Contains the default transport, based on the [openssh] crate.
//!
//! Each [Node] gets one multiplexed master connection to its host, and every request opens a new
//! channel over it. Authentication is left entirely to the local OpenSSH client, which means
//! password prompts are not supported; use keys or an agent.
//!
//! A request that runs out of time has its channel's pipes closed and its child handle dropped.
//! SSH has no dependable way to signal a remote process, so a command that ignores end-of-input
//! and broken pipes can outlive its request on the remote host.
//!
//! [Node]: crate::Node

use super::{Connection, Credential, Dial, RemoteProcess, Target};
use crate::config::{KnownHostsPolicy, Settings};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tracing::debug;

/// Dials hosts with the system's OpenSSH client.
#[derive(Clone, Debug, Default)]
pub struct OpenSsh {
    known_hosts: KnownHostsPolicy,
    connect_timeout: Option<Duration>,
    control_directory: Option<PathBuf>,
}

impl OpenSsh {
    pub fn new(settings: &Settings) -> Self {
        OpenSsh {
            known_hosts: settings.known_hosts,
            connect_timeout: settings.connect_timeout(),
            control_directory: settings.control_directory.clone(),
        }
    }

    /// Prepares a [SessionBuilder] for one connection attempt with one key file (or none).
    fn builder(&self, target: &Target, keyfile: Option<&Path>) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(known_hosts(self.known_hosts));
        builder.port(target.port);
        if let Some(user) = &target.user {
            builder.user(user.clone());
        }
        if let Some(timeout) = self.connect_timeout {
            builder.connect_timeout(timeout);
        }
        if let Some(dir) = &self.control_directory {
            builder.control_directory(dir);
        }
        if let Some(keyfile) = keyfile {
            builder.keyfile(keyfile);
        }
        builder
    }
}

#[async_trait]
impl Dial for OpenSsh {
    async fn dial(&self, target: &Target) -> anyhow::Result<Box<dyn Connection>> {
        // With no credentials, make one attempt and let ssh work out authentication on its own.
        let keyfiles: Vec<Option<&Path>> = if target.credentials.is_empty() {
            vec![None]
        } else {
            target
                .credentials
                .iter()
                .map(|credential| match credential {
                    Credential::Identity(path) => Some(path.as_path()),
                    Credential::Agent => None,
                })
                .collect()
        };

        let mut last_error = None;
        for keyfile in keyfiles {
            match self.builder(target, keyfile).connect_mux(&target.host).await {
                Ok(session) => return Ok(Box::new(OpenSshConnection { session })),
                Err(error) => {
                    debug!(host = %target, ?keyfile, %error, "connection attempt failed");
                    last_error = Some(error);
                }
            }
        }

        // The loop runs at least once, so there is always an error here.
        match last_error {
            Some(error) => {
                Err(anyhow::Error::new(error).context(format!("could not connect to {target}")))
            }
            None => bail!("no connection attempt was made to {target}"),
        }
    }
}

/// A live OpenSSH master connection.
#[derive(Debug)]
struct OpenSshConnection {
    session: Session,
}

#[async_trait]
impl Connection for OpenSshConnection {
    async fn spawn<'a>(&'a self, command: &str) -> anyhow::Result<RemoteProcess<'a>> {
        let mut remote = self.session.shell(command);
        remote
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = remote
            .spawn()
            .await
            .context("failed to open a session")?;

        let stdin = child
            .stdin()
            .take()
            .ok_or_else(|| anyhow!("the session has no stdin pipe"))?;
        let stdout = child
            .stdout()
            .take()
            .ok_or_else(|| anyhow!("the session has no stdout pipe"))?;
        let stderr = child
            .stderr()
            .take()
            .ok_or_else(|| anyhow!("the session has no stderr pipe"))?;

        Ok(RemoteProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit: Box::pin(async move { exit_code(child.wait().await?) }),
        })
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(self.session.close().await?)
    }
}

fn known_hosts(policy: KnownHostsPolicy) -> KnownHosts {
    match policy {
        KnownHostsPolicy::Strict => KnownHosts::Strict,
        KnownHostsPolicy::Add => KnownHosts::Add,
        KnownHostsPolicy::Accept => KnownHosts::Accept,
    }
}

/// Converts a remote [ExitStatus] to a plain exit code, the way a shell reports it.
fn exit_code(status: ExitStatus) -> anyhow::Result<i32> {
    match (status.code(), status.signal()) {
        (Some(code), _) => Ok(code),
        (None, Some(signal)) => Ok(128 + signal),
        (None, None) => bail!("remote process finished without an exit status: {status:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_passes_codes_through() {
        // Wait statuses keep the exit code in the second byte.
        assert_eq!(0, exit_code(ExitStatus::from_raw(0)).unwrap());
        assert_eq!(3, exit_code(ExitStatus::from_raw(3 << 8)).unwrap());
        assert_eq!(255, exit_code(ExitStatus::from_raw(255 << 8)).unwrap());
    }

    #[test]
    fn exit_code_maps_signals() {
        // SIGKILL
        assert_eq!(137, exit_code(ExitStatus::from_raw(9)).unwrap());
    }

    #[test]
    fn known_hosts_maps_every_policy() {
        assert!(matches!(known_hosts(KnownHostsPolicy::Strict), KnownHosts::Strict));
        assert!(matches!(known_hosts(KnownHostsPolicy::Add), KnownHosts::Add));
        assert!(matches!(known_hosts(KnownHostsPolicy::Accept), KnownHosts::Accept));
    }

    #[test]
    fn new_copies_settings() {
        let settings = Settings {
            known_hosts: KnownHostsPolicy::Strict,
            connect_timeout_secs: Some(7),
            control_directory: Some("/run/muster".into()),
            ..Settings::default()
        };
        let dialer = OpenSsh::new(&settings);
        assert_eq!(KnownHostsPolicy::Strict, dialer.known_hosts);
        assert_eq!(Some(Duration::from_secs(7)), dialer.connect_timeout);
        assert_eq!(Some(PathBuf::from("/run/muster")), dialer.control_directory);
    }
}
