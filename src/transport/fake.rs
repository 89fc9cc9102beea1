//! Scripted, in-memory hosts for exercising [Node]s and [NodeList]s without a network.
//!
//! A [FakeNetwork] hands out [FakeHost]s by name. Each fake host keeps a tiny file system and a
//! record of every command it ran, and understands just enough shell to answer the commands
//! Muster's tests send it:
//!
//! | Command | Behavior |
//! |---|---|
//! | `echo <words>` | prints the words and a newline |
//! | `exit <n>` | exits with status `n` |
//! | `cat` or `cat -` | copies stdin to stdout |
//! | `cat <path>` | prints a stored file, or fails with status 1 |
//! | `sleep <secs>` | waits, then exits 0 |
//! | `hang` | never finishes |
//! | `fail` | drops the connection mid-command (a transport error) |
//! | `panic` | panics, taking the node's worker down with it |
//! | the pipe receiver | stores stdin, minus its header line, at the destination |
//! | `scp -qrt <dir>` | a strict scp sink storing one file under `dir` |
//!
//! Anything else prints `command not found` and exits with status 127.
//!
//! Only built for Muster's own tests, or with the `test-util` feature, which the integration
//! tests turn on. It is not part of the API.
//!
//! [Node]: crate::Node
//! [NodeList]: crate::NodeList

use super::{Connection, Dial, RemoteProcess, Target};
use crate::copy::PIPE_RECEIVER;
use anyhow::bail;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

/// How many bytes each fake pipe buffers before writes wait for the reader.
const PIPE_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A set of [FakeHost]s, addressed by host name. Implements [Dial].
#[derive(Clone, Debug, Default)]
pub struct FakeNetwork {
    hosts: Arc<Mutex<HashMap<String, Arc<FakeHost>>>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the host called `name`, creating it if it doesn't exist yet.
    pub fn host(&self, name: &str) -> Arc<FakeHost> {
        lock(&self.hosts)
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(FakeHost::default()))
            .clone()
    }
}

#[async_trait]
impl Dial for FakeNetwork {
    async fn dial(&self, target: &Target) -> anyhow::Result<Box<dyn Connection>> {
        let host = self.host(&target.host);
        lock(&host.dials).push(target.clone());
        if host.unreachable.load(Ordering::SeqCst) {
            bail!("{}: connection refused", target.host);
        }
        host.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection { host }))
    }
}

/// One scripted host.
#[derive(Debug, Default)]
pub struct FakeHost {
    /// Stored files by path, with any leading `./` removed.
    files: Mutex<HashMap<String, Vec<u8>>>,

    /// File modes set by the scp sink.
    modes: Mutex<HashMap<String, u32>>,

    /// Every command line spawned on this host, in order.
    commands: Mutex<Vec<String>>,

    /// Every target used to dial this host, in order.
    dials: Mutex<Vec<Target>>,

    /// Added before every command runs.
    latency: Mutex<Duration>,

    unreachable: AtomicBool,
    failing_sessions: AtomicBool,

    /// Commands in progress right now, and the most ever in progress at once.
    active: AtomicUsize,
    peak: AtomicUsize,

    connections: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeHost {
    /// Refuses (or stops refusing) connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Refuses (or stops refusing) to open sessions on established connections.
    pub fn fail_sessions(&self, fail: bool) {
        self.failing_sessions.store(fail, Ordering::SeqCst);
    }

    /// Delays every command by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn put_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        lock(&self.files).insert(normalize(path), contents.into());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(&normalize(path)).cloned()
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        lock(&self.modes).get(&normalize(path)).copied()
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn dials(&self) -> Vec<Target> {
        lock(&self.dials).clone()
    }

    /// The most commands this host ever ran at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// How many connections were established.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// How many connections were closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Runs one command line against this host's pipes and returns its exit status.
    async fn run(
        &self,
        command: &str,
        mut stdin: DuplexStream,
        mut stdout: DuplexStream,
        mut stderr: DuplexStream,
    ) -> anyhow::Result<i32> {
        if let Some(dest) = command.strip_prefix(PIPE_RECEIVER) {
            let dest = unquote(dest)?;
            let mut input = vec![];
            stdin.read_to_end(&mut input).await?;
            // The receiver discards everything up to and including the first newline.
            let body = match input.iter().position(|&b| b == b'\n') {
                Some(newline) => input.split_off(newline + 1),
                None => vec![],
            };
            self.put_file(&dest, body);
            return Ok(0);
        }

        let words = match shlex::split(command) {
            Some(words) => words,
            None => {
                stderr.write_all(b"syntax error\n").await?;
                return Ok(2);
            }
        };
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["cat"] | ["cat", "-"] => {
                let mut input = vec![];
                stdin.read_to_end(&mut input).await?;
                stdout.write_all(&input).await?;
                Ok(0)
            }
            ["scp", "-qrt", dir] => {
                let mut input = vec![];
                stdin.read_to_end(&mut input).await?;
                self.scp_sink(dir, &input, &mut stdout, &mut stderr).await
            }
            words => {
                drop(stdin);
                self.run_without_stdin(words, &mut stdout, &mut stderr)
                    .await
            }
        }
    }

    async fn run_without_stdin(
        &self,
        words: &[&str],
        stdout: &mut DuplexStream,
        stderr: &mut DuplexStream,
    ) -> anyhow::Result<i32> {
        match words {
            ["echo", rest @ ..] => {
                stdout.write_all(format!("{}\n", rest.join(" ")).as_bytes()).await?;
                Ok(0)
            }
            ["exit", code] => Ok(code.parse().unwrap_or(2)),
            ["cat", path] => match self.file(path) {
                Some(contents) => {
                    stdout.write_all(&contents).await?;
                    Ok(0)
                }
                None => {
                    let message = format!("cat: {path}: No such file or directory\n");
                    stderr.write_all(message.as_bytes()).await?;
                    Ok(1)
                }
            },
            ["sleep", secs] => {
                let secs: f64 = secs.parse().unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(0)
            }
            ["hang"] => Ok(std::future::pending::<i32>().await),
            ["fail"] => bail!("connection reset by peer"),
            ["panic"] => panic!("fake host panicked on request"),
            _ => {
                let message = format!("{}: command not found\n", words.join(" "));
                stderr.write_all(message.as_bytes()).await?;
                Ok(127)
            }
        }
    }

    /// Acts as the receiving end of `scp -t`, accepting exactly one `C` record.
    async fn scp_sink(
        &self,
        dir: &str,
        input: &[u8],
        stdout: &mut DuplexStream,
        stderr: &mut DuplexStream,
    ) -> anyhow::Result<i32> {
        // Ready to receive.
        stdout.write_all(b"\0").await?;

        match parse_scp_record(input) {
            Ok((mode, name, payload)) => {
                let path = match dir {
                    "." | "./" => name,
                    dir => format!("{}/{name}", dir.trim_end_matches('/')),
                };
                lock(&self.modes).insert(normalize(&path), mode);
                self.put_file(&path, payload);

                // Header and data acknowledgements.
                stdout.write_all(b"\0\0").await?;
                Ok(0)
            }
            Err(reason) => {
                stderr
                    .write_all(format!("scp: protocol error: {reason}\n").as_bytes())
                    .await?;
                Ok(1)
            }
        }
    }
}

/// Parses `C<mode> <length> <name>\n<payload>\0`, rejecting anything a real scp sink would.
fn parse_scp_record(input: &[u8]) -> Result<(u32, String, Vec<u8>), String> {
    let newline = input
        .iter()
        .position(|&b| b == b'\n')
        .ok_or("missing header line")?;
    let header = std::str::from_utf8(&input[..newline]).map_err(|_| "header is not UTF-8")?;
    let rest = &input[newline + 1..];

    let mut fields = header.splitn(3, ' ');
    let (mode, length, name) = match (fields.next(), fields.next(), fields.next()) {
        (Some(mode), Some(length), Some(name)) => (mode, length, name),
        _ => return Err(format!("malformed header: {header:?}")),
    };

    let mode = mode
        .strip_prefix('C')
        .filter(|digits| digits.len() == 4)
        .and_then(|digits| u32::from_str_radix(digits, 8).ok())
        .ok_or_else(|| format!("bad mode: {mode:?}"))?;
    let length: usize = length
        .parse()
        .map_err(|_| format!("bad length: {length:?}"))?;
    if name.is_empty() || name.contains('/') {
        return Err(format!("unexpected filename: {name:?}"));
    }

    if rest.len() != length + 1 || rest[length] != 0 {
        return Err(format!(
            "expected {length} bytes and a NUL trailer, got {} bytes",
            rest.len(),
        ));
    }
    Ok((mode, name.to_owned(), rest[..length].to_vec()))
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").to_owned()
}

/// Undoes the shell quoting of a single word.
fn unquote(word: &str) -> anyhow::Result<String> {
    match shlex::split(word).as_deref() {
        Some([word]) => Ok(word.clone()),
        _ => bail!("expected exactly one word: {word:?}"),
    }
}

/// Marks a command as in progress on a host for as long as it lives.
struct Busy(Arc<FakeHost>);

impl Busy {
    fn enter(host: Arc<FakeHost>) -> Self {
        let now = host.active.fetch_add(1, Ordering::SeqCst) + 1;
        host.peak.fetch_max(now, Ordering::SeqCst);
        Busy(host)
    }
}

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection to a [FakeHost].
#[derive(Debug)]
struct FakeConnection {
    host: Arc<FakeHost>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn spawn<'a>(&'a self, command: &str) -> anyhow::Result<RemoteProcess<'a>> {
        if self.host.failing_sessions.load(Ordering::SeqCst) {
            bail!("the host refused to open a session");
        }
        lock(&self.host.commands).push(command.to_owned());

        let busy = Busy::enter(self.host.clone());
        let (stdin, remote_stdin) = duplex(PIPE_CAPACITY);
        let (remote_stdout, stdout) = duplex(PIPE_CAPACITY);
        let (remote_stderr, stderr) = duplex(PIPE_CAPACITY);
        let latency = *lock(&self.host.latency);
        let command = command.to_owned();

        let exit = Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let status = busy
                .0
                .run(&command, remote_stdin, remote_stdout, remote_stderr)
                .await;
            drop(busy);
            status
        });

        Ok(RemoteProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
        })
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.host.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_record() {
        let input = b"C0644 5 notes.txt\nhello\0";
        assert_eq!(
            Ok((0o644, "notes.txt".to_string(), b"hello".to_vec())),
            parse_scp_record(input),
        );
    }

    #[test]
    fn rejects_a_missing_trailer() {
        assert!(parse_scp_record(b"C0644 5 notes.txt\nhello").is_err());
    }

    #[test]
    fn rejects_a_short_mode() {
        assert!(parse_scp_record(b"C644 5 notes.txt\nhello\0").is_err());
    }

    #[test]
    fn rejects_paths_in_names() {
        assert!(parse_scp_record(b"C0644 5 a/notes.txt\nhello\0").is_err());
    }

    #[test]
    fn unquote_handles_spaces() {
        assert_eq!("my notes.txt", unquote("'my notes.txt'").unwrap());
        assert!(unquote("two words").is_err());
    }
}
