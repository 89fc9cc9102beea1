//! Runs one shell command on many hosts at once and prints what each host said.
//!
//! ```text
//! muster [-i <key-file>]... [-u <user>] [-c <settings-file>] <host>... -- <command>...
//! ```
//!
//! Hosts take the form `[user@]host[:port]`. `-u` sets the user for hosts that don't name one.
//! Each `-i` adds a private key to try, in order; without any, ssh picks the keys on its own.
//! Settings come from `-c`, or from `/etc/muster/settings.yaml` if it exists.
//!
//! Every line of output is prefixed with the host, the exit code, and the stream it came from.
//! A host that can't be reached gets one `ERR` line and is left out; the others still run the
//! command. Exits with status 1 if any host failed. Set `RUST_LOG` for more detail.

use anyhow::{anyhow, bail};
use muster::{Credential, Node, NodeList, Response, Settings, Target, LOCAL_FAILURE};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Default, PartialEq)]
struct Args {
    keys: Vec<PathBuf>,
    user: Option<String>,
    settings: Option<PathBuf>,
    hosts: Vec<String>,
    command: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| anyhow!("{flag} needs a value"));
        match arg.as_str() {
            "-i" => parsed.keys.push(value("-i")?.into()),
            "-u" => parsed.user = Some(value("-u")?),
            "-c" => parsed.settings = Some(value("-c")?.into()),
            "--" => {
                parsed.command = args.by_ref().collect::<Vec<_>>().join(" ");
                break;
            }
            flag if flag.starts_with('-') => bail!("unknown option: {flag}"),
            _ => parsed.hosts.push(arg),
        }
    }

    if parsed.hosts.is_empty() {
        bail!("no hosts given");
    }
    if parsed.command.trim().is_empty() {
        bail!("no command given; put it after `--`");
    }
    Ok(parsed)
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn line(host: &str, code: i32, stream: &str, text: &str) -> String {
    format!("{host} {code:>3} {stream} | {text}")
}

fn response_lines(response: &Response) -> Vec<String> {
    let host = response.node().target().to_string();
    let code = response.exit_code();
    let mut lines = vec![];
    for (stream, bytes) in [("OUT", response.stdout()), ("ERR", response.stderr())] {
        for text in String::from_utf8_lossy(bytes).lines() {
            lines.push(line(&host, code, stream, text));
        }
    }
    if lines.is_empty() {
        let outcome = if response.success() { "<SUCCESS>" } else { "<FAILURE>" };
        lines.push(line(&host, code, "OUT", outcome));
    }
    lines
}

/// Connects every node it can. Returns the nodes that connected and one line per node that
/// didn't.
fn connect_all(nodes: &NodeList) -> (NodeList, Vec<String>) {
    let mut connected = vec![];
    let mut failures = vec![];
    for node in nodes {
        match node.connect() {
            Ok(()) => connected.push(node.clone()),
            Err(error) => {
                let host = node.target().to_string();
                let text = format!("{:#}", anyhow::Error::new(error));
                failures.push(line(&host, LOCAL_FAILURE, "ERR", &text));
            }
        }
    }
    (NodeList::from(connected), failures)
}

fn main() -> anyhow::Result<ExitCode> {
    setup_tracing();
    let args = parse_args(env::args().skip(1))?;
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::load_default()?,
    };

    let mut nodes = vec![];
    for host in &args.hosts {
        let mut target: Target = host.parse()?;
        if target.user.is_none() {
            target.user = args.user.clone();
        }
        for key in &args.keys {
            target = target.credential(Credential::identity(key));
        }
        nodes.push(Node::new(target, &settings));
    }
    let nodes = NodeList::from(nodes);

    let (nodes, failures) = connect_all(&nodes);
    for failure in &failures {
        println!("{failure}");
    }
    let mut failed = !failures.is_empty();
    for response in nodes.run(&args.command) {
        for line in response_lines(&response) {
            println!("{line}");
        }
        failed |= !response.success();
    }
    nodes.close()?;

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
