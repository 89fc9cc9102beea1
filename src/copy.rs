//! Encodes files for the remote processes that receive them.
//!
//! Copying a file to a node is an ordinary [Request]: a receiver command runs on the remote host,
//! and its standard input carries a one-line header, the file's bytes, and, for some receivers,
//! a trailer. The header has the form
//!
//! ```text
//! C<mode> <length> <name>\n
//! ```
//!
//! where `mode` is four octal digits, `length` is the payload size in decimal, and `name` is the
//! destination file name. For example:
//!
//! ```
//! use muster::copy::Encoding;
//!
//! let pipe = Encoding::Pipe.encode(0o644, "hello.txt", b"hello world").unwrap();
//! assert_eq!(b"C0644 11 hello.txt\nhello world".as_slice(), pipe);
//!
//! let scp = Encoding::Scp.encode(0o644, "hello.txt", b"hello world").unwrap();
//! assert_eq!(b"C0644 11 hello.txt\nhello world\0".as_slice(), scp);
//! ```
//!
//! Encoding is pure: apart from [copy_request] reading its source file, nothing here touches the
//! file system or the network.

use crate::error::{Error, Result};
use crate::request::Request;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// The mode given to files created by [write_request].
pub const DEFAULT_MODE: u32 = 0o644;

/// The permission bits a header can carry.
const MODE_BITS: u32 = 0o7777;

/// The shell pipe receiver, minus its destination. It discards the header line and stores the rest.
pub(crate) const PIPE_RECEIVER: &str = "{ read -r header; cat -; } > ";

/// The kind of process receiving a copied file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    /// A shell pipe into the destination file. Expects the header and payload, with no trailer.
    ///
    /// Modes are masked to their permission bits. The receiver does not apply the mode.
    Pipe,

    /// OpenSSH's `scp` in sink mode. Expects the header, payload, and a NUL trailer.
    ///
    /// The receiver applies the mode. Modes with bits outside the permission bits are rejected,
    /// and so are destinations without a file name.
    #[default]
    Scp,
}

impl Encoding {
    /// Builds the header line, including its newline.
    pub fn header(self, mode: u32, length: usize, name: &str) -> Result<String> {
        if name.is_empty() || name.contains('\n') {
            return Err(Error::InvalidHeader(format!("unusable file name: {name:?}")));
        }
        let mode = match self {
            Encoding::Pipe => mode & MODE_BITS,
            Encoding::Scp if mode & !MODE_BITS != 0 => {
                return Err(Error::InvalidHeader(format!(
                    "mode {mode:o} has bits other than permissions"
                )));
            }
            Encoding::Scp if name.contains('/') => {
                return Err(Error::InvalidHeader(format!(
                    "file name {name:?} contains a path separator"
                )));
            }
            Encoding::Scp => mode,
        };
        Ok(format!("C{mode:04o} {length} {name}\n"))
    }

    /// Builds the full input for the receiver: header, payload, and trailer.
    pub fn encode(self, mode: u32, name: &str, content: &[u8]) -> Result<Vec<u8>> {
        let header = self.header(mode, content.len(), name)?;
        let mut encoded = Vec::with_capacity(header.len() + content.len() + 1);
        encoded.extend_from_slice(header.as_bytes());
        encoded.extend_from_slice(content);
        if self == Encoding::Scp {
            encoded.push(0);
        }
        Ok(encoded)
    }

    /// The command line that receives a file at `dest`.
    pub fn receiver(self, dest: &str) -> Result<String> {
        match self {
            Encoding::Pipe => Ok(format!("{PIPE_RECEIVER}{}", quote(dest)?)),
            Encoding::Scp => {
                let (dir, _) = split_destination(dest)?;
                Ok(format!("scp -qrt {}", quote(dir)?))
            }
        }
    }

    /// Builds a [Request] that stores `content` at `dest` with `mode`.
    pub fn request(self, dest: &str, mode: u32, content: &[u8]) -> Result<Request> {
        let name = match self {
            Encoding::Pipe => dest,
            Encoding::Scp => split_destination(dest)?.1,
        };
        let stdin = self.encode(mode, name, content)?;
        Ok(Request::new(self.receiver(dest)?).with_stdin(stdin))
    }
}

/// Reads the local file `src` and builds a [Request] that stores it at `dest`, keeping its
/// permission bits, including the setuid, setgid and sticky bits.
///
/// # Errors
///
/// [Error::Io] if `src` cannot be read, and the errors of [Encoding::request].
pub fn copy_request(src: impl AsRef<Path>, dest: &str, encoding: Encoding) -> Result<Request> {
    let src = src.as_ref();
    let io_error = |source| Error::Io {
        path: src.to_owned(),
        source,
    };

    let mut file = File::open(src).map_err(io_error)?;
    let mode = file.metadata().map_err(io_error)?.permissions().mode() & MODE_BITS;
    let mut content = vec![];
    file.read_to_end(&mut content).map_err(io_error)?;

    encoding.request(dest, mode, &content)
}

/// Builds a [Request] that stores `content` at `dest` with [DEFAULT_MODE].
pub fn write_request(dest: &str, content: &[u8], encoding: Encoding) -> Result<Request> {
    encoding.request(dest, DEFAULT_MODE, content)
}

/// Splits `dest` into the directory to receive into and the file name.
fn split_destination(dest: &str) -> Result<(&str, &str)> {
    if dest.ends_with('/') {
        return Err(Error::InvalidDestination(dest.to_string()));
    }
    let path = Path::new(dest);
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::InvalidDestination(dest.to_string()))?;
    let dir = match path.parent().and_then(|dir| dir.to_str()) {
        Some("") | None => "./",
        Some(dir) => dir,
    };
    Ok((dir, name))
}

fn quote(word: &str) -> Result<String> {
    shlex::try_quote(word)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| Error::InvalidDestination(word.to_string()))
}
