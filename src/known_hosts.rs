use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;

/// Append-only trust-on-first-use store of host keys.
///
/// Each line holds `hostname SP key-type SP base64-key`; matching is exact
/// on all three fields. A host whose key changed simply gains a second line,
/// and nothing locks the file against concurrent probes sharing a home
/// directory.
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    /// A store backed by the given file, which need not exist yet
    pub fn new(path: PathBuf) -> Self {
        KnownHosts { path }
    }

    /// Checks whether the exact (hostname, key type, base64 key) triple has
    /// been recorded. A missing file means no host is known yet.
    pub fn contains(&self, hostname: &str, key_type: &str, key_b64: &str) -> io::Result<bool> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            if fields.next() == Some(hostname)
                && fields.next() == Some(key_type)
                && fields.next() == Some(key_b64)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Appends a new triple, creating the containing directory with mode
    /// 0700 and the file with mode 0600 when absent
    pub fn record(&self, hostname: &str, key_type: &str, key_b64: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&self.path)?;
        writeln!(file, "{hostname} {key_type} {key_b64}")?;
        Ok(())
    }
}
