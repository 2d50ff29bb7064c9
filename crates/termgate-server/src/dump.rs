//! Debug transcripts.
//!
//! With `debug` on, every byte crossing a session is copied, untranscoded,
//! into two files under the log directory:
//! `{name}.dump_{kind}_out.txt` (backend to client) and
//! `{name}.dump_{kind}_in.txt` (client to backend). Files are truncated on
//! open. A transcript that fails to write is logged once and switched off;
//! it never takes the session down with it.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// One transcript file.
pub struct Transcript {
    path: PathBuf,
    file: Option<File>,
}

impl Transcript {
    /// Create (or truncate) the file. Failure is logged, not returned.
    pub async fn create(path: PathBuf) -> Option<Self> {
        match File::create(&path).await {
            Ok(file) => {
                debug!(path = %path.display(), "transcript opened");
                Some(Self {
                    path,
                    file: Some(file),
                })
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open transcript");
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&mut self, data: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(data).await {
            warn!(path = %self.path.display(), error = %e, "transcript write failed, disabling");
            self.file = None;
        }
    }

    pub async fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush().await;
        }
    }
}

/// The output/input pair for one connection.
#[derive(Default)]
pub struct Transcripts {
    pub output: Option<Transcript>,
    pub input: Option<Transcript>,
}

impl Transcripts {
    /// No transcripts.
    pub fn off() -> Self {
        Self::default()
    }

    /// Open both files for `name` (a host, or `host_alias`).
    pub async fn open(log_dir: &Path, name: &str, kind: &str) -> Self {
        let file_name = |dir: &str| format!("{}.dump_{}_{}.txt", sanitize(name), kind, dir);
        Self {
            output: Transcript::create(log_dir.join(file_name("out"))).await,
            input: Transcript::create(log_dir.join(file_name("in"))).await,
        }
    }
}

/// Transcript base name for a command run on `host`: the explicit alias,
/// or the command with spaces replaced by underscores.
pub fn command_alias(host: &str, alias: &str, command: &str) -> String {
    let alias = if alias.is_empty() {
        command.replace(' ', "_")
    } else {
        alias.to_string()
    };
    format!("{}_{}", host, alias)
}

// Host names and commands come from the client; keep them inside log_dir.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}
