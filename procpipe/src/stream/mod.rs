//! Stream directives and their resolution into OS handles.
//!
//! A [`StreamDirective`] says what should happen to one boundary stream:
//! the first stage's stdin, or the last stage's stdout/stderr. [`resolve`]
//! turns a directive into a [`ResolvedStream`] exactly once, when the owning
//! stage is spawned. The resolved stream owns whatever backs it (temp file,
//! output file, caller descriptor) until the pipeline is closed, at which
//! point [`ResolvedStream::release`] reads buffers back and deletes temp
//! files.
//!
//! Temp files are used instead of in-memory pipes for `Buffer` capture so
//! the controller never has to drain several full pipes at once.

mod captured;

pub use captured::Captured;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::errors::{PipelineError, PipelineResult};

/// What to do with a boundary stream.
#[derive(Debug)]
pub enum StreamDirective {
    /// Connect to the null device.
    Discard,
    /// Use the controlling process's own stream.
    Inherit,
    /// An OS pipe. The caller may take the live handle; otherwise `wait`
    /// drains it into memory.
    Pipe,
    /// Capture into a temp file, read back when the pipeline is closed.
    Buffer,
    /// Create/truncate the file and write to it directly (outputs only).
    File(PathBuf),
    /// Feed these bytes to the first stage (stdin only).
    Literal(Vec<u8>),
    /// A descriptor supplied by the caller.
    Handle(OwnedFd),
}

impl StreamDirective {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        StreamDirective::File(path.into())
    }

    pub fn literal(data: impl Into<Vec<u8>>) -> Self {
        StreamDirective::Literal(data.into())
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            StreamDirective::Discard => StreamKind::Discard,
            StreamDirective::Inherit => StreamKind::Inherit,
            StreamDirective::Pipe => StreamKind::Pipe,
            StreamDirective::Buffer => StreamKind::Buffer,
            StreamDirective::File(_) => StreamKind::File,
            StreamDirective::Literal(_) => StreamKind::Literal,
            StreamDirective::Handle(_) => StreamKind::Handle,
        }
    }

    /// Reject directives that make no sense for `role`.
    pub fn validate(&self, role: StreamRole) -> PipelineResult<()> {
        let allowed = match (self, role) {
            (StreamDirective::Literal(_), StreamRole::Stdin) => true,
            (StreamDirective::Literal(_), _) => false,
            (StreamDirective::Buffer | StreamDirective::File(_), StreamRole::Stdin) => false,
            (StreamDirective::File(path), _) => !path.as_os_str().is_empty(),
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "{:?} cannot be used for {}",
                self.kind(),
                role
            )))
        }
    }
}

/// Which boundary a directive applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Stdin,
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StreamRole::Stdin => "stdin",
            StreamRole::Stdout => "stdout",
            StreamRole::Stderr => "stderr",
        })
    }
}

/// Tag of a directive, reported after the pipeline has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Discard,
    Inherit,
    Pipe,
    Buffer,
    File,
    Literal,
    Handle,
}

impl StreamKind {
    /// Whether the engine captures this stream into memory.
    pub fn is_captured(self) -> bool {
        matches!(self, StreamKind::Pipe | StreamKind::Buffer)
    }
}

/// A directive turned into a concrete handle.
#[derive(Debug)]
pub(crate) enum ResolvedStream {
    Null,
    Inherit,
    Piped,
    File { file: File, path: PathBuf },
    Buffer(NamedTempFile),
    Literal(NamedTempFile),
    Handle(OwnedFd),
}

/// Resolve `directive` for `role`.
///
/// Creates files and temp files as a side effect, so it must only be called
/// when the stage that owns the boundary is about to be spawned.
pub(crate) fn resolve(directive: StreamDirective, role: StreamRole) -> PipelineResult<ResolvedStream> {
    directive.validate(role)?;

    let resolved = match directive {
        StreamDirective::Discard => ResolvedStream::Null,
        StreamDirective::Inherit => ResolvedStream::Inherit,
        StreamDirective::Pipe => ResolvedStream::Piped,
        StreamDirective::Buffer => ResolvedStream::Buffer(temp_buffer()?),
        StreamDirective::File(path) => {
            let file = open_output(&path)?;
            ResolvedStream::File { file, path }
        }
        StreamDirective::Literal(data) => ResolvedStream::Literal(literal_source(&data)?),
        StreamDirective::Handle(fd) => ResolvedStream::Handle(fd),
    };

    tracing::trace!(role = %role, kind = ?resolved.kind(), "resolved stream");
    Ok(resolved)
}

impl ResolvedStream {
    pub(crate) fn kind(&self) -> StreamKind {
        match self {
            ResolvedStream::Null => StreamKind::Discard,
            ResolvedStream::Inherit => StreamKind::Inherit,
            ResolvedStream::Piped => StreamKind::Pipe,
            ResolvedStream::File { .. } => StreamKind::File,
            ResolvedStream::Buffer(_) => StreamKind::Buffer,
            ResolvedStream::Literal(_) => StreamKind::Literal,
            ResolvedStream::Handle(_) => StreamKind::Handle,
        }
    }

    /// The child's end of this stream. File-backed streams hand out a
    /// duplicate descriptor so the original stays with the pipeline.
    pub(crate) fn stdio(&self) -> io::Result<Stdio> {
        Ok(match self {
            ResolvedStream::Null => Stdio::null(),
            ResolvedStream::Inherit => Stdio::inherit(),
            ResolvedStream::Piped => Stdio::piped(),
            ResolvedStream::File { file, .. } => Stdio::from(file.try_clone()?),
            ResolvedStream::Buffer(tmp) | ResolvedStream::Literal(tmp) => {
                Stdio::from(tmp.as_file().try_clone()?)
            }
            ResolvedStream::Handle(fd) => Stdio::from(fd.try_clone()?),
        })
    }

    #[cfg(test)]
    pub(crate) fn temp_path(&self) -> Option<&Path> {
        match self {
            ResolvedStream::Buffer(tmp) | ResolvedStream::Literal(tmp) => Some(tmp.path()),
            _ => None,
        }
    }

    /// Close the handle. A `Buffer` is read back and returned; temp files
    /// are deleted. Failures are logged, never returned.
    pub(crate) fn release(self) -> Option<Vec<u8>> {
        match self {
            ResolvedStream::Buffer(tmp) => drain_temp(tmp),
            ResolvedStream::Literal(tmp) => {
                delete_temp(tmp);
                None
            }
            ResolvedStream::File { file, path } => {
                if let Err(e) = file.sync_data() {
                    tracing::warn!(path = %path.display(), error = %e, "failed to flush output file");
                }
                None
            }
            ResolvedStream::Null
            | ResolvedStream::Inherit
            | ResolvedStream::Piped
            | ResolvedStream::Handle(_) => None,
        }
    }
}

/// Fresh read+write temp file used as a capture buffer.
pub(crate) fn temp_buffer() -> io::Result<NamedTempFile> {
    tempfile::Builder::new().prefix("procpipe-").tempfile()
}

fn open_output(path: &Path) -> PipelineResult<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| {
            PipelineError::Io(io::Error::new(
                e.kind(),
                format!("cannot open {} for writing: {}", path.display(), e),
            ))
        })
}

fn literal_source(data: &[u8]) -> io::Result<NamedTempFile> {
    let mut tmp = temp_buffer()?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file_mut().seek(SeekFrom::Start(0))?;
    Ok(tmp)
}

/// Read a temp buffer from the start, then delete it.
pub(crate) fn drain_temp(mut tmp: NamedTempFile) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    let read = tmp
        .as_file_mut()
        .seek(SeekFrom::Start(0))
        .and_then(|_| tmp.as_file_mut().read_to_end(&mut data));

    if let Err(e) = &read {
        tracing::warn!(path = %tmp.path().display(), error = %e, "failed to read capture buffer");
    }
    delete_temp(tmp);

    read.ok().map(|_| data)
}

fn delete_temp(tmp: NamedTempFile) {
    let path = tmp.path().to_path_buf();
    if let Err(e) = tmp.close() {
        tracing::warn!(path = %path.display(), error = %e, "failed to delete temp file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_roles() {
        assert!(StreamDirective::literal("x").validate(StreamRole::Stdin).is_ok());
        assert!(StreamDirective::literal("x").validate(StreamRole::Stdout).is_err());
        assert!(StreamDirective::Buffer.validate(StreamRole::Stdin).is_err());
        assert!(StreamDirective::file("out").validate(StreamRole::Stdin).is_err());
        assert!(StreamDirective::file("").validate(StreamRole::Stdout).is_err());
        assert!(StreamDirective::Buffer.validate(StreamRole::Stderr).is_ok());
        assert!(StreamDirective::Pipe.validate(StreamRole::Stdin).is_ok());
    }

    #[test]
    fn test_literal_is_rewound() {
        let resolved = resolve(StreamDirective::literal("foo\nbar"), StreamRole::Stdin).unwrap();
        let ResolvedStream::Literal(tmp) = &resolved else {
            panic!("expected literal, got {:?}", resolved);
        };
        let path = tmp.path().to_path_buf();

        let mut contents = String::new();
        tmp.as_file().try_clone().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "foo\nbar");

        assert!(resolved.release().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_buffer_release_reads_back_and_deletes() {
        let resolved = resolve(StreamDirective::Buffer, StreamRole::Stdout).unwrap();
        let ResolvedStream::Buffer(tmp) = &resolved else {
            panic!("expected buffer, got {:?}", resolved);
        };
        let path = tmp.path().to_path_buf();
        tmp.as_file().try_clone().unwrap().write_all(b"hi\n").unwrap();

        assert_eq!(resolved.release(), Some(b"hi\n".to_vec()));
        assert!(!path.exists());
    }

    #[test]
    fn test_file_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "stale contents").unwrap();

        let resolved = resolve(StreamDirective::file(&path), StreamRole::Stdout).unwrap();
        assert_eq!(resolved.kind(), StreamKind::File);
        assert!(resolved.release().is_none());
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn test_file_in_missing_directory_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("out.txt");
        let err = resolve(StreamDirective::file(&path), StreamRole::Stderr).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn test_kind_reporting() {
        assert!(StreamKind::Pipe.is_captured());
        assert!(StreamKind::Buffer.is_captured());
        assert!(!StreamKind::File.is_captured());
        assert_eq!(StreamDirective::Discard.kind(), StreamKind::Discard);
        assert_eq!(
            resolve(StreamDirective::Inherit, StreamRole::Stderr).unwrap().kind(),
            StreamKind::Inherit
        );
    }
}
