//! Host-side collaborators the VM reaches through its system calls.
//!
//! The VM never owns these: a `Host` bundles borrowed references to a file
//! handle table, a formatted-output engine and the stream standing in for
//! standard output, and is handed to `Vm::run`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use log::{debug, warn};

// --- File System ---

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("invalid file handle: {0}")]
    BadHandle(i32),
}

/// File access on behalf of the guest's OPEN/READ/CLOS system calls.
pub trait FileSystem {
    /// Opens `pathname`, returning a descriptor or a negative value on failure.
    fn open(&mut self, pathname: &str, mode: i32) -> i32;

    /// Returns up to `nbytes` bytes from the descriptor's current position;
    /// empty at end of file.
    fn read(&mut self, fd: i32, nbytes: usize) -> Result<Vec<u8>, FsError>;

    fn close(&mut self, fd: i32) -> Result<(), FsError>;
}

#[derive(Debug)]
struct FileHandle {
    pathname: PathBuf,
    contents: Vec<u8>,
    cursor: usize,
}

/// Read-only view of the real file system. Each opened file is read into
/// memory whole and served from a cursor.
#[derive(Debug, Default)]
pub struct HostFs {
    handles: HashMap<i32, FileHandle>,
    next_fd: i32,
}

impl HostFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of descriptors currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

impl FileSystem for HostFs {
    fn open(&mut self, pathname: &str, mode: i32) -> i32 {
        if mode & libc::O_ACCMODE != libc::O_RDONLY {
            warn!("open({:?}, {:#o}): only read access is supported", pathname, mode);
            return -1;
        }
        let contents = match fs::read(pathname) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("open({:?}) failed: {}", pathname, e);
                return -1;
            }
        };
        let fd = self.next_fd;
        self.next_fd += 1;
        self.handles.insert(fd, FileHandle { pathname: pathname.into(), contents, cursor: 0 });
        debug!("open({:?}) = {}", pathname, fd);
        fd
    }

    fn read(&mut self, fd: i32, nbytes: usize) -> Result<Vec<u8>, FsError> {
        let handle = self.handles.get_mut(&fd).ok_or(FsError::BadHandle(fd))?;
        let start = handle.cursor.min(handle.contents.len());
        let end = start.saturating_add(nbytes).min(handle.contents.len());
        handle.cursor = end;
        Ok(handle.contents[start..end].to_vec())
    }

    fn close(&mut self, fd: i32) -> Result<(), FsError> {
        let handle = self.handles.remove(&fd).ok_or(FsError::BadHandle(fd))?;
        debug!("close({}) [{}]", fd, handle.pathname.display());
        Ok(())
    }
}

// --- Formatted Output ---

/// Expands a printf-style template.
///
/// `args` are the guest's argument words, sign-extended to 64 bits. A `%s`
/// directive passes its argument to `strings`, which reads the NUL-terminated
/// string at that address out of VM memory.
pub trait Formatter {
    fn format(
        &mut self,
        template: &[u8],
        args: &[i64],
        strings: &mut dyn FnMut(i64) -> Vec<u8>,
    ) -> Vec<u8>;
}

// --- Host Bundle ---

/// Everything a running VM may call out to.
pub struct Host<'a> {
    pub fs: &'a mut dyn FileSystem,
    pub formatter: &'a mut dyn Formatter,
    pub stdout: &'a mut dyn Write,
}

impl<'a> Host<'a> {
    pub fn new(
        fs: &'a mut dyn FileSystem,
        formatter: &'a mut dyn Formatter,
        stdout: &'a mut dyn Write,
    ) -> Self {
        Host { fs, formatter, stdout }
    }
}
