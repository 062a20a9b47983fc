pub mod tempfs;

pub type Path = str;

/// Represents an open file.
///
/// **IMPORTANT**: the kernel must call [`FileSystem::close`] on every handle
/// it opened. Otherwise, the filesystem has to keep the file's data around
/// indefinitely!
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    /// descriptor number of this open file
    pub fd: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// no file with that name
    NotFound,
    /// handle was never opened, or already closed
    BadHandle,
    /// no space left on device
    NoSpace,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::BadHandle => write!(f, "bad file handle"),
            Self::NoSpace => write!(f, "no space left on device"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// The backing file system the kernel pages against.
///
/// Files are flat and named; all transfers are by byte offset. Short reads
/// and writes are reported through the returned count, never as an error;
/// deciding whether a short transfer is fatal is the caller's business.
pub trait FileSystem {
    /// Open a file, creating it (empty) if `create` is set and it does not
    /// exist yet.
    fn open(&mut self, name: &Path, create: bool) -> Result<FileHandle>;
    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read; 0 at or past end of file.
    fn read(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Write `buf` at `offset`, extending the file with zeroes if `offset`
    /// lies past its current end. Returns the number of bytes written.
    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize>;
    /// Remove a file by name. Data stays readable through handles that are
    /// still open; the space is reclaimed when the last one closes.
    fn remove(&mut self, name: &Path) -> Result<()>;
    /// Close an open handle. Closing an already-closed handle is a no-op.
    fn close(&mut self, file: FileHandle);
}
