use crate::vfs::{Error, FileHandle, FileSystem, Path, Result};
use std::collections::BTreeMap;

type INodeNum = u64;

struct TempFile {
    data: Vec<u8>,
    /// number of directory entries pointing at this file (0 or 1 — the
    /// namespace is flat)
    nlink: u16,
    open_handles: u32,
}

/// In-memory filesystem, the simulated disk the kernel pages against.
pub struct TempFs {
    inodes: BTreeMap<INodeNum, TempFile>,
    names: BTreeMap<String, INodeNum>,
    handles: BTreeMap<u64, INodeNum>,
    next_inode: INodeNum,
    next_fd: u64,
}

impl Default for TempFs {
    fn default() -> Self {
        Self::new()
    }
}

impl TempFs {
    pub fn new() -> TempFs {
        TempFs {
            inodes: BTreeMap::new(),
            names: BTreeMap::new(),
            handles: BTreeMap::new(),
            next_inode: 1,
            next_fd: 1,
        }
    }

    fn inode_of(&self, file: FileHandle) -> Result<INodeNum> {
        self.handles.get(&file.fd).copied().ok_or(Error::BadHandle)
    }

    /// Drop an inode once nothing references it any more.
    fn reap(&mut self, inode_num: INodeNum) {
        let inode = self
            .inodes
            .get(&inode_num)
            .expect("tempfs consistency error — reference to nonexistent inode");
        if inode.nlink == 0 && inode.open_handles == 0 {
            self.inodes.remove(&inode_num);
        }
    }
}

impl FileSystem for TempFs {
    fn open(&mut self, name: &Path, create: bool) -> Result<FileHandle> {
        log::trace!("tempfs: open {name} (create = {create})");
        let inode_num = match self.names.get(name) {
            Some(&n) => n,
            None if create => {
                let n = self.next_inode;
                self.next_inode += 1;
                self.inodes.insert(
                    n,
                    TempFile {
                        data: Vec::new(),
                        nlink: 1,
                        open_handles: 0,
                    },
                );
                self.names.insert(name.into(), n);
                n
            }
            None => return Err(Error::NotFound),
        };
        let fd = self.next_fd;
        self.next_fd += 1;
        self.handles.insert(fd, inode_num);
        self.inodes
            .get_mut(&inode_num)
            .expect("tempfs consistency error — name points at nonexistent inode")
            .open_handles += 1;
        Ok(FileHandle { fd })
    }

    fn read(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        log::trace!(
            "tempfs: read from fd {} @ offset {} length {}",
            file.fd,
            offset,
            buf.len()
        );
        let inode_num = self.inode_of(file)?;
        let f = &self.inodes[&inode_num];
        if offset >= f.data.len() as u64 {
            // can't read any data
            return Ok(0);
        }
        let offset = offset as usize; // fits into usize by check above
        let read_len = buf.len().min(f.data.len() - offset);
        buf[..read_len].copy_from_slice(&f.data[offset..offset + read_len]);
        Ok(read_len)
    }

    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        log::trace!(
            "tempfs: write to fd {} @ offset {} length {}",
            file.fd,
            offset,
            buf.len()
        );
        let inode_num = self.inode_of(file)?;
        let f = self
            .inodes
            .get_mut(&inode_num)
            .expect("tempfs consistency error — handle points at nonexistent inode");
        if offset > (isize::MAX as u64).saturating_sub(buf.len() as u64) {
            // file data would exceed isize::MAX bytes
            return Err(Error::NoSpace);
        }
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > f.data.len() {
            f.data.try_reserve(end - f.data.len()).map_err(|_| Error::NoSpace)?;
            f.data.resize(end, 0);
        }
        f.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn remove(&mut self, name: &Path) -> Result<()> {
        log::trace!("tempfs: remove {name}");
        let inode_num = self.names.remove(name).ok_or(Error::NotFound)?;
        let inode = self
            .inodes
            .get_mut(&inode_num)
            .expect("tempfs consistency error — name points at nonexistent inode");
        assert!(inode.nlink > 0, "remove called on an already-removed file");
        inode.nlink -= 1;
        self.reap(inode_num);
        Ok(())
    }

    fn close(&mut self, file: FileHandle) {
        log::trace!("tempfs: close fd {}", file.fd);
        let Some(inode_num) = self.handles.remove(&file.fd) else {
            return;
        };
        let inode = self
            .inodes
            .get_mut(&inode_num)
            .expect("tempfs consistency error — handle points at nonexistent inode");
        inode.open_handles -= 1;
        self.reap(inode_num);
    }
}
