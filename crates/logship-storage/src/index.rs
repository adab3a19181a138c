//! Memory-mapped offset index.
//!
//! The index file is a packed array of 12-byte entries mapping a relative
//! offset (u32) to the byte position of its record in the companion store
//! (u64). On open the file is grown to the segment's configured maximum so
//! the whole region can be mapped once and written through without resize
//! syscalls on the append path; on close it is truncated back down to the
//! used prefix. The live size is therefore the pre-truncation file length
//! at open time.
//!
//! The `Index` exclusively owns its mapping. Closing releases the map,
//! syncs the file, and only then truncates; the internal mutex guarantees
//! no other operation is in flight at that point.

use crate::codec::{self, ENT_WIDTH, OFF_WIDTH};
use logship_core::{Error, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct Index {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    /// `None` once the index has been closed and the mapping released.
    mmap: Option<MmapMut>,
    /// Bytes used; always a multiple of `ENT_WIDTH`.
    size: u64,
}

impl Index {
    /// Open or create the index file at `path`, sizing it to
    /// `max_index_bytes` and mapping the whole region.
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        // The file was truncated to its used size when last closed, so
        // its current length is the live size.
        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;

        // SAFETY: the map is private to this Index and dropped before the
        // file is truncated in close(); no alias outlives it.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                mmap: Some(mmap),
                size,
            }),
        })
    }

    /// Read entry `n`; `-1` addresses the last entry. Fails with an
    /// EOF-class error when the index is empty or `n` lies past the end.
    pub fn read(&self, n: i64) -> Result<(u32, u64)> {
        let inner = self.inner.lock();
        let mmap = inner.mapped()?;

        if inner.size == 0 {
            return Err(Error::Eof);
        }

        let entry = if n == -1 {
            inner.size / ENT_WIDTH - 1
        } else {
            n as u64
        };

        let pos = entry * ENT_WIDTH;
        if inner.size < pos + ENT_WIDTH {
            return Err(Error::Eof);
        }

        let rel_off = codec::get_u32(&mmap[pos as usize..]);
        let store_pos = codec::get_u64(&mmap[(pos + OFF_WIDTH) as usize..]);
        Ok((rel_off, store_pos))
    }

    /// Append an entry. Fails with an EOF-class error when the mapped
    /// region has no room for another entry.
    pub fn write(&self, rel_off: u32, pos: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        let mmap = inner.mapped_mut()?;

        if (mmap.len() as u64) < size + ENT_WIDTH {
            return Err(Error::IndexFull);
        }

        codec::put_u32(&mut mmap[size as usize..], rel_off);
        codec::put_u64(&mut mmap[(size + OFF_WIDTH) as usize..], pos);
        inner.size += ENT_WIDTH;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync the mapping, release it, sync the file, and truncate the file
    /// down to the used prefix. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(mmap) = inner.mmap.take() else {
            return Ok(());
        };
        mmap.flush()?;
        drop(mmap);

        inner.file.sync_all()?;
        inner.file.set_len(inner.size)?;
        inner.file.sync_all()?;
        Ok(())
    }
}

impl Inner {
    fn mapped(&self) -> Result<&MmapMut> {
        self.mmap.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "index is closed",
            ))
        })
    }

    fn mapped_mut(&mut self) -> Result<&mut MmapMut> {
        self.mmap.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "index is closed",
            ))
        })
    }
}
