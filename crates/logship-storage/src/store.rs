//! Append-only record file.
//!
//! A store is a flat file of frames, each an 8-byte big-endian length
//! followed by that many payload bytes. Writes are staged through a
//! buffered writer; every read flushes the buffer first so data appended
//! by this process is always visible to its own reads.

use crate::codec::{self, LEN_WIDTH};
use bytes::Bytes;
use logship_core::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub struct Store {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    writer: BufWriter<File>,
    /// Logical size: bytes appended, length prefixes included.
    size: u64,
    closed: bool,
}

impl Store {
    /// Open or create the store file at `path`. The logical size is the
    /// current file length; a store is only ever closed with its buffer
    /// flushed, so the file length is authoritative.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                size,
                closed: false,
            }),
        })
    }

    /// Append one framed payload. Returns the number of bytes written
    /// (frame included) and the position the frame starts at.
    pub fn append(&self, p: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let pos = inner.size;

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        codec::put_u64(&mut len_buf, p.len() as u64);
        inner.writer.write_all(&len_buf)?;
        inner.writer.write_all(p)?;

        let written = LEN_WIDTH + p.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the payload of the frame starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Bytes> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.writer.flush()?;

        let file = inner.writer.get_ref();
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, pos)?;

        let mut payload = vec![0u8; codec::get_u64(&len_buf) as usize];
        file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(Bytes::from(payload))
    }

    /// Fill as much of `buf` as possible starting at byte `off`. Returns
    /// the number of bytes read; zero means end of file.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.writer.flush()?;
        Ok(inner.writer.get_ref().read_at(buf, off)?)
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and sync the file. Operations after close fail.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        inner.closed = true;
        Ok(())
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store is closed",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"hello world";
    /// Frame width of PAYLOAD: 8-byte prefix + 11 payload bytes.
    const WIDTH: u64 = LEN_WIDTH + PAYLOAD.len() as u64;

    #[test]
    fn test_append_read() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("a.store")).unwrap();

        for i in 1..4u64 {
            let (n, pos) = store.append(PAYLOAD).unwrap();
            assert_eq!(n, WIDTH);
            assert_eq!(pos + n, WIDTH * i);
        }

        for i in 0..3u64 {
            let got = store.read(WIDTH * i).unwrap();
            assert_eq!(got, Bytes::from_static(PAYLOAD));
        }
    }

    #[test]
    fn test_read_sees_buffered_writes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("a.store")).unwrap();

        let (_, pos) = store.append(PAYLOAD).unwrap();
        // No explicit flush: read must flush the write buffer itself.
        assert_eq!(store.read(pos).unwrap(), Bytes::from_static(PAYLOAD));
    }

    #[test]
    fn test_read_at() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("a.store")).unwrap();
        store.append(PAYLOAD).unwrap();

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        let n = store.read_at(&mut len_buf, 0).unwrap();
        assert_eq!(n, LEN_WIDTH as usize);
        assert_eq!(codec::get_u64(&len_buf), PAYLOAD.len() as u64);

        let mut payload = vec![0u8; PAYLOAD.len()];
        let n = store.read_at(&mut payload, LEN_WIDTH).unwrap();
        assert_eq!(n, PAYLOAD.len());
        assert_eq!(payload, PAYLOAD);
    }

    #[test]
    fn test_reopen_recovers_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.store");

        let store = Store::open(&path).unwrap();
        store.append(PAYLOAD).unwrap();
        store.append(PAYLOAD).unwrap();
        store.close().unwrap();
        drop(store);

        let store = Store::open(&path).unwrap();
        assert_eq!(store.size(), WIDTH * 2);
        assert_eq!(store.read(WIDTH).unwrap(), Bytes::from_static(PAYLOAD));
    }

    #[test]
    fn test_read_past_end_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("a.store")).unwrap();
        store.append(PAYLOAD).unwrap();
        assert!(matches!(store.read(WIDTH * 10), Err(Error::Io(_))));
    }

    #[test]
    fn test_ops_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("a.store")).unwrap();
        store.append(PAYLOAD).unwrap();
        store.close().unwrap();
        assert!(store.append(PAYLOAD).is_err());
        assert!(store.read(0).is_err());
    }
}
