use std::fs::File;
use std::io::{self, ErrorKind, Write};

/// Positional (pread/pwrite-style) file access, plus `tokio::spawn_blocking`-backed
/// async variants used by background jobs.
pub trait FileExt: Send + Sync + 'static {
    fn len(&self) -> io::Result<u64>;

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut written = 0;
        while written != buf.len() {
            written += self.write_at(&buf[written..], offset + written as u64)?;
        }
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut read = 0;
        while read != buf.len() {
            let n = self.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "unexpected end-of-file",
                ));
            }
            read += n;
        }
        Ok(())
    }

    fn sync_all(&self) -> io::Result<()>;
    fn set_len(&self, len: u64) -> io::Result<()>;

    /// A read-only memory map of the file's current contents, used by the log's
    /// binary-search lookup (§4.3's canonical mmap-based bisection).
    fn mmap_ro(&self) -> io::Result<memmap2::Mmap>;

    fn cursor(&self, offset: u64) -> Cursor<'_, Self>
    where
        Self: Sized,
    {
        Cursor {
            file: self,
            offset,
            count: 0,
        }
    }
}

impl FileExt for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        nix::sys::uio::pwrite(self, buf, offset as i64).map_err(nix_to_io)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        nix::sys::uio::pread(self, buf, offset as i64).map_err(nix_to_io)
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn mmap_ro(&self) -> io::Result<memmap2::Mmap> {
        // Safety: the log file is only ever mutated through append (never truncated or
        // rewritten in place) while a lookup's map is alive.
        unsafe { memmap2::Mmap::map(self) }
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

impl<T: FileExt> FileExt for std::sync::Arc<T> {
    fn len(&self) -> io::Result<u64> {
        self.as_ref().len()
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.as_ref().write_at(buf, offset)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_ref().read_at(buf, offset)
    }

    fn sync_all(&self) -> io::Result<()> {
        self.as_ref().sync_all()
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.as_ref().set_len(len)
    }

    fn mmap_ro(&self) -> io::Result<memmap2::Mmap> {
        self.as_ref().mmap_ro()
    }
}

/// Async wrapper spawning the blocking positional I/O calls onto a blocking thread pool,
/// for use from the background-job tasks without stalling the async runtime.
pub async fn write_all_at_async<F: FileExt + Clone>(
    file: F,
    buf: Vec<u8>,
    offset: u64,
) -> (Vec<u8>, io::Result<()>) {
    tokio::task::spawn_blocking(move || {
        let ret = file.write_all_at(&buf, offset);
        (buf, ret)
    })
    .await
    .expect("blocking file write task panicked")
}

pub async fn read_exact_at_async<F: FileExt + Clone>(
    file: F,
    mut buf: Vec<u8>,
    offset: u64,
) -> (Vec<u8>, io::Result<()>) {
    tokio::task::spawn_blocking(move || {
        let ret = file.read_exact_at(&mut buf, offset);
        (buf, ret)
    })
    .await
    .expect("blocking file read task panicked")
}

/// A `Write` adapter over a positional file handle that tracks its own write offset.
#[derive(Debug)]
pub struct Cursor<'a, T> {
    file: &'a T,
    offset: u64,
    count: u64,
}

impl<T> Cursor<'_, T> {
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<T: FileExt> Write for Cursor<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.file.write_at(buf, self.offset + self.count)?;
        self.count += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
