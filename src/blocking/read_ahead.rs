use std::cmp;
use std::io::{self, Read};
use std::net::TcpStream;

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

const DEFAULT_CAPACITY: usize = 8192;

/// Number of bytes that can be read from a stream without blocking.
///
/// This is advisory only; it is used to decide whether an opportunistic
/// read would block, never to size a read.
pub trait Available {
    fn available(&self) -> io::Result<usize>;
}

#[cfg(unix)]
fn ioctl_available(fd: RawFd) -> io::Result<usize> {
    let mut len: libc::c_int = 0;

    // SAFETY: FIONREAD writes a c_int readable-byte count into `len`
    if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut len) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(len as usize)
}

impl Available for TcpStream {
    fn available(&self) -> io::Result<usize> {
        #[cfg(unix)]
        {
            ioctl_available(self.as_raw_fd())
        }

        #[cfg(not(unix))]
        {
            Ok(0)
        }
    }
}

#[cfg(unix)]
impl Available for std::os::unix::net::UnixStream {
    fn available(&self) -> io::Result<usize> {
        ioctl_available(self.as_raw_fd())
    }
}

/// A buffered reader that fills opportunistically: each refill takes as much
/// as one read of the underlying stream delivers, and once at least one byte
/// has been handed to the caller it never blocks for more.
///
/// Reads at least as large as the internal buffer bypass it entirely.
pub struct ReadAheadBuffer<S> {
    inner: S,
    buf: Box<[u8]>,
    pos: usize,
    end: usize,
}

impl<S> ReadAheadBuffer<S>
where
    S: Read + Available,
{
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        assert!(capacity > 0, "read-ahead capacity must be non-zero");

        Self {
            inner,
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            end: 0,
        }
    }

    /// Bytes currently sitting in the buffer.
    pub fn buffered(&self) -> usize {
        self.end - self.pos
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Discard the buffer and return the underlying stream. Any buffered
    /// bytes are lost.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Block until at least `min` fresh bytes are buffered, then top up
    /// with whatever else can be read without blocking.
    ///
    /// Anything still sitting in the buffer is discarded first; callers
    /// refill only after consuming what an earlier fill delivered. `min`
    /// is capped at the buffer capacity.
    pub fn fill(&mut self, min: usize) -> io::Result<()> {
        let min = cmp::min(min, self.buf.len());

        self.pos = 0;
        self.end = 0;

        while self.buffered() < min {
            let n = self.inner.read(&mut self.buf[self.end..])?;

            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.end += n;
        }

        if self.end < self.buf.len() && self.inner.available()? > 0 {
            self.end += self.inner.read(&mut self.buf[self.end..])?;
        }

        Ok(())
    }

    fn take_buffered(&mut self, out: &mut [u8]) -> usize {
        let n = cmp::min(self.buffered(), out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;

        if self.pos == self.end {
            self.pos = 0;
            self.end = 0;
        }

        n
    }
}

impl<S> Read for ReadAheadBuffer<S>
where
    S: Read + Available,
{
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut copied = self.take_buffered(out);

        loop {
            if copied == out.len() {
                return Ok(copied);
            }

            // never block once something has been delivered
            if copied > 0 && self.inner.available()? == 0 {
                return Ok(copied);
            }

            let remainder = &mut out[copied..];

            if remainder.len() >= self.buf.len() {
                // large request: skip the buffer
                let n = self.inner.read(remainder)?;
                return Ok(copied + n);
            }

            let n = self.inner.read(&mut self.buf)?;

            if n == 0 {
                return Ok(copied);
            }

            self.end = n;
            copied += self.take_buffered(&mut out[copied..]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    fn settle() {
        // give the kernel a moment to make the bytes readable
        std::thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn small_reads_are_served_from_one_fill() {
        let (mut tx, rx) = pair();
        let mut reader = ReadAheadBuffer::with_capacity(rx, 64);

        tx.write_all(b"hello world").unwrap();
        settle();

        let mut out = [0u8; 5];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");

        // the remainder was buffered by the first read
        assert_eq!(reader.buffered(), 6);

        let mut out = [0u8; 6];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b" world");
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn short_read_instead_of_blocking() {
        let (mut tx, rx) = pair();
        let mut reader = ReadAheadBuffer::with_capacity(rx, 64);

        tx.write_all(b"abc").unwrap();
        settle();

        // ask for more than is pending; the read must not block
        let mut out = [0u8; 32];
        let n = reader.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"abc");
    }

    #[test]
    fn large_reads_bypass_the_buffer() {
        let (mut tx, rx) = pair();
        let mut reader = ReadAheadBuffer::with_capacity(rx, 8);

        tx.write_all(b"0123456789abcdef").unwrap();
        settle();

        let mut out = [0u8; 16];
        let n = reader.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"0123456789abcdef");
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn fill_blocks_for_the_minimum_then_tops_up() {
        let (mut tx, rx) = pair();
        let mut reader = ReadAheadBuffer::with_capacity(rx, 64);

        tx.write_all(b"0123456789").unwrap();
        settle();

        reader.fill(4).unwrap();
        assert!(reader.buffered() >= 4);

        let mut out = [0u8; 10];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"0123456789");
    }

    #[test]
    fn fill_discards_any_previously_buffered_bytes() {
        let (mut tx, rx) = pair();
        let mut reader = ReadAheadBuffer::with_capacity(rx, 64);

        tx.write_all(b"stale!").unwrap();
        settle();

        // buffer the tail of the first message
        let mut one = [0u8; 1];
        reader.read_exact(&mut one).unwrap();
        assert_eq!(reader.buffered(), 5);

        tx.write_all(b"fresh").unwrap();
        settle();

        reader.fill(5).unwrap();

        let mut out = [0u8; 5];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"fresh");
    }

    #[test]
    fn fill_reports_eof() {
        let (tx, rx) = pair();
        let mut reader = ReadAheadBuffer::with_capacity(rx, 64);
        drop(tx);

        let err = reader.fill(1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
