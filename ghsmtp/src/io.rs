//! Socket I/O (spec §4.E): deadline-bounded, blocking reads/writes over a
//! single file descriptor, with line buffering above. No async runtime —
//! deadlines are implemented with `set_read_timeout`/`set_write_timeout`
//! (spec §5's "single-threaded, synchronous... blocking-with-deadline").

use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// Any stream whose underlying socket deadline can be adjusted per call.
/// Implemented for plain TCP and for the TLS wrapper in `tls.rs`.
pub trait TimeoutStream: Read + Write {
    fn set_timeouts(&self, dur: Duration) -> std::io::Result<()>;
    fn peek(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl TimeoutStream for TcpStream {
    fn set_timeouts(&self, dur: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(dur))?;
        self.set_write_timeout(Some(dur))
    }
    fn peek(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        TcpStream::peek(self, buf)
    }
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let now = Instant::now();
    if deadline <= now {
        Err(Error::IoTimeout)
    } else {
        Ok(deadline - now)
    }
}

fn classify_io_err(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::IoTimeout,
        _ => Error::Io(e),
    }
}

/// `read(buf, deadline) -> n | Timeout | Eof`.
pub fn read_deadline<S: TimeoutStream>(stream: &mut S, buf: &mut [u8], deadline: Instant) -> Result<usize> {
    let dur = remaining(deadline)?;
    stream.set_timeouts(dur).map_err(Error::Io)?;
    match stream.read(buf) {
        Ok(0) => Err(Error::IoEof),
        Ok(n) => Ok(n),
        Err(e) => Err(classify_io_err(e)),
    }
}

/// `write(buf, deadline) -> n | Timeout`.
pub fn write_deadline<S: TimeoutStream>(stream: &mut S, buf: &[u8], deadline: Instant) -> Result<()> {
    let dur = remaining(deadline)?;
    stream.set_timeouts(dur).map_err(Error::Io)?;
    stream.write_all(buf).map_err(classify_io_err)
}

/// `input_ready(wait_ms) -> bool`: used for pre-greeting traffic detection
/// (spec §4.J banner behavior) and the STARTTLS handshake wait.
pub fn input_ready<S: TimeoutStream>(stream: &S, wait: Duration) -> bool {
    if stream.set_timeouts(wait).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe) {
        Ok(n) => n > 0,
        Err(_) => false,
    }
}

/// Buffered line reader enforcing both an absolute line-length cap (spec
/// §6: 998 octets excluding CRLF, accepted leniently up to a configured
/// cap) and a total-bytes-read cap (`read_limit`, spec §4.J).
pub struct LineReader<S> {
    stream: S,
    buf: Vec<u8>,
    max_line: usize,
    read_limit: usize,
    total_read: usize,
}

pub enum Line {
    /// `bare_lf` is `true` when the terminator was a lone `\n`, not `\r\n`
    /// (RFC 5321 §2.3.8 requires the latter; callers decide whether to
    /// reject the former as a protocol error).
    Ok { bytes: Vec<u8>, bare_lf: bool },
    TooLong,
    LimitExceeded,
}

impl<S: TimeoutStream> LineReader<S> {
    pub fn new(stream: S, max_line: usize, read_limit: usize) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            max_line,
            read_limit,
            total_read: 0,
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Reads up to and including the next `\n`, returning the line without
    /// its terminator. A bare `\n` not preceded by `\r` is still returned
    /// (callers decide whether that's a `bare_lf` protocol error).
    pub fn read_line(&mut self, deadline: Instant) -> Result<Line> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop(); // '\n'
                let bare_lf = line.last() != Some(&b'\r');
                if !bare_lf {
                    line.pop();
                }
                if line.len() > self.max_line {
                    return Ok(Line::TooLong);
                }
                return Ok(Line::Ok { bytes: line, bare_lf });
            }

            if self.total_read >= self.read_limit {
                return Ok(Line::LimitExceeded);
            }

            let mut chunk = [0u8; 4096];
            let n = read_deadline(&mut self.stream, &mut chunk, deadline)?;
            self.total_read += n;
            self.buf.extend_from_slice(&chunk[..n]);

            if self.buf.len() > self.max_line * 4 {
                return Ok(Line::TooLong);
            }
        }
    }

    /// Reads exactly `n` raw octets (used by BDAT, spec §4.J), regardless
    /// of whether the caller intends to keep them.
    pub fn read_exact_n(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if !self.buf.is_empty() {
                let take = (n - out.len()).min(self.buf.len());
                out.extend(self.buf.drain(..take));
                continue;
            }
            if self.total_read >= self.read_limit {
                return Err(Error::Size("read_limit exceeded".into()));
            }
            let mut chunk = [0u8; 8192];
            let got = read_deadline(&mut self.stream, &mut chunk, deadline)?;
            self.total_read += got;
            self.buf.extend_from_slice(&chunk[..got]);
        }
        Ok(out)
    }

    pub fn write_all(&mut self, buf: &[u8], deadline: Instant) -> Result<()> {
        write_deadline(&mut self.stream, buf, deadline)
    }

    pub fn input_ready(&self, wait: Duration) -> bool {
        input_ready(&self.stream, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct MockStream(Cursor<Vec<u8>>);
    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }
    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    impl TimeoutStream for MockStream {
        fn set_timeouts(&self, _dur: Duration) -> std::io::Result<()> {
            Ok(())
        }
        fn peek(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn reads_crlf_terminated_lines() {
        let data = b"EHLO example.com\r\nMAIL FROM:<a@b.c>\r\n".to_vec();
        let mut reader = LineReader::new(MockStream(Cursor::new(data)), 998, 1_000_000);
        let deadline = Instant::now() + Duration::from_secs(1);
        match reader.read_line(deadline).unwrap() {
            Line::Ok { bytes, bare_lf } => {
                assert_eq!(bytes, b"EHLO example.com");
                assert!(!bare_lf);
            }
            _ => panic!("expected line"),
        }
        match reader.read_line(deadline).unwrap() {
            Line::Ok { bytes, bare_lf } => {
                assert_eq!(bytes, b"MAIL FROM:<a@b.c>");
                assert!(!bare_lf);
            }
            _ => panic!("expected line"),
        }
    }

    #[test]
    fn detects_bare_lf_terminator() {
        let data = b"RCPT TO:<a@b.c>\n".to_vec();
        let mut reader = LineReader::new(MockStream(Cursor::new(data)), 998, 1_000_000);
        let deadline = Instant::now() + Duration::from_secs(1);
        match reader.read_line(deadline).unwrap() {
            Line::Ok { bytes, bare_lf } => {
                assert_eq!(bytes, b"RCPT TO:<a@b.c>");
                assert!(bare_lf);
            }
            _ => panic!("expected line"),
        }
    }

    #[test]
    fn enforces_read_limit() {
        let data = vec![b'a'; 100];
        let mut reader = LineReader::new(MockStream(Cursor::new(data)), 998, 10);
        let deadline = Instant::now() + Duration::from_secs(1);
        match reader.read_line(deadline).unwrap() {
            Line::LimitExceeded => {}
            _ => panic!("expected limit exceeded"),
        }
    }

    #[test]
    fn reads_exact_chunk() {
        let data = b"Hello, mom.\n".to_vec();
        let mut reader = LineReader::new(MockStream(Cursor::new(data)), 998, 1_000_000);
        let deadline = Instant::now() + Duration::from_secs(1);
        let chunk = reader.read_exact_n(5, deadline).unwrap();
        assert_eq!(chunk, b"Hello");
    }
}
