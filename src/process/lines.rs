// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Line-buffered reading over raw byte sources.

use std::io::{BufRead, BufReader, Read, Result};

/// Accumulate raw bytes from a source until a newline shows up.
///
/// Lines are handed back with their trailing newline intact. A final line
/// without newline is handed back as is once the source runs dry.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R> LineReader<R>
where
    R: Read,
{
    /// Construct new line reader over byte source.
    pub fn new(source: R) -> Self {
        Self {
            inner: BufReader::new(source),
        }
    }

    /// Read next line, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// - Return I/O error of underlying source. Interrupted reads are
    ///   retried.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        match self.inner.read_until(b'\n', &mut line)? {
            0 => Ok(None),
            _ => Ok(Some(line)),
        }
    }
}

impl<R> Iterator for LineReader<R>
where
    R: Read,
{
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_line().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Error, ErrorKind};

    // Hands out its data a few bytes at a time, with an interruption in
    // between, like a slow terminal would.
    struct Trickle {
        chunks: Vec<Vec<u8>>,
        interrupted: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(Error::from(ErrorKind::Interrupted));
            }

            if self.chunks.is_empty() {
                return Ok(0);
            }

            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn assemble_lines_from_small_chunks() -> Result<()> {
        let source = Trickle {
            chunks: vec![b"he".to_vec(), b"llo\nwor".to_vec(), b"ld\r\n".to_vec(), b"tail".to_vec()],
            interrupted: false,
        };
        let mut reader = LineReader::new(source);

        assert_eq!(reader.read_line()?, Some(b"hello\n".to_vec()));
        assert_eq!(reader.read_line()?, Some(b"world\r\n".to_vec()));
        assert_eq!(reader.read_line()?, Some(b"tail".to_vec()));
        assert_eq!(reader.read_line()?, None);
        assert_eq!(reader.read_line()?, None);

        Ok(())
    }

    #[test]
    fn iterate_over_lines() {
        let reader = LineReader::new(&b"a\n\nb\n"[..]);
        let lines: Vec<Vec<u8>> = reader.map(|line| line.unwrap_or_default()).collect();
        assert_eq!(lines, vec![b"a\n".to_vec(), b"\n".to_vec(), b"b\n".to_vec()]);
    }
}
