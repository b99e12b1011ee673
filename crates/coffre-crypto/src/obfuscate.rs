//! Small-file length obfuscation
//!
//! Tiny files would otherwise leak their exact size through the ciphertext
//! length. The reader pads short inputs up to a fixed threshold with random
//! bytes; the true length travels inside the encrypted header, and the writer
//! on the decrypting side trims the padding back off.

use std::io::{self, Read, Write};

/// Inputs shorter than this many bytes are padded up to it.
pub const OBFUSCATION_THRESHOLD: u64 = 4096;

/// Wraps a plaintext input and appends padding once the input is exhausted.
pub struct LengthObfuscatingReader<R> {
    inner: R,
    pad: [u8; 16],
    real_len: u64,
    padded: u64,
    eof: bool,
}

impl<R: Read> LengthObfuscatingReader<R> {
    /// `pad` should be freshly drawn random bytes; it is repeated to fill the
    /// padding tail.
    pub fn new(inner: R, pad: [u8; 16]) -> Self {
        Self {
            inner,
            pad,
            real_len: 0,
            padded: 0,
            eof: false,
        }
    }

    /// True input length; meaningful once the reader has returned EOF.
    pub fn real_input_length(&self) -> u64 {
        self.real_len
    }
}

impl<R: Read> Read for LengthObfuscatingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.eof {
            let n = self.inner.read(buf)?;
            if n > 0 {
                self.real_len += n as u64;
                return Ok(n);
            }
            self.eof = true;
        }

        let missing = OBFUSCATION_THRESHOLD.saturating_sub(self.real_len + self.padded);
        if missing == 0 {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(missing) as usize;
        for (i, byte) in buf[..n].iter_mut().enumerate() {
            *byte = self.pad[(self.padded as usize + i) % self.pad.len()];
        }
        self.padded += n as u64;
        Ok(n)
    }
}

/// Forwards at most `limit` bytes and silently discards the rest.
pub struct LengthLimitingWriter<W> {
    inner: W,
    remaining: u64,
    written: u64,
}

impl<W: Write> LengthLimitingWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            written: 0,
        }
    }

    /// Bytes actually delivered to the wrapped writer.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl<W: Write> Write for LengthLimitingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let take = (buf.len() as u64).min(self.remaining) as usize;
        if take > 0 {
            self.inner.write_all(&buf[..take])?;
            self.remaining -= take as u64;
            self.written += take as u64;
        }
        // report the padding tail as consumed so callers never see a short write
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<R: Read>(mut reader: R) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_short_input_is_padded_to_threshold() {
        let input = b"tiny";
        let mut reader = LengthObfuscatingReader::new(&input[..], [0xAB; 16]);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out.len() as u64, OBFUSCATION_THRESHOLD);
        assert_eq!(&out[..4], b"tiny");
        assert!(out[4..].iter().all(|&b| b == 0xAB));
        assert_eq!(reader.real_input_length(), 4);
    }

    #[test]
    fn test_empty_input_is_all_padding() {
        let mut reader = LengthObfuscatingReader::new(&b""[..], [0x01; 16]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out.len() as u64, OBFUSCATION_THRESHOLD);
        assert_eq!(reader.real_input_length(), 0);
    }

    #[test]
    fn test_threshold_sized_input_is_untouched() {
        let input = vec![7u8; OBFUSCATION_THRESHOLD as usize];
        let mut reader = LengthObfuscatingReader::new(&input[..], [0xFF; 16]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, input);
        assert_eq!(reader.real_input_length(), OBFUSCATION_THRESHOLD);
    }

    #[test]
    fn test_large_input_is_untouched() {
        let input: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let mut reader = LengthObfuscatingReader::new(&input[..], [0xFF; 16]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, input);
        assert_eq!(reader.real_input_length(), 10_000);
    }

    #[test]
    fn test_pad_repeats_cyclically() {
        let mut pad = [0u8; 16];
        for (i, b) in pad.iter_mut().enumerate() {
            *b = i as u8;
        }
        let reader = LengthObfuscatingReader::new(&b""[..], pad);
        let out = drain(reader);

        for (i, &b) in out.iter().enumerate() {
            assert_eq!(b, (i % 16) as u8);
        }
    }

    #[test]
    fn test_limiting_writer_trims_padding() {
        let mut sink = Vec::new();
        let mut writer = LengthLimitingWriter::new(&mut sink, 5);

        writer.write_all(b"hello world").unwrap();
        writer.write_all(b"more padding").unwrap();
        writer.flush().unwrap();

        assert_eq!(writer.bytes_written(), 5);
        assert_eq!(sink, b"hello");
    }

    #[test]
    fn test_limiting_writer_across_writes() {
        let mut sink = Vec::new();
        let mut writer = LengthLimitingWriter::new(&mut sink, 8);

        writer.write_all(b"abcd").unwrap();
        writer.write_all(b"efgh").unwrap();
        writer.write_all(b"ijkl").unwrap();

        assert_eq!(writer.bytes_written(), 8);
        assert_eq!(sink, b"abcdefgh");
    }
}
