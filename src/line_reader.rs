use memchr::memchr;
use tokio::io::AsyncReadExt;

use crate::util::allocate_vec;

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Buffered reader for line- and frame-oriented proxy handshakes. Bytes read
/// past what the protocol consumed stay available through `unparsed_data`.
pub struct LineReader {
    buf: Box<[u8]>,
    start_offset: usize,
    end_offset: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self::new_with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn new_with_buffer_size(buffer_size: usize) -> Self {
        // `buffer_size` is also the maximum line length that can be read.
        Self {
            buf: allocate_vec(buffer_size).into_boxed_slice(),
            start_offset: 0usize,
            end_offset: 0usize,
        }
    }

    fn reset_buf_offset(&mut self) {
        if self.start_offset == 0 {
            return;
        }
        self.buf.copy_within(self.start_offset..self.end_offset, 0);
        self.end_offset -= self.start_offset;
        self.start_offset = 0;
    }

    fn consume(&mut self, len: usize) {
        let new_start_offset = self.start_offset + len;
        if new_start_offset == self.end_offset {
            self.start_offset = 0;
            self.end_offset = 0;
        } else {
            self.start_offset = new_start_offset;
        }
    }

    pub async fn read_line<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<&str> {
        loop {
            match memchr(b'\n', &self.buf[self.start_offset..self.end_offset]) {
                Some(pos) => {
                    let newline_pos = self.start_offset + pos;
                    let line_end = if newline_pos > 0 && self.buf[newline_pos - 1] == b'\r' {
                        newline_pos - 1
                    } else {
                        newline_pos
                    };
                    let line_range = self.start_offset..line_end;
                    self.consume(newline_pos + 1 - self.start_offset);
                    let line_start = line_range.start;
                    return std::str::from_utf8(&self.buf[line_range]).map_err(|e| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "Failed to decode line at offset {line_start}: {e}"
                            ),
                        )
                    });
                }
                None => {
                    self.fill(stream).await?;
                }
            }
        }
    }

    pub async fn read_u8<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<u8> {
        while self.end_offset - self.start_offset < 1 {
            self.fill(stream).await?;
        }
        let value = self.buf[self.start_offset];
        self.consume(1);
        Ok(value)
    }

    pub async fn read_u16_be<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<u16> {
        while self.end_offset - self.start_offset < 2 {
            self.fill(stream).await?;
        }
        let value =
            u16::from_be_bytes([self.buf[self.start_offset], self.buf[self.start_offset + 1]]);
        self.consume(2);
        Ok(value)
    }

    pub async fn read_slice<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
        len: usize,
    ) -> std::io::Result<&[u8]> {
        if len > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "Requested length {} exceeds buffer size {}",
                    len,
                    self.buf.len()
                ),
            ));
        }
        while self.end_offset - self.start_offset < len {
            self.fill(stream).await?;
        }
        let slice_start = self.start_offset;
        self.consume(len);
        Ok(&self.buf[slice_start..slice_start + len])
    }

    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.start_offset..self.end_offset]
    }

    async fn fill<T: AsyncReadExt + Unpin>(&mut self, stream: &mut T) -> std::io::Result<()> {
        if self.start_offset == 0 && self.end_offset == self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "read buffer is full",
            ));
        }

        self.reset_buf_offset();

        loop {
            match stream.read(&mut self.buf[self.end_offset..]).await {
                Ok(len) => {
                    if len == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionAborted,
                            "EOF while reading",
                        ));
                    }
                    self.end_offset += len;
                    return Ok(());
                }
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}
