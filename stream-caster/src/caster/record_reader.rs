//! Bounded record reader for process diagnostic streams.
//!
//! FFmpeg rewrites its stats line with carriage returns (`\r`), so records are
//! delimited by either `\n` or `\r`. Only the first `max_len` bytes of a record
//! are kept; the rest is skipped until the next delimiter.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Default upper bound for a single record in bytes.
pub const DEFAULT_MAX_RECORD_LEN: usize = 8 * 1024;

/// Yields trimmed, non-empty text records from an async byte stream.
pub struct RecordReader<R> {
    reader: BufReader<R>,
    record: Vec<u8>,
    max_len: usize,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, DEFAULT_MAX_RECORD_LEN)
    }

    pub fn with_max_len(reader: R, max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            reader: BufReader::new(reader),
            record: Vec::with_capacity(max_len.min(DEFAULT_MAX_RECORD_LEN)),
            max_len,
        }
    }

    /// Next record, or `None` once the stream is closed.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                let tail = std::mem::take(&mut self.record);
                return Ok(decode(&tail));
            }

            let (used, complete) = match chunk.iter().position(|&b| is_delimiter(b)) {
                Some(end) => {
                    push_capped(&mut self.record, self.max_len, &chunk[..end]);
                    (end + 1, true)
                }
                None => {
                    push_capped(&mut self.record, self.max_len, chunk);
                    (chunk.len(), false)
                }
            };
            self.reader.consume(used);

            if complete {
                let bytes = std::mem::take(&mut self.record);
                if let Some(record) = decode(&bytes) {
                    return Ok(Some(record));
                }
            }
        }
    }
}

fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b'\n' | b'\r')
}

fn push_capped(record: &mut Vec<u8>, max_len: usize, bytes: &[u8]) {
    let room = max_len.saturating_sub(record.len());
    record.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

fn decode(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
