// Splits raw sandbox output chunks into lines, per stream

use crate::runtime::OutputChunk;
use scriptbox_common::types::LogStream;

/// Longer runs without a newline are emitted as several lines
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct LineBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the lines it completed
    pub fn push(&mut self, chunk: &OutputChunk) -> Vec<(LogStream, String)> {
        let buf = match chunk.stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        };
        buf.extend_from_slice(&chunk.bytes);

        let mut lines = Vec::new();
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buf.drain(..=pos).collect();
            lines.push((chunk.stream, decode_line(&raw[..raw.len() - 1])));
        }
        while buf.len() >= MAX_LINE_BYTES {
            let raw: Vec<u8> = buf.drain(..MAX_LINE_BYTES).collect();
            lines.push((chunk.stream, decode_line(&raw)));
        }
        lines
    }

    /// Emit whatever is left without a trailing newline
    pub fn flush(&mut self) -> Vec<(LogStream, String)> {
        let mut lines = Vec::new();
        for (stream, buf) in [
            (LogStream::Stdout, &mut self.stdout),
            (LogStream::Stderr, &mut self.stderr),
        ] {
            if !buf.is_empty() {
                lines.push((stream, decode_line(buf)));
                buf.clear();
            }
        }
        lines
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

/// Split a complete set of chunks into lines
pub fn split_chunks(chunks: &[OutputChunk]) -> Vec<(LogStream, String)> {
    let mut buffer = LineBuffer::new();
    let mut lines = Vec::new();
    for chunk in chunks {
        lines.extend(buffer.push(chunk));
    }
    lines.extend(buffer.flush());
    lines
}
