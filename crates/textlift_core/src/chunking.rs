//! crates/textlift_core/src/chunking.rs
//!
//! Line-aligned chunking of extracted text into bounded extraction requests.

/// Target chunk size in bytes for one extraction request.
pub const CHUNK_TARGET_BYTES: usize = 12 * 1024;

/// Packs lines into chunks close to a target size.
///
/// Lines are pushed with their terminators. The buffer is flushed *before*
/// a line that would push it past the target, so boundaries always fall on
/// line ends and a single overlong line becomes a chunk of its own.
#[derive(Debug)]
pub struct ChunkAccumulator {
    target: usize,
    buffer: String,
}

impl ChunkAccumulator {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            buffer: String::with_capacity(target),
        }
    }

    /// Appends one line, returning the chunk flushed to make room for it.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let flushed = if !self.buffer.is_empty() && self.buffer.len() + line.len() > self.target {
            Some(std::mem::replace(&mut self.buffer, String::with_capacity(self.target)))
        } else {
            None
        };
        self.buffer.push_str(line);
        flushed
    }

    /// Flushes whatever remains after the last line.
    pub fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }
}

/// Chunks an in-memory text; concatenating the result reproduces `text`.
pub fn chunk_text(text: &str, target: usize) -> Vec<String> {
    let mut acc = ChunkAccumulator::new(target);
    let mut chunks: Vec<String> = text.split_inclusive('\n').filter_map(|line| acc.push_line(line)).collect();
    chunks.extend(acc.finish());
    chunks
}
