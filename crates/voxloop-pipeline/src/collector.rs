use voxloop_core::error::{PipelineError, Result};

/// Accumulates raw audio chunks until a round is finalized.
#[derive(Debug, Default)]
pub struct ChunkCollector {
    buffer: Vec<u8>,
    limit: Option<usize>,
}

impl ChunkCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Append a non-empty chunk and return the new buffered length.
    ///
    /// A chunk that would push the buffer past the limit is rejected whole.
    pub fn append(&mut self, chunk: &[u8]) -> Result<usize> {
        if chunk.is_empty() {
            return Err(PipelineError::EmptyChunk);
        }
        if let Some(limit) = self.limit {
            if self.buffer.len().saturating_add(chunk.len()) > limit {
                return Err(PipelineError::BufferFull { limit });
            }
        }
        self.buffer.extend_from_slice(chunk);
        Ok(self.buffer.len())
    }

    /// Take the whole buffer, leaving it empty. Fails without side effects
    /// when nothing was appended since the last finalize.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        if self.buffer.is_empty() {
            return Err(PipelineError::EmptyBuffer);
        }
        Ok(std::mem::take(&mut self.buffer))
    }

    /// Put a finalized buffer back in front of anything appended since.
    pub fn restore(&mut self, mut buffer: Vec<u8>) {
        buffer.append(&mut self.buffer);
        self.buffer = buffer;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
