//! Fixed-size character windows with overlap

use uuid::Uuid;

use crate::types::Chunk;

/// Text chunker with configurable size and overlap
#[derive(Debug, Clone)]
pub struct TextChunker {
    /// Window size in characters
    chunk_size: usize,
    /// Characters shared by consecutive windows
    overlap: usize,
}

impl TextChunker {
    /// Create a new chunker. `overlap` is clamped below `chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }

    /// Number of chunks produced for a text of `len` characters
    pub fn expected_count(&self, len: usize) -> usize {
        if len <= self.overlap {
            return 1;
        }
        (len - self.overlap).div_ceil(self.step())
    }

    /// Split `text` into ordered, overlapping chunks of `document_id`
    ///
    /// Offsets are in characters, not bytes. Every chunk except the last is exactly
    /// `chunk_size` characters long.
    pub fn chunk(&self, document_id: Uuid, text: &str) -> Vec<Chunk> {
        // byte offset of every char boundary, including the end
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let len = boundaries.len() - 1;

        let mut chunks = Vec::with_capacity(self.expected_count(len));
        let mut start = 0usize;

        loop {
            let end = (start + self.chunk_size).min(len);
            let index = chunks.len();
            chunks.push(Chunk {
                id: Chunk::chunk_id(document_id, index),
                document_id,
                index,
                char_start: start,
                char_end: end,
                overlap: if index == 0 { 0 } else { self.overlap },
                content: text[boundaries[start]..boundaries[end]].to_string(),
            });

            if end >= len {
                break;
            }
            start += self.step();
        }

        chunks
    }
}
