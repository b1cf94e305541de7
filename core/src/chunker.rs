use bytes::Bytes;
use fastcdc::v2020::FastCDC;

/// Content-defined chunking: identical input bytes always cut at the same
/// boundaries, so shared content hashes to the same chunk objects.
pub struct Chunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

pub const DEFAULT_AVG_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

impl Chunker {
    pub fn new(avg_size: u32) -> Self {
        Self {
            min_size: avg_size / 4,
            avg_size,
            max_size: avg_size * 4,
        }
    }

    pub fn chunk_data(&self, data: &Bytes) -> Vec<Chunk> {
        let chunker = FastCDC::new(data, self.min_size, self.avg_size, self.max_size);
        chunker
            .map(|chunk| Chunk {
                offset: chunk.offset as u64,
                data: data.slice(chunk.offset..chunk.offset + chunk.length),
            })
            .collect()
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_AVG_CHUNK_SIZE)
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
