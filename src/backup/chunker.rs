//! The chunker / splitter.
//!
//! A [`Chunker`] is a pure byte-stream acceptor: feed it bytes with
//! [`Chunker::scan`] and it returns the boundary offset within the given
//! slice, or `0` if no boundary falls inside it yet.

use once_cell::sync::Lazy;

/// Selects how an [`ObjectWriter`](crate::backup::object_manager::ObjectWriter)
/// splits its input into storage blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChunkerConfig {
    /// Never split: the whole object becomes a single block.
    Never,
    /// Split every `N` bytes.
    Fixed(usize),
    /// Content-defined chunking with a rolling hash.
    Dynamic { min: usize, avg: usize, max: usize },
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig::Dynamic {
            min: 1 << 19,
            avg: 1 << 20,
            max: 1 << 21,
        }
    }
}

/// Rolling-hash window width for the dynamic splitter.
const WINDOW: usize = 64;

static BUZHASH_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    // Deterministic xorshift-seeded table. The table must be identical
    // across repository instances of this implementation, not
    // cryptographically strong — it only needs to scatter boundaries.
    let mut table = [0u32; 256];
    let mut state: u32 = 0x9E3779B9;
    for slot in table.iter_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *slot = state;
    }
    table
});

fn rotl(x: u32, n: u32) -> u32 {
    x.rotate_left(n % 32)
}

/// Mask with `ceil(log2(avg))` low bits set.
fn boundary_mask(avg: usize) -> u32 {
    let bits = if avg <= 1 {
        0
    } else {
        (usize::BITS - (avg - 1).leading_zeros()) as u32
    };
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

enum ChunkerState {
    Never,
    Fixed { chunk_size: usize },
    Dynamic {
        min: usize,
        max: usize,
        mask: u32,
        hash: u32,
        window: Vec<u8>,
    },
}

/// Deterministic boundary decider; see module docs.
pub struct Chunker {
    state: ChunkerState,
    current_size: usize,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let state = match config {
            ChunkerConfig::Never => ChunkerState::Never,
            ChunkerConfig::Fixed(chunk_size) => ChunkerState::Fixed { chunk_size },
            ChunkerConfig::Dynamic { min, avg, max } => ChunkerState::Dynamic {
                min,
                max,
                mask: boundary_mask(avg),
                hash: 0,
                window: Vec::with_capacity(WINDOW),
            },
        };
        Self {
            state,
            current_size: 0,
        }
    }

    /// Scans `data`, returning the offset (1-based length into `data`) at
    /// which the current block should end, or `0` if no boundary was
    /// found within `data`. Callers feed successive slices and accumulate
    /// bytes themselves (see `ObjectWriter::write`).
    pub fn scan(&mut self, data: &[u8]) -> usize {
        match &mut self.state {
            ChunkerState::Never => 0,
            ChunkerState::Fixed { chunk_size } => {
                let remaining = *chunk_size - self.current_size;
                if remaining <= data.len() {
                    self.current_size = 0;
                    remaining
                } else {
                    self.current_size += data.len();
                    0
                }
            }
            ChunkerState::Dynamic {
                min,
                max,
                mask,
                hash,
                window,
            } => {
                let table = &*BUZHASH_TABLE;
                for (i, &byte) in data.iter().enumerate() {
                    self.current_size += 1;
                    window.push(byte);

                    *hash = rotl(*hash, 1) ^ table[byte as usize];
                    if window.len() > WINDOW {
                        let out = window.remove(0);
                        *hash ^= rotl(table[out as usize], WINDOW as u32);
                    }

                    let forced = self.current_size >= *max;
                    let content_boundary =
                        self.current_size > *min && *hash & *mask == 0 && *hash != 0;

                    if forced || content_boundary {
                        self.current_size = 0;
                        *hash = 0;
                        window.clear();
                        return i + 1;
                    }
                }
                0
            }
        }
    }
}
