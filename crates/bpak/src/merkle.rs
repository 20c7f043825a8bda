//! Salted hash tree for authenticated random-access payload verification.
//!
//! The tree covers a single payload part in 4096-byte blocks. Every hash is
//! SHA-256 over the 32-byte salt followed by one block, so a block of the
//! tree holds 128 child hashes. Levels are laid out end-to-end in the tree
//! buffer, leaves first; trailing partial blocks at every level are
//! zero-padded. The root is the hash of the (single) block of the top level,
//! or of the lone data block when the payload fits in one block.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Block granularity of the tree.
pub const BLOCK_SIZE: usize = 4096;

/// Size of a single hash in the tree.
pub const HASH_SIZE: usize = 32;

/// Child hashes per tree block.
pub const FANOUT: usize = BLOCK_SIZE / HASH_SIZE;

pub type MerkleHash = [u8; HASH_SIZE];

/// Generate a random 32-byte salt.
pub fn generate_salt() -> MerkleHash {
    use rand::Rng;
    let mut salt = [0u8; HASH_SIZE];
    rand::thread_rng().fill(&mut salt[..]);
    salt
}

fn block_hash(salt: &MerkleHash, block: &[u8]) -> MerkleHash {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(block);
    hasher.finalize().into()
}

/// Number of data blocks covering a payload; an empty payload still counts
/// as one (zero) block.
pub fn block_count(payload_size: u64) -> u64 {
    payload_size.div_ceil(BLOCK_SIZE as u64).max(1)
}

/// Number of hash levels stored in the tree.
pub fn tree_levels(payload_size: u64) -> usize {
    let mut count = block_count(payload_size);
    let mut levels = 0;
    while count > 1 {
        count = count.div_ceil(FANOUT as u64);
        levels += 1;
    }
    levels
}

/// Byte size of one level's region in the tree buffer, whole blocks.
fn level_size(payload_size: u64, level: usize) -> usize {
    let mut hashes = block_count(payload_size);
    for _ in 0..level {
        hashes = hashes.div_ceil(FANOUT as u64);
    }
    hashes.div_ceil(FANOUT as u64) as usize * BLOCK_SIZE
}

fn level_offset(payload_size: u64, level: usize) -> usize {
    (0..level).map(|l| level_size(payload_size, l)).sum()
}

/// Total byte size of the tree over a payload.
pub fn tree_size(payload_size: u64) -> u64 {
    (0..tree_levels(payload_size))
        .map(|l| level_size(payload_size, l) as u64)
        .sum()
}

/// Streaming tree construction over a payload of known size.
pub struct MerkleBuilder {
    salt: MerkleHash,
    payload_size: u64,
    levels: usize,
    level_offsets: Vec<usize>,
    fill: Vec<u64>,
    tree: Vec<u8>,
    block: Vec<u8>,
    fed: u64,
    root_leaf: Option<MerkleHash>,
}

impl MerkleBuilder {
    pub fn new(payload_size: u64, salt: MerkleHash) -> Self {
        let levels = tree_levels(payload_size);
        Self {
            salt,
            payload_size,
            levels,
            level_offsets: (0..levels).map(|l| level_offset(payload_size, l)).collect(),
            fill: vec![0; levels],
            tree: vec![0; tree_size(payload_size) as usize],
            block: Vec::with_capacity(BLOCK_SIZE),
            fed: 0,
            root_leaf: None,
        }
    }

    /// Feed payload bytes in arbitrary-size chunks.
    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        if self.fed + data.len() as u64 > self.payload_size {
            return Err(Error::SizeError);
        }
        self.fed += data.len() as u64;
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block.len()).min(data.len());
            self.block.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.block.len() == BLOCK_SIZE {
                self.ingest_data_block();
            }
        }
        Ok(())
    }

    /// Flush partial blocks at every level and return the tree buffer
    /// together with the root hash. The consumed byte count must equal the
    /// declared payload size.
    pub fn finish(mut self) -> Result<(Vec<u8>, MerkleHash)> {
        if self.fed != self.payload_size {
            return Err(Error::SizeError);
        }
        if !self.block.is_empty() || self.payload_size == 0 {
            self.block.resize(BLOCK_SIZE, 0);
            self.ingest_data_block();
        }
        for level in 0..self.levels.saturating_sub(1) {
            if self.fill[level] % FANOUT as u64 != 0 {
                let partial = self.fill[level] / FANOUT as u64;
                let start = self.level_offsets[level] + partial as usize * BLOCK_SIZE;
                let parent = block_hash(&self.salt, &self.tree[start..start + BLOCK_SIZE]);
                self.push_hash(level + 1, parent);
            }
        }
        let root = if self.levels == 0 {
            self.root_leaf
                .expect("single-block payload always yields a leaf hash")
        } else {
            let top = self.level_offsets[self.levels - 1];
            block_hash(&self.salt, &self.tree[top..top + BLOCK_SIZE])
        };
        Ok((self.tree, root))
    }

    fn ingest_data_block(&mut self) {
        let hash = block_hash(&self.salt, &self.block);
        self.block.clear();
        if self.levels == 0 {
            self.root_leaf = Some(hash);
        } else {
            self.push_hash(0, hash);
        }
    }

    fn push_hash(&mut self, level: usize, hash: MerkleHash) {
        let position = self.level_offsets[level] + self.fill[level] as usize * HASH_SIZE;
        self.tree[position..position + HASH_SIZE].copy_from_slice(&hash);
        self.fill[level] += 1;
        if self.fill[level] % FANOUT as u64 == 0 && level + 1 < self.levels {
            let completed = self.fill[level] / FANOUT as u64 - 1;
            let start = self.level_offsets[level] + completed as usize * BLOCK_SIZE;
            let parent = block_hash(&self.salt, &self.tree[start..start + BLOCK_SIZE]);
            self.push_hash(level + 1, parent);
        }
    }
}

/// Verify a single data block against the tree and root hash by walking its
/// sibling path. `block` may be shorter than a full block for the payload
/// tail; it is zero-padded like during construction.
pub fn verify_block(
    tree: &[u8],
    salt: &MerkleHash,
    root: &MerkleHash,
    payload_size: u64,
    block_index: u64,
    block: &[u8],
) -> Result<()> {
    if tree.len() as u64 != tree_size(payload_size) || block.len() > BLOCK_SIZE {
        return Err(Error::SizeError);
    }
    if block_index >= block_count(payload_size) {
        return Err(Error::InvalidArgument("block index out of range"));
    }
    let mut padded = [0u8; BLOCK_SIZE];
    padded[..block.len()].copy_from_slice(block);
    let mut hash = block_hash(salt, &padded);
    let mut index = block_index as usize;
    for level in 0..tree_levels(payload_size) {
        let base = level_offset(payload_size, level);
        let slot = base + index * HASH_SIZE;
        if tree[slot..slot + HASH_SIZE] != hash {
            return Err(Error::PayloadHashMismatch);
        }
        let parent = index / FANOUT;
        let start = base + parent * BLOCK_SIZE;
        hash = block_hash(salt, &tree[start..start + BLOCK_SIZE]);
        index = parent;
    }
    if hash != *root {
        return Err(Error::PayloadHashMismatch);
    }
    Ok(())
}
