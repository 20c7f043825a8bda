//! Per-part transport re-encoding.
//!
//! A transport-encoded archive keeps the framing of the original but
//! replaces individual part bodies with a compressed image or a binary
//! delta against an *origin* archive. The codec for each part is selected
//! by a `bpak-transport` meta entry scoped to the part id; parts without
//! one are copied verbatim.

use std::io::{self, Write};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::id::name_hash;

mod decode;
mod encode;

pub use decode::{decode, FileOrigin, FileSink, OriginSource, OutputSink, TransportDecoder};
pub use encode::encode;

/// Value of a `bpak-transport` meta entry: the algorithm ids used by the
/// transport emitter and applier for one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMeta {
    pub encode_id: u32,
    pub decode_id: u32,
}

impl TransportMeta {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(Error::SizeError);
        }
        let mut encode_id = [0u8; 4];
        let mut decode_id = [0u8; 4];
        encode_id.copy_from_slice(&bytes[..4]);
        decode_id.copy_from_slice(&bytes[4..]);
        Ok(Self {
            encode_id: u32::from_le_bytes(encode_id),
            decode_id: u32::from_le_bytes(decode_id),
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.encode_id.to_le_bytes());
        bytes[4..].copy_from_slice(&self.decode_id.to_le_bytes());
        bytes
    }
}

/// Transport algorithms known to the core, identified on the wire by the id
/// hash of their name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Byte-stream compression, no origin reference.
    Heatshrink,
    /// Binary delta against the same-id part in the origin archive.
    Bsdiff,
    /// Regenerate a hash-tree part from the decoded data part.
    MerkleGenerate,
    /// Emit a zero-byte body.
    RemoveData,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Heatshrink => "bpak-heatshrink",
            Algorithm::Bsdiff => "bpak-bsdiff",
            Algorithm::MerkleGenerate => "bpak-merkle-generate",
            Algorithm::RemoveData => "remove-data",
        }
    }

    pub fn wire_id(self) -> u32 {
        name_hash(self.name())
    }

    pub fn from_wire_id(value: u32) -> Result<Self> {
        [
            Algorithm::Heatshrink,
            Algorithm::Bsdiff,
            Algorithm::MerkleGenerate,
            Algorithm::RemoveData,
        ]
        .into_iter()
        .find(|algorithm| algorithm.wire_id() == value)
        .ok_or_else(|| Error::Failed(format!("unknown transport algorithm 0x{value:08x}")))
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bpak-heatshrink" | "heatshrink" => Ok(Algorithm::Heatshrink),
            "bpak-bsdiff" | "bsdiff" => Ok(Algorithm::Bsdiff),
            "bpak-merkle-generate" | "merkle-generate" => Ok(Algorithm::MerkleGenerate),
            "remove-data" => Ok(Algorithm::RemoveData),
            _ => Err(Error::InvalidArgument("unknown transport algorithm name")),
        }
    }
}

pub(crate) fn next_aligned(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}

/// Tallies the bytes passed through to an inner writer.
pub(crate) struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    pub written: u64,
}

impl<'a, W: Write> CountingWriter<'a, W> {
    pub fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(data)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::id;

    #[test]
    fn meta_value_round_trip() {
        let value = TransportMeta {
            encode_id: Algorithm::Bsdiff.wire_id(),
            decode_id: Algorithm::Heatshrink.wire_id(),
        };
        assert_eq!(TransportMeta::from_bytes(&value.to_bytes()).unwrap(), value);
        assert!(matches!(
            TransportMeta::from_bytes(&[0; 7]),
            Err(Error::SizeError)
        ));
    }

    #[test]
    fn wire_ids_match_names() {
        for algorithm in [
            Algorithm::Heatshrink,
            Algorithm::Bsdiff,
            Algorithm::MerkleGenerate,
            Algorithm::RemoveData,
        ] {
            assert_eq!(algorithm.wire_id(), id(algorithm.name()).unwrap());
            assert_eq!(Algorithm::from_wire_id(algorithm.wire_id()).unwrap(), algorithm);
        }
        assert!(Algorithm::from_wire_id(0).is_err());
    }

    #[test]
    fn alignment_rounding() {
        assert_eq!(next_aligned(4096, 4096), 4096);
        assert_eq!(next_aligned(4097, 4096), 8192);
        assert_eq!(next_aligned(0, 4096), 0);
    }
}
