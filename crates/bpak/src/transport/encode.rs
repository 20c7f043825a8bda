//! Transport encode: stream each part through its emitter into a smaller
//! on-the-wire archive.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, info};

use crate::compression::{ByteProcessor, XzEncoder};
use crate::error::{Error, Result};
use crate::header::{HeaderLocation, PartHeader, FLAG_TRANSPORT, HEADER_SIZE, PAYLOAD_HASH_SIZE};
use crate::meta;
use crate::package::{payload_hash_over, Package};

use super::{next_aligned, Algorithm, CountingWriter, TransportMeta};

const COMPRESSION_LEVEL: u8 = 6;

/// Re-encode `input` into a transport archive at `output_path`.
///
/// The output header mirrors the input with each encoded part's
/// `transport_size` and `TRANSPORT` flag set and part offsets rewritten to
/// the alignment-rounded cumulative layout of the encoded bodies. The
/// payload hash is recomputed over the encoded archive; the carried
/// signature only becomes valid again after re-signing.
pub fn encode(input: &mut Package, output_path: &Path, mut origin: Option<&mut Package>) -> Result<()> {
    let in_header = input.header().clone();
    let mut out_header = in_header.clone();
    let mut out_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output_path)
        .map_err(Error::WriteError)?;

    let alignment = in_header.alignment as u64;
    let mut cursor = HEADER_SIZE as u64;
    let parts: Vec<PartHeader> = in_header.parts().copied().collect();
    for part in &parts {
        let selection = match in_header.get_meta(meta::transport(), part.id) {
            Ok(bytes) => Some(TransportMeta::from_bytes(bytes)?),
            Err(Error::NotFound) => None,
            Err(err) => return Err(err),
        };
        out_file
            .seek(SeekFrom::Start(cursor))
            .map_err(Error::SeekError)?;
        let written = match selection {
            None => copy_part(input, part, &mut out_file)?,
            Some(selection) => {
                let algorithm = Algorithm::from_wire_id(selection.encode_id)?;
                debug!("encoding part 0x{:08x} with {}", part.id, algorithm.name());
                match algorithm {
                    Algorithm::Heatshrink => compress_part(input, part, &mut out_file)?,
                    Algorithm::Bsdiff => {
                        let origin = origin.as_deref_mut().ok_or_else(|| {
                            Error::Failed("delta encoding requires an origin archive".into())
                        })?;
                        diff_part(input, origin, part, &mut out_file)?
                    }
                    Algorithm::RemoveData => 0,
                    Algorithm::MerkleGenerate => {
                        return Err(Error::Failed(
                            "tree generation only applies to decoding".into(),
                        ))
                    }
                }
            }
        };
        let out_part = out_header.get_part_mut(part.id)?;
        out_part.offset = cursor;
        if selection.is_some() {
            out_part.transport_size = written;
            out_part.flags |= FLAG_TRANSPORT;
        }
        cursor = next_aligned(cursor + written, alignment);
    }

    let digest = payload_hash_over(&mut out_file, &out_header)?;
    out_header.payload_hash = [0; PAYLOAD_HASH_SIZE];
    out_header.payload_hash[..digest.len()].copy_from_slice(&digest);
    out_header.write_back(&mut out_file, HeaderLocation::Front)?;
    info!(
        "transport encoded {} -> {} ({} -> {} payload bytes)",
        input.path().display(),
        output_path.display(),
        in_header.on_disk_payload_size(),
        out_header.on_disk_payload_size(),
    );
    Ok(())
}

fn copy_part(input: &mut Package, part: &PartHeader, out_file: &mut File) -> Result<u64> {
    let mut writer = CountingWriter::new(out_file);
    let mut identity = crate::compression::Identity;
    stream_part(input, part, &mut identity, &mut writer)?;
    Ok(writer.written)
}

fn compress_part(input: &mut Package, part: &PartHeader, out_file: &mut File) -> Result<u64> {
    let mut writer = CountingWriter::new(out_file);
    let mut encoder = XzEncoder::new(COMPRESSION_LEVEL);
    stream_part(input, part, &mut encoder, &mut writer)?;
    Ok(writer.written)
}

fn diff_part(
    input: &mut Package,
    origin: &mut Package,
    part: &PartHeader,
    out_file: &mut File,
) -> Result<u64> {
    let origin_part = *origin.header().get_part(part.id)?;
    if origin_part.is_transport_encoded() {
        return Err(Error::Failed("origin archive is transport encoded".into()));
    }
    let old = origin.read_part(&origin_part)?;
    let new = input.read_part(part)?;
    let mut patch = Vec::new();
    bsdiff::diff(&old, &new, &mut patch)
        .map_err(|err| Error::Failed(format!("delta computation failed: {err}")))?;
    debug!(
        "part 0x{:08x}: {} byte delta over {} origin bytes",
        part.id,
        patch.len(),
        old.len()
    );
    // The raw patch compresses well; pipe it through the compressor like
    // any other transport stream.
    let mut writer = CountingWriter::new(out_file);
    let mut encoder = XzEncoder::new(COMPRESSION_LEVEL);
    encoder
        .process(&patch, &mut writer)
        .map_err(Error::WriteError)?;
    encoder.finalize(&mut writer).map_err(Error::WriteError)?;
    Ok(writer.written)
}

fn stream_part(
    input: &mut Package,
    part: &PartHeader,
    processor: &mut dyn ByteProcessor,
    writer: &mut CountingWriter<'_, File>,
) -> Result<()> {
    use std::io::Read;

    input
        .file()
        .seek(SeekFrom::Start(part.offset))
        .map_err(Error::SeekError)?;
    let mut buffer = [0u8; 4096];
    let mut remaining = part.on_disk_size();
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        input
            .file()
            .read_exact(&mut buffer[..chunk])
            .map_err(Error::ReadError)?;
        processor
            .process(&buffer[..chunk], writer)
            .map_err(Error::WriteError)?;
        remaining -= chunk as u64;
    }
    processor.finalize(writer).map_err(Error::WriteError)
}
