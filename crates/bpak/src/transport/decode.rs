//! Transport decode: reconstitute the original archive from a transport
//! rendition, part by part.
//!
//! The decoder is a chunk-driven state machine. For every part, `start`
//! resets the machine with the part header, `write_chunk` feeds the on-disk
//! bytes, and `finish` flushes trailing state. All output happens through a
//! small capability interface of offset-based random accesses into the
//! output stream, plus an optional origin reader for delta algorithms.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::compression::{ByteProcessor, XzDecoder};
use crate::error::{Error, Result};
use crate::header::{
    Header, HeaderLocation, PartHeader, FLAG_TRANSPORT, HEADER_SIZE, PAYLOAD_HASH_SIZE,
};
use crate::id::id_extend;
use crate::merkle::{self, MerkleBuilder};
use crate::meta;
use crate::package::{payload_hash_over, Package};

use super::Algorithm;

/// Random access into the output archive being reconstituted.
pub trait OutputSink {
    fn write_output(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Delta and tree algorithms read back their own partial output.
    fn read_output(&mut self, offset: u64, data: &mut [u8]) -> Result<()>;

    /// Replace the output header image; must be exactly 4096 bytes.
    fn write_output_header(&mut self, image: &[u8]) -> Result<()>;
}

/// Random access into the origin archive.
pub trait OriginSource {
    fn read_origin(&mut self, offset: u64, data: &mut [u8]) -> Result<()>;
}

/// [`OutputSink`] over a plain file.
pub struct FileSink<'a> {
    pub file: &'a mut File,
}

impl OutputSink for FileSink<'_> {
    fn write_output(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::SeekError)?;
        self.file.write_all(data).map_err(Error::WriteError)
    }

    fn read_output(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::SeekError)?;
        self.file.read_exact(data).map_err(Error::ReadError)
    }

    fn write_output_header(&mut self, image: &[u8]) -> Result<()> {
        if image.len() != HEADER_SIZE {
            return Err(Error::SizeError);
        }
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(Error::SeekError)?;
        self.file.write_all(image).map_err(Error::WriteError)
    }
}

/// [`OriginSource`] over a plain file.
pub struct FileOrigin<'a> {
    pub file: &'a mut File,
}

impl OriginSource for FileOrigin<'_> {
    fn read_origin(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::SeekError)?;
        self.file.read_exact(data).map_err(Error::ReadError)
    }
}

enum Backend {
    Copy {
        written: u64,
    },
    Decompress {
        stream: XzDecoder,
        written: u64,
    },
    /// The whole patch is accumulated before applying; the delta back-end
    /// needs it alongside the full origin part.
    Patch {
        stream: XzDecoder,
        patch: Vec<u8>,
    },
    MerkleGenerate,
}

enum State {
    Idle,
    Running { nominal: PartHeader, backend: Backend },
}

/// Per-part decode state machine.
pub struct TransportDecoder<'a> {
    out_header: Header,
    origin_header: Option<Header>,
    sink: &'a mut dyn OutputSink,
    origin: Option<&'a mut dyn OriginSource>,
    state: State,
}

impl<'a> TransportDecoder<'a> {
    /// Create a decoder reconstituting parts described by `out_header`,
    /// whose part offsets must already carry the nominal layout.
    pub fn new(out_header: Header, sink: &'a mut dyn OutputSink) -> Self {
        Self {
            out_header,
            origin_header: None,
            sink,
            origin: None,
            state: State::Idle,
        }
    }

    /// Attach the origin archive consumed by delta algorithms.
    pub fn set_origin(&mut self, header: Header, source: &'a mut dyn OriginSource) {
        self.origin_header = Some(header);
        self.origin = Some(source);
    }

    /// Reset the machine for the next part.
    pub fn start(&mut self, part: &PartHeader) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(Error::Failed("decoder is already running".into()));
        }
        let nominal = *self.out_header.get_part(part.id)?;
        let backend = match self.decode_algorithm(part.id)? {
            None => Backend::Copy { written: 0 },
            Some(Algorithm::Heatshrink) => Backend::Decompress {
                stream: XzDecoder::new(),
                written: 0,
            },
            Some(Algorithm::Bsdiff) => {
                if self.origin.is_none() {
                    return Err(Error::Failed(
                        "delta decoding requires an origin archive".into(),
                    ));
                }
                Backend::Patch {
                    stream: XzDecoder::new(),
                    patch: Vec::new(),
                }
            }
            Some(Algorithm::MerkleGenerate) => Backend::MerkleGenerate,
            Some(Algorithm::RemoveData) => {
                return Err(Error::Failed(
                    "remove-data only applies to encoding".into(),
                ))
            }
        };
        debug!("decoding part 0x{:08x}", part.id);
        self.state = State::Running { nominal, backend };
        Ok(())
    }

    /// Advance the back-end with a chunk of the part's on-disk bytes.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let State::Running { nominal, backend } = &mut self.state else {
            return Err(Error::Failed("decoder is not running".into()));
        };
        match backend {
            Backend::Copy { written } => {
                self.sink.write_output(nominal.offset + *written, data)?;
                *written += data.len() as u64;
            }
            Backend::Decompress { stream, written } => {
                let mut writer = SinkWriter {
                    sink: &mut *self.sink,
                    position: nominal.offset + *written,
                };
                stream.process(data, &mut writer).map_err(stream_error)?;
                *written = writer.position - nominal.offset;
            }
            Backend::Patch { stream, patch } => {
                stream.process(data, patch).map_err(stream_error)?;
            }
            Backend::MerkleGenerate => {
                // Tree parts carry no transport bytes.
                return Err(Error::SizeError);
            }
        }
        Ok(())
    }

    /// Flush trailing state and commit the part.
    pub fn finish(&mut self) -> Result<()> {
        let State::Running { nominal, backend } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return Err(Error::Failed("decoder is not running".into()));
        };
        match backend {
            Backend::Copy { written } => {
                if written != nominal.size {
                    return Err(Error::SizeError);
                }
            }
            Backend::Decompress { mut stream, written } => {
                let mut writer = SinkWriter {
                    sink: &mut *self.sink,
                    position: nominal.offset + written,
                };
                stream.finalize(&mut writer).map_err(stream_error)?;
                if writer.position - nominal.offset != nominal.size {
                    return Err(Error::SizeError);
                }
            }
            Backend::Patch { mut stream, mut patch } => {
                stream.finalize(&mut patch).map_err(stream_error)?;
                self.apply_patch(&nominal, &patch)?;
            }
            Backend::MerkleGenerate => self.generate_tree(&nominal)?,
        }
        let part = self.out_header.get_part_mut(nominal.id)?;
        part.flags &= !FLAG_TRANSPORT;
        part.transport_size = 0;
        Ok(())
    }

    /// The reconstituted header, once every part has finished.
    pub fn into_header(self) -> Header {
        self.out_header
    }

    fn decode_algorithm(&self, part_id: u32) -> Result<Option<Algorithm>> {
        match self.out_header.get_meta(meta::transport(), part_id) {
            Ok(bytes) => Ok(Some(Algorithm::from_wire_id(
                super::TransportMeta::from_bytes(bytes)?.decode_id,
            )?)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn apply_patch(&mut self, nominal: &PartHeader, patch: &[u8]) -> Result<()> {
        let origin_header = self
            .origin_header
            .as_ref()
            .ok_or_else(|| Error::Failed("delta decoding requires an origin archive".into()))?;
        let origin_part = *origin_header.get_part(nominal.id)?;
        if origin_part.is_transport_encoded() {
            return Err(Error::Failed("origin archive is transport encoded".into()));
        }
        let origin = self
            .origin
            .as_mut()
            .ok_or_else(|| Error::Failed("delta decoding requires an origin archive".into()))?;
        let mut old = vec![0u8; origin_part.size as usize];
        origin.read_origin(origin_part.offset, &mut old)?;
        let mut new = Vec::with_capacity(nominal.size as usize);
        bsdiff::patch(&old, &mut &patch[..], &mut new)
            .map_err(|err| Error::Failed(format!("patch application failed: {err}")))?;
        if new.len() as u64 != nominal.size {
            return Err(Error::SizeError);
        }
        self.sink.write_output(nominal.offset, &new)
    }

    /// Rebuild a hash-tree part from its already-decoded data part. The
    /// data part is found through id continuation: the tree part's id is
    /// the id of `"<data part name>-hash-tree"`.
    fn generate_tree(&mut self, tree_part: &PartHeader) -> Result<()> {
        let data_part = *self
            .out_header
            .parts()
            .find(|part| part.id != tree_part.id && id_extend(part.id, "-hash-tree") == tree_part.id)
            .ok_or(Error::NotFound)?;
        let salt: merkle::MerkleHash = self
            .out_header
            .get_meta(meta::merkle_salt(), data_part.id)?
            .try_into()
            .map_err(|_| Error::SizeError)?;

        let mut builder = MerkleBuilder::new(data_part.size, salt);
        let mut buffer = [0u8; 4096];
        let mut position = 0u64;
        while position < data_part.size {
            let chunk = (data_part.size - position).min(buffer.len() as u64) as usize;
            self.sink
                .read_output(data_part.offset + position, &mut buffer[..chunk])?;
            builder.update(&buffer[..chunk])?;
            position += chunk as u64;
        }
        let (tree, root) = builder.finish()?;
        if tree.len() as u64 != tree_part.size {
            return Err(Error::SizeError);
        }
        let stored_root = match self.out_header.get_meta(meta::merkle_root_hash(), data_part.id) {
            Ok(stored) => Some(
                merkle::MerkleHash::try_from(stored).map_err(|_| Error::SizeError)?,
            ),
            Err(Error::NotFound) => None,
            Err(err) => return Err(err),
        };
        match stored_root {
            Some(stored) => {
                if stored != root {
                    return Err(Error::PayloadHashMismatch);
                }
            }
            None => {
                // The input was stripped of the root hash; record the
                // regenerated one in the output header.
                self.out_header
                    .add_meta(meta::merkle_root_hash(), data_part.id, merkle::HASH_SIZE as u16)?
                    .copy_from_slice(&root);
                let image = self.out_header.to_bytes();
                self.sink.write_output_header(&image)?;
            }
        }
        self.sink.write_output(tree_part.offset, &tree)
    }
}

struct SinkWriter<'s> {
    sink: &'s mut dyn OutputSink,
    position: u64,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.sink
            .write_output(self.position, data)
            .map_err(io::Error::other)?;
        self.position += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Recover the crate error smuggled through the [`Write`] adapter, or wrap
/// a genuine decompression fault.
fn stream_error(err: io::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(inner) => inner,
        Err(err) => Error::Failed(format!("decode stream error: {err}")),
    }
}

/// Reconstitute `input` into a plain archive at `output_path`.
///
/// The in-memory output header is only written once every part has been
/// decoded; an aborted decode leaves no partial-part commit observable in
/// the output header.
pub fn decode(input: &mut Package, output_path: &Path, mut origin: Option<&mut Package>) -> Result<()> {
    let in_header = input.header().clone();
    let mut out_header = in_header.clone();
    let mut offset = HEADER_SIZE as u64;
    for part in out_header.parts_mut() {
        part.offset = offset;
        offset += part.size + part.pad_bytes as u64;
    }

    let mut out_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output_path)
        .map_err(Error::WriteError)?;
    {
        let mut sink = FileSink {
            file: &mut out_file,
        };
        let origin_header = origin.as_ref().map(|pkg| pkg.header().clone());
        let mut origin_source = origin.as_mut().map(|pkg| FileOrigin { file: pkg.file() });
        let mut decoder = TransportDecoder::new(out_header, &mut sink);
        if let (Some(header), Some(source)) = (origin_header, origin_source.as_mut()) {
            decoder.set_origin(header, source);
        }

        let parts: Vec<PartHeader> = in_header.parts().copied().collect();
        let mut buffer = [0u8; 4096];
        for part in &parts {
            decoder.start(part)?;
            input
                .file()
                .seek(SeekFrom::Start(part.offset))
                .map_err(Error::SeekError)?;
            let mut remaining = part.on_disk_size();
            while remaining > 0 {
                let chunk = remaining.min(buffer.len() as u64) as usize;
                input
                    .file()
                    .read_exact(&mut buffer[..chunk])
                    .map_err(Error::ReadError)?;
                decoder.write_chunk(&buffer[..chunk])?;
                remaining -= chunk as u64;
            }
            decoder.finish()?;
        }
        out_header = decoder.into_header();
    }

    // Reinstate the zero padding between part bodies.
    let zeros = [0u8; 4096];
    let pads: Vec<(u64, u64)> = out_header
        .parts()
        .filter(|part| part.pad_bytes > 0)
        .map(|part| (part.offset + part.size, part.pad_bytes as u64))
        .collect();
    for (position, pad) in pads {
        out_file
            .seek(SeekFrom::Start(position))
            .map_err(Error::SeekError)?;
        let mut remaining = pad;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len() as u64) as usize;
            out_file
                .write_all(&zeros[..chunk])
                .map_err(Error::WriteError)?;
            remaining -= chunk as u64;
        }
    }

    let digest = payload_hash_over(&mut out_file, &out_header)?;
    out_header.payload_hash = [0; PAYLOAD_HASH_SIZE];
    out_header.payload_hash[..digest.len()].copy_from_slice(&digest);
    out_header.write_back(&mut out_file, HeaderLocation::Front)?;
    info!(
        "transport decoded {} -> {}",
        input.path().display(),
        output_path.display()
    );
    Ok(())
}
