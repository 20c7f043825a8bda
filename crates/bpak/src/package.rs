//! The package façade: an open archive file plus its parsed header.
//!
//! All mutating operations follow the same ordering: payload bytes first,
//! payload hash next, the header image last. A reader that loads the header
//! therefore sees either the pre-mutation state or the fully updated one.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::crypto::{HashKind, SignatureKind, Signer, Verifier};
use crate::error::{Error, Result};
use crate::header::{
    Header, HeaderLocation, PartHeader, HEADER_SIZE, PAYLOAD_HASH_SIZE, SIGNATURE_MAX_SIZE,
};
use crate::id::{id, id_extend};
use crate::merkle::{self, MerkleBuilder};
use crate::{meta, transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// An open archive.
pub struct Package {
    file: File,
    header: Header,
    location: HeaderLocation,
    path: PathBuf,
}

impl Package {
    /// Create a fresh archive with an initialized front header.
    pub fn create(path: &Path, hash_kind: HashKind, signature_kind: SignatureKind) -> Result<Self> {
        info!("creating archive {}", path.display());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::WriteError)?;
        let header = Header::new(hash_kind, signature_kind);
        header.write_back(&mut file, HeaderLocation::Front)?;
        Ok(Self {
            file,
            header,
            location: HeaderLocation::Front,
            path: path.to_owned(),
        })
    }

    /// Open an existing archive, probing for the header at the front and at
    /// the tail of the file.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        debug!("opening archive {}", path.display());
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound,
                _ => Error::ReadError(err),
            })?;
        let (header, location) = match Header::locate(&mut file) {
            Ok(found) => found,
            Err(Error::NotFound) => return Err(Error::InvalidHeader("no valid header found")),
            Err(err) => return Err(err),
        };
        Ok(Self {
            file,
            header,
            location,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn location(&self) -> HeaderLocation {
        self.location
    }

    pub(crate) fn file(&mut self) -> &mut File {
        &mut self.file
    }

    /// Re-serialize the header at its recorded location. The stream is
    /// flushed afterwards; the header is the last byte range written by
    /// every mutating operation.
    pub fn write_header(&mut self) -> Result<()> {
        self.header.write_back(&mut self.file, self.location)?;
        self.flush()
    }

    /// Drain any buffered writes to the underlying stream. This does not
    /// issue an fsync; durability ordering is left to the filesystem.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(Error::WriteError)
    }

    /// Total installed byte count of all parts, padding included.
    pub fn installed_size(&self) -> u64 {
        self.header.installed_size()
    }

    /// On-disk byte count of the archive: header plus part bodies.
    pub fn on_disk_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.header.on_disk_payload_size()
    }

    /// Digest of all part bodies not excluded from hashing. Padding bytes
    /// are never fed to the digest.
    pub fn compute_payload_hash(&mut self) -> Result<Vec<u8>> {
        payload_hash_over(&mut self.file, &self.header)
    }

    /// Recompute the payload hash into the header's slot.
    pub fn update_payload_hash(&mut self) -> Result<()> {
        let digest = self.compute_payload_hash()?;
        self.header.payload_hash = [0; PAYLOAD_HASH_SIZE];
        self.header.payload_hash[..digest.len()].copy_from_slice(&digest);
        Ok(())
    }

    /// Digest of the header image with the signature slot zeroed; this is
    /// the value covered by the signature.
    pub fn compute_header_hash(&self) -> Result<Vec<u8>> {
        let mut scrubbed = self.header.clone();
        scrubbed.signature = [0; SIGNATURE_MAX_SIZE];
        scrubbed.signature_sz = 0;
        let mut hasher = self.header.hash_kind.hasher();
        hasher.update(&scrubbed.to_bytes());
        Ok(hasher.finalize())
    }

    /// Refresh the payload hash, sign the header hash, and frame the
    /// signature into the header.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<()> {
        if signer.kind() != self.header.signature_kind {
            return Err(Error::UnsupportedSignature);
        }
        self.update_payload_hash()?;
        let digest = self.compute_header_hash()?;
        let signature = signer.sign(&digest)?;
        info!("signing {} ({} signature bytes)", self.path.display(), signature.len());
        self.write_signature(&signature)
    }

    /// Copy raw signature bytes into the header slot and write the header
    /// back.
    pub fn write_signature(&mut self, signature: &[u8]) -> Result<()> {
        if signature.len() > SIGNATURE_MAX_SIZE {
            return Err(Error::InvalidArgument("signature exceeds the header slot"));
        }
        self.header.signature = [0; SIGNATURE_MAX_SIZE];
        self.header.signature[..signature.len()].copy_from_slice(signature);
        self.header.signature_sz = signature.len() as u16;
        self.write_header()
    }

    /// Verify the payload hash and the signature over the header hash.
    pub fn verify(&mut self, verifier: &dyn Verifier) -> Result<()> {
        if verifier.kind() != self.header.signature_kind {
            return Err(Error::UnsupportedSignature);
        }
        let digest = self.compute_payload_hash()?;
        if digest[..] != self.header.payload_hash[..digest.len()] {
            return Err(Error::PayloadHashMismatch);
        }
        let header_digest = self.compute_header_hash()?;
        verifier.verify(
            &header_digest,
            &self.header.signature[..self.header.signature_sz as usize],
        )
    }

    /// Append the contents of a file as a new aligned part.
    pub fn add_file(&mut self, source: &Path, part_name: &str, flags: u8) -> Result<()> {
        let size = std::fs::metadata(source)
            .map_err(|_| Error::NotFound)?
            .len();
        let mut input = File::open(source).map_err(|_| Error::NotFound)?;
        info!("adding part {part_name} <{}>", source.display());
        self.append_part(id(part_name)?, size, flags, &mut input)?;
        self.update_payload_hash()?;
        self.write_header()
    }

    /// Append an in-memory byte string as a new aligned part.
    pub fn add_blob(&mut self, data: &[u8], part_name: &str, flags: u8) -> Result<()> {
        info!("adding part {part_name} ({} bytes)", data.len());
        self.append_part(id(part_name)?, data.len() as u64, flags, &mut Cursor::new(data))?;
        self.update_payload_hash()?;
        self.write_header()
    }

    /// Embed a public key file as a part. The file must already contain the
    /// raw key body; PEM decoding happens outside the core.
    pub fn add_key(&mut self, source: &Path, part_name: &str, flags: u8) -> Result<()> {
        let body = std::fs::read(source).map_err(|_| Error::NotFound)?;
        info!("embedding key {part_name} ({} bytes)", body.len());
        self.append_part(id(part_name)?, body.len() as u64, flags, &mut Cursor::new(&body))?;
        self.update_payload_hash()?;
        self.write_header()
    }

    /// Add a file as a part together with a hash tree over its contents in
    /// a companion part named `<part_name>-hash-tree`. The tree salt and
    /// root hash are recorded as meta entries keyed to the data part.
    pub fn add_file_with_merkle_tree(
        &mut self,
        source: &Path,
        part_name: &str,
        flags: u8,
    ) -> Result<()> {
        self.add_file(source, part_name, flags)?;
        let part_id = id(part_name)?;
        let size = self.header.get_part(part_id)?.size;

        let salt = merkle::generate_salt();
        let mut builder = MerkleBuilder::new(size, salt);
        let mut input = File::open(source).map_err(|_| Error::NotFound)?;
        let mut buffer = [0u8; 4096];
        loop {
            let read = input.read(&mut buffer).map_err(Error::ReadError)?;
            if read == 0 {
                break;
            }
            builder.update(&buffer[..read])?;
        }
        let (tree, root) = builder.finish()?;
        debug!("built {} byte hash tree over {part_name}", tree.len());

        self.header
            .add_meta(meta::merkle_salt(), part_id, merkle::HASH_SIZE as u16)?
            .copy_from_slice(&salt);
        self.header
            .add_meta(meta::merkle_root_hash(), part_id, merkle::HASH_SIZE as u16)?
            .copy_from_slice(&root);

        let tree_id = id_extend(part_id, "-hash-tree");
        self.append_part(tree_id, tree.len() as u64, flags, &mut Cursor::new(&tree))?;
        self.update_payload_hash()?;
        self.write_header()
    }

    /// Attach a raw meta value and write the header back.
    pub fn add_meta_raw(&mut self, key: u32, part_ref: u32, value: &[u8]) -> Result<()> {
        if value.len() > u16::MAX as usize {
            return Err(Error::NoSpace);
        }
        self.header
            .add_meta(key, part_ref, value.len() as u16)?
            .copy_from_slice(value);
        self.write_header()
    }

    /// Attach a string-valued meta entry (UTF-8, no terminator).
    pub fn add_meta_string(&mut self, key: u32, part_ref: u32, value: &str) -> Result<()> {
        self.add_meta_raw(key, part_ref, value.as_bytes())
    }

    /// Attach a UUID-valued meta entry (16 bytes).
    pub fn add_meta_uuid(&mut self, key: u32, part_ref: u32, value: uuid::Uuid) -> Result<()> {
        self.add_meta_raw(key, part_ref, value.as_bytes())
    }

    /// Attach an integer-valued meta entry (8 bytes, little-endian).
    pub fn add_meta_u64(&mut self, key: u32, part_ref: u32, value: u64) -> Result<()> {
        self.add_meta_raw(key, part_ref, &value.to_le_bytes())
    }

    /// Attach a meta entry holding another name id (4 bytes, little-endian).
    pub fn add_meta_id(&mut self, key: u32, part_ref: u32, value: u32) -> Result<()> {
        self.add_meta_raw(key, part_ref, &value.to_le_bytes())
    }

    /// Direct the transport codec for a part.
    pub fn set_transport(
        &mut self,
        part_id: u32,
        encoder: transport::Algorithm,
        decoder: transport::Algorithm,
    ) -> Result<()> {
        let value = transport::TransportMeta {
            encode_id: encoder.wire_id(),
            decode_id: decoder.wire_id(),
        }
        .to_bytes();
        self.add_meta_raw(meta::transport(), part_id, &value)
    }

    /// Produce a transport-encoded rendition of this archive at `output`.
    pub fn transport_encode(
        &mut self,
        output: &Path,
        origin: Option<&mut Package>,
    ) -> Result<()> {
        transport::encode(self, output, origin)
    }

    /// Reconstitute a transport-encoded archive into `output`.
    pub fn transport_decode(
        &mut self,
        output: &Path,
        origin: Option<&mut Package>,
    ) -> Result<()> {
        transport::decode(self, output, origin)
    }

    /// Read a part's on-disk bytes.
    pub fn read_part(&mut self, part: &PartHeader) -> Result<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(part.offset))
            .map_err(Error::SeekError)?;
        let mut body = vec![0u8; part.on_disk_size() as usize];
        self.file.read_exact(&mut body).map_err(Error::ReadError)?;
        Ok(body)
    }

    fn append_part(
        &mut self,
        part_id: u32,
        size: u64,
        flags: u8,
        reader: &mut dyn Read,
    ) -> Result<()> {
        if self.location != HeaderLocation::Front {
            return Err(Error::Failed(
                "appending requires a front-located header".into(),
            ));
        }
        let offset = HEADER_SIZE as u64 + self.header.installed_size();
        let pad = self.header.pad_for(size);

        let mut header = self.header.clone();
        {
            let part = header.add_part(part_id)?;
            part.size = size;
            part.offset = offset;
            part.flags = flags;
            part.pad_bytes = pad as u16;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::SeekError)?;
        let mut buffer = [0u8; 4096];
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(buffer.len() as u64) as usize;
            reader
                .read_exact(&mut buffer[..chunk])
                .map_err(Error::ReadError)?;
            self.file
                .write_all(&buffer[..chunk])
                .map_err(Error::WriteError)?;
            remaining -= chunk as u64;
        }
        if pad > 0 {
            debug!("zero-padding part 0x{part_id:08x} with {pad} bytes");
            let zeros = [0u8; 4096];
            let mut remaining = pad;
            while remaining > 0 {
                let chunk = remaining.min(zeros.len() as u64) as usize;
                self.file
                    .write_all(&zeros[..chunk])
                    .map_err(Error::WriteError)?;
                remaining -= chunk as u64;
            }
        }
        self.header = header;
        Ok(())
    }
}

impl Drop for Package {
    /// Closing is dropping. Mutators flush when they write the header, so
    /// this only drains stragglers; errors cannot surface from drop.
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

/// Digest the part bodies of an archive file as described by a header.
pub(crate) fn payload_hash_over(file: &mut File, header: &Header) -> Result<Vec<u8>> {
    let mut hasher = header.hash_kind.hasher();
    let mut buffer = [0u8; 4096];
    for part in header.parts() {
        if part.is_excluded_from_hash() {
            continue;
        }
        file.seek(SeekFrom::Start(part.offset))
            .map_err(Error::SeekError)?;
        let mut remaining = part.on_disk_size();
        while remaining > 0 {
            let chunk = remaining.min(buffer.len() as u64) as usize;
            file.read_exact(&mut buffer[..chunk])
                .map_err(Error::ReadError)?;
            hasher.update(&buffer[..chunk]);
            remaining -= chunk as u64;
        }
    }
    Ok(hasher.finalize())
}
