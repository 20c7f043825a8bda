//! The fixed-size archive header: validation, serialization, location
//! probing, and the part/meta tables embedded in it.
//!
//! The header is a plain 4096-byte image with a fixed layout. All multi-byte
//! integers are little-endian; reserved and padding bytes are written as
//! zero. The part and meta tables are fixed-capacity arrays inside the
//! image; used slots are contiguous and empty slots (id 0) only occur at the
//! tail of each table.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::crypto::{HashKind, SignatureKind};
use crate::error::{Error, Result};

/// Size of the serialized header.
pub const HEADER_SIZE: usize = 4096;

/// Header start sequence, `b"BPAK"` in little-endian serialization.
pub const MAGIC: u32 = 0x4250414B;

/// Current format version.
pub const VERSION: u32 = 2;

/// Capacity of the part table.
pub const MAX_PARTS: usize = 32;

/// Capacity of the meta table.
pub const MAX_META: usize = 32;

/// Size of the shared meta data pool.
pub const META_POOL_SIZE: usize = 2048;

/// Capacity of the signature slot.
pub const SIGNATURE_MAX_SIZE: usize = 512;

/// Capacity of the payload hash slot; shorter digests are zero-padded.
pub const PAYLOAD_HASH_SIZE: usize = 64;

/// Default physical alignment of part offsets.
pub const DEFAULT_ALIGNMENT: u32 = 4096;

/// Part body is transport-encoded; the on-disk byte count is
/// `transport_size` instead of `size`.
pub const FLAG_TRANSPORT: u8 = 1 << 0;

/// Part body is not covered by the payload hash.
pub const FLAG_EXCLUDE_FROM_HASH: u8 = 1 << 1;

const META_SLOT_SIZE: usize = 12;
const PART_SLOT_SIZE: usize = 31;

const OFF_MAGIC: usize = 0x0000;
const OFF_VERSION: usize = 0x0004;
const OFF_HASH_KIND: usize = 0x0008;
const OFF_SIGNATURE_KIND: usize = 0x000C;
// 0x0010..0x0014 reserved
const OFF_PAYLOAD_HASH: usize = 0x0014;
const OFF_SIGNATURE: usize = OFF_PAYLOAD_HASH + PAYLOAD_HASH_SIZE;
const OFF_SIGNATURE_SZ: usize = OFF_SIGNATURE + SIGNATURE_MAX_SIZE;
const OFF_KEYSTORE_ID: usize = OFF_SIGNATURE_SZ + 2;
const OFF_KEY_ID: usize = OFF_KEYSTORE_ID + 4;
const OFF_ALIGNMENT: usize = OFF_KEY_ID + 4;
const OFF_META: usize = OFF_ALIGNMENT + 4;
const OFF_META_POOL: usize = OFF_META + MAX_META * META_SLOT_SIZE;
const OFF_PARTS: usize = OFF_META_POOL + META_POOL_SIZE;
const OFF_TAIL_PAD: usize = OFF_PARTS + MAX_PARTS * PART_SLOT_SIZE;

const _: () = assert!(OFF_TAIL_PAD <= HEADER_SIZE);

/// Where the header image lives inside the archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLocation {
    /// First 4096 bytes; parts start at offset 4096.
    Front,
    /// Last 4096 bytes; parts start at offset 0.
    Tail,
}

/// Entry of the part table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartHeader {
    pub id: u32,
    /// Nominal (installed) byte count of the part body.
    pub size: u64,
    /// On-disk byte count when the part is transport-encoded.
    pub transport_size: u64,
    /// Absolute file offset of the part body; multiple of the alignment.
    pub offset: u64,
    /// Zero bytes following the body so that `size + pad_bytes` is a
    /// multiple of the alignment.
    pub pad_bytes: u16,
    pub flags: u8,
}

impl PartHeader {
    /// Byte count of the part body as stored in the archive.
    pub fn on_disk_size(&self) -> u64 {
        if self.flags & FLAG_TRANSPORT != 0 {
            self.transport_size
        } else {
            self.size
        }
    }

    /// Nominal byte count, independent of transport encoding.
    pub fn nominal_size(&self) -> u64 {
        self.size
    }

    pub fn is_transport_encoded(&self) -> bool {
        self.flags & FLAG_TRANSPORT != 0
    }

    pub fn is_excluded_from_hash(&self) -> bool {
        self.flags & FLAG_EXCLUDE_FROM_HASH != 0
    }
}

/// Entry of the meta table; the value bytes live in the shared pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaHeader {
    pub id: u32,
    /// Id of the part this entry is scoped to, or 0 for archive-global.
    pub part_id_ref: u32,
    pub data_offset: u16,
    pub size: u16,
}

/// In-memory representation of the 4096-byte header image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub hash_kind: HashKind,
    pub signature_kind: SignatureKind,
    pub payload_hash: [u8; PAYLOAD_HASH_SIZE],
    pub signature: [u8; SIGNATURE_MAX_SIZE],
    pub signature_sz: u16,
    pub keystore_id: u32,
    pub key_id: u32,
    pub alignment: u32,
    meta: [MetaHeader; MAX_META],
    meta_pool: [u8; META_POOL_SIZE],
    parts: [PartHeader; MAX_PARTS],
}

impl Header {
    /// Create a fresh header with empty tables and default alignment.
    pub fn new(hash_kind: HashKind, signature_kind: SignatureKind) -> Self {
        Self {
            hash_kind,
            signature_kind,
            payload_hash: [0; PAYLOAD_HASH_SIZE],
            signature: [0; SIGNATURE_MAX_SIZE],
            signature_sz: 0,
            keystore_id: 0,
            key_id: 0,
            alignment: DEFAULT_ALIGNMENT,
            meta: [MetaHeader::default(); MAX_META],
            meta_pool: [0; META_POOL_SIZE],
            parts: [PartHeader::default(); MAX_PARTS],
        }
    }

    /// Parse and validate a header image.
    pub fn from_bytes(image: &[u8]) -> Result<Self> {
        if image.len() != HEADER_SIZE {
            return Err(Error::InvalidHeader("image is not 4096 bytes"));
        }
        if get_u32(image, OFF_MAGIC) != MAGIC {
            return Err(Error::InvalidHeader("bad magic"));
        }
        if get_u32(image, OFF_VERSION) != VERSION {
            return Err(Error::InvalidHeader("unknown version"));
        }
        let hash_kind = HashKind::from_wire(get_u32(image, OFF_HASH_KIND))
            .map_err(|_| Error::InvalidHeader("unknown hash kind"))?;
        let signature_kind = SignatureKind::from_wire(get_u32(image, OFF_SIGNATURE_KIND))
            .map_err(|_| Error::InvalidHeader("unknown signature kind"))?;
        let signature_sz = get_u16(image, OFF_SIGNATURE_SZ);
        if signature_sz as usize > SIGNATURE_MAX_SIZE {
            return Err(Error::InvalidHeader("signature size out of range"));
        }
        let alignment = get_u32(image, OFF_ALIGNMENT);
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidHeader("alignment is not a power of two"));
        }

        let mut header = Self {
            hash_kind,
            signature_kind,
            payload_hash: [0; PAYLOAD_HASH_SIZE],
            signature: [0; SIGNATURE_MAX_SIZE],
            signature_sz,
            keystore_id: get_u32(image, OFF_KEYSTORE_ID),
            key_id: get_u32(image, OFF_KEY_ID),
            alignment,
            meta: [MetaHeader::default(); MAX_META],
            meta_pool: [0; META_POOL_SIZE],
            parts: [PartHeader::default(); MAX_PARTS],
        };
        header
            .payload_hash
            .copy_from_slice(&image[OFF_PAYLOAD_HASH..OFF_PAYLOAD_HASH + PAYLOAD_HASH_SIZE]);
        header
            .signature
            .copy_from_slice(&image[OFF_SIGNATURE..OFF_SIGNATURE + SIGNATURE_MAX_SIZE]);
        header
            .meta_pool
            .copy_from_slice(&image[OFF_META_POOL..OFF_META_POOL + META_POOL_SIZE]);

        for (index, slot) in header.meta.iter_mut().enumerate() {
            let base = OFF_META + index * META_SLOT_SIZE;
            *slot = MetaHeader {
                id: get_u32(image, base),
                part_id_ref: get_u32(image, base + 4),
                data_offset: get_u16(image, base + 8),
                size: get_u16(image, base + 10),
            };
        }
        for (index, slot) in header.parts.iter_mut().enumerate() {
            let base = OFF_PARTS + index * PART_SLOT_SIZE;
            *slot = PartHeader {
                id: get_u32(image, base),
                size: get_u64(image, base + 4),
                transport_size: get_u64(image, base + 12),
                offset: get_u64(image, base + 20),
                pad_bytes: get_u16(image, base + 28),
                flags: image[base + 30],
            };
        }

        header.check_tables()?;
        Ok(header)
    }

    /// Serialize into a deterministic 4096-byte image.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut image = [0u8; HEADER_SIZE];
        put_u32(&mut image, OFF_MAGIC, MAGIC);
        put_u32(&mut image, OFF_VERSION, VERSION);
        put_u32(&mut image, OFF_HASH_KIND, self.hash_kind.wire());
        put_u32(&mut image, OFF_SIGNATURE_KIND, self.signature_kind.wire());
        image[OFF_PAYLOAD_HASH..OFF_PAYLOAD_HASH + PAYLOAD_HASH_SIZE]
            .copy_from_slice(&self.payload_hash);
        image[OFF_SIGNATURE..OFF_SIGNATURE + SIGNATURE_MAX_SIZE].copy_from_slice(&self.signature);
        put_u16(&mut image, OFF_SIGNATURE_SZ, self.signature_sz);
        put_u32(&mut image, OFF_KEYSTORE_ID, self.keystore_id);
        put_u32(&mut image, OFF_KEY_ID, self.key_id);
        put_u32(&mut image, OFF_ALIGNMENT, self.alignment);
        for (index, slot) in self.meta.iter().enumerate() {
            let base = OFF_META + index * META_SLOT_SIZE;
            put_u32(&mut image, base, slot.id);
            put_u32(&mut image, base + 4, slot.part_id_ref);
            put_u16(&mut image, base + 8, slot.data_offset);
            put_u16(&mut image, base + 10, slot.size);
        }
        image[OFF_META_POOL..OFF_META_POOL + META_POOL_SIZE].copy_from_slice(&self.meta_pool);
        for (index, slot) in self.parts.iter().enumerate() {
            let base = OFF_PARTS + index * PART_SLOT_SIZE;
            put_u32(&mut image, base, slot.id);
            put_u64(&mut image, base + 4, slot.size);
            put_u64(&mut image, base + 12, slot.transport_size);
            put_u64(&mut image, base + 20, slot.offset);
            put_u16(&mut image, base + 28, slot.pad_bytes);
            image[base + 30] = slot.flags;
        }
        image
    }

    /// Probe a stream for the header, first 4096 bytes first, then the last
    /// 4096. The front wins when both parse.
    pub fn locate<S: Read + Seek>(stream: &mut S) -> Result<(Self, HeaderLocation)> {
        let mut image = [0u8; HEADER_SIZE];
        stream.seek(SeekFrom::Start(0)).map_err(Error::SeekError)?;
        if stream.read_exact(&mut image).is_ok() {
            if let Ok(header) = Self::from_bytes(&image) {
                return Ok((header, HeaderLocation::Front));
            }
        }
        if stream.seek(SeekFrom::End(-(HEADER_SIZE as i64))).is_ok()
            && stream.read_exact(&mut image).is_ok()
        {
            if let Ok(header) = Self::from_bytes(&image) {
                return Ok((header, HeaderLocation::Tail));
            }
        }
        Err(Error::NotFound)
    }

    /// Re-serialize and write the header at its recorded location.
    pub fn write_back<S: Write + Seek>(
        &self,
        stream: &mut S,
        location: HeaderLocation,
    ) -> Result<()> {
        let position = match location {
            HeaderLocation::Front => SeekFrom::Start(0),
            HeaderLocation::Tail => SeekFrom::End(-(HEADER_SIZE as i64)),
        };
        stream.seek(position).map_err(Error::SeekError)?;
        stream.write_all(&self.to_bytes()).map_err(Error::WriteError)
    }

    /// Live part slots in storage order.
    pub fn parts(&self) -> impl Iterator<Item = &PartHeader> {
        self.parts.iter().take_while(|part| part.id != 0)
    }

    /// Mutable access to the live part slots.
    pub fn parts_mut(&mut self) -> impl Iterator<Item = &mut PartHeader> {
        self.parts.iter_mut().take_while(|part| part.id != 0)
    }

    /// Live meta slots in storage order.
    pub fn metas(&self) -> impl Iterator<Item = &MetaHeader> {
        self.meta.iter().take_while(|meta| meta.id != 0)
    }

    /// Append a part with the given id into the first empty slot.
    pub fn add_part(&mut self, id: u32) -> Result<&mut PartHeader> {
        if id == 0 {
            return Err(Error::InvalidArgument("part id must not be 0"));
        }
        if self.parts().any(|part| part.id == id) {
            return Err(Error::Exists);
        }
        let slot = self
            .parts
            .iter_mut()
            .find(|part| part.id == 0)
            .ok_or(Error::NoSpace)?;
        *slot = PartHeader {
            id,
            ..PartHeader::default()
        };
        Ok(slot)
    }

    pub fn get_part(&self, id: u32) -> Result<&PartHeader> {
        self.parts().find(|part| part.id == id).ok_or(Error::NotFound)
    }

    pub fn get_part_mut(&mut self, id: u32) -> Result<&mut PartHeader> {
        self.parts_mut()
            .find(|part| part.id == id)
            .ok_or(Error::NotFound)
    }

    /// Remove a part, shifting the remaining live slots left.
    pub fn del_part(&mut self, id: u32) -> Result<()> {
        let index = self
            .parts
            .iter()
            .take_while(|part| part.id != 0)
            .position(|part| part.id == id)
            .ok_or(Error::NotFound)?;
        self.parts.copy_within(index + 1.., index);
        self.parts[MAX_PARTS - 1] = PartHeader::default();
        Ok(())
    }

    /// Allocate `size` bytes from the meta pool and append a meta slot.
    /// Returns the value bytes for the caller to fill in.
    pub fn add_meta(&mut self, id: u32, part_id_ref: u32, size: u16) -> Result<&mut [u8]> {
        if id == 0 {
            return Err(Error::InvalidArgument("meta id must not be 0"));
        }
        let offset = self
            .metas()
            .map(|meta| meta.data_offset as usize + meta.size as usize)
            .max()
            .unwrap_or(0);
        if offset + size as usize > META_POOL_SIZE {
            return Err(Error::NoSpace);
        }
        let slot = self
            .meta
            .iter_mut()
            .find(|meta| meta.id == 0)
            .ok_or(Error::NoSpace)?;
        *slot = MetaHeader {
            id,
            part_id_ref,
            data_offset: offset as u16,
            size,
        };
        Ok(&mut self.meta_pool[offset..offset + size as usize])
    }

    /// First meta value matching both the id and the part scope
    /// (`part_id_ref == 0` is the archive-global scope).
    pub fn get_meta(&self, id: u32, part_id_ref: u32) -> Result<&[u8]> {
        let slot = self
            .metas()
            .copied()
            .find(|meta| meta.id == id && meta.part_id_ref == part_id_ref)
            .ok_or(Error::NotFound)?;
        Ok(&self.meta_pool[slot.data_offset as usize..(slot.data_offset + slot.size) as usize])
    }

    pub fn get_meta_mut(&mut self, id: u32, part_id_ref: u32) -> Result<&mut [u8]> {
        let slot = self
            .metas()
            .copied()
            .find(|meta| meta.id == id && meta.part_id_ref == part_id_ref)
            .ok_or(Error::NotFound)?;
        Ok(&mut self.meta_pool[slot.data_offset as usize..(slot.data_offset + slot.size) as usize])
    }

    /// Value bytes of a meta slot.
    pub fn meta_data(&self, slot: &MetaHeader) -> &[u8] {
        &self.meta_pool[slot.data_offset as usize..(slot.data_offset + slot.size) as usize]
    }

    /// Total installed byte count of all parts, padding included.
    pub fn installed_size(&self) -> u64 {
        self.parts()
            .map(|part| part.size + part.pad_bytes as u64)
            .sum()
    }

    /// Total on-disk byte count of all part bodies, header excluded.
    pub fn on_disk_payload_size(&self) -> u64 {
        self.parts().map(|part| part.on_disk_size()).sum()
    }

    /// Padding needed to bring `size` up to the next alignment boundary.
    pub fn pad_for(&self, size: u64) -> u64 {
        let alignment = self.alignment as u64;
        (alignment - size % alignment) % alignment
    }

    fn check_tables(&self) -> Result<()> {
        let mut seen_empty = false;
        for slot in &self.meta {
            if slot.id == 0 {
                seen_empty = true;
            } else if seen_empty {
                return Err(Error::InvalidHeader("hole in meta table"));
            } else if slot.data_offset as usize + slot.size as usize > META_POOL_SIZE {
                return Err(Error::InvalidHeader("meta value outside pool"));
            }
        }
        let mut ranges: Vec<(u16, u16)> = self
            .metas()
            .filter(|meta| meta.size > 0)
            .map(|meta| (meta.data_offset, meta.size))
            .collect();
        ranges.sort_unstable();
        for window in ranges.windows(2) {
            if window[0].0 + window[0].1 > window[1].0 {
                return Err(Error::InvalidHeader("overlapping meta values"));
            }
        }
        let mut seen_empty = false;
        for slot in &self.parts {
            if slot.id == 0 {
                seen_empty = true;
            } else if seen_empty {
                return Err(Error::InvalidHeader("hole in part table"));
            }
        }
        Ok(())
    }
}

fn get_u16(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([image[offset], image[offset + 1]])
}

fn get_u32(image: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&image[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(image: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u16(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(image: &mut [u8], offset: usize, value: u64) {
    image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::id::id;

    fn sample_header() -> Header {
        let mut header = Header::new(HashKind::Sha256, SignatureKind::Ed25519);
        header.key_id = id("pb-development").unwrap();
        header.keystore_id = id("pb-internal").unwrap();
        let part = header.add_part(id("kernel").unwrap()).unwrap();
        part.size = 8193;
        part.pad_bytes = 4095;
        part.offset = HEADER_SIZE as u64;
        header
            .add_meta(id("bpak-version").unwrap(), 0, 5)
            .unwrap()
            .copy_from_slice(b"1.0.0");
        header
    }

    #[test]
    fn serialized_magic_bytes() {
        let image = sample_header().to_bytes();
        assert_eq!(&image[..4], &[0x4B, 0x41, 0x50, 0x42]);
    }

    #[test]
    fn round_trip() {
        let header = sample_header();
        let parsed = Header::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.to_bytes(), header.to_bytes());
    }

    #[test]
    fn rejects_corrupt_images() {
        let header = sample_header();
        let mut image = header.to_bytes();
        image[0] ^= 1;
        assert!(matches!(
            Header::from_bytes(&image),
            Err(Error::InvalidHeader(_))
        ));
        let mut image = header.to_bytes();
        image[OFF_VERSION] = 99;
        assert!(Header::from_bytes(&image).is_err());
        let mut image = header.to_bytes();
        image[OFF_HASH_KIND] = 9;
        assert!(Header::from_bytes(&image).is_err());
        let mut image = header.to_bytes();
        put_u16(&mut image, OFF_SIGNATURE_SZ, 513);
        assert!(Header::from_bytes(&image).is_err());
    }

    #[test]
    fn part_table_is_bounded_and_unique() {
        let mut header = Header::new(HashKind::Sha256, SignatureKind::Ed25519);
        for index in 0..MAX_PARTS {
            header.add_part(index as u32 + 1).unwrap();
        }
        assert!(matches!(header.add_part(1000), Err(Error::NoSpace)));
        let mut header = Header::new(HashKind::Sha256, SignatureKind::Ed25519);
        header.add_part(7).unwrap();
        assert!(matches!(header.add_part(7), Err(Error::Exists)));
    }

    #[test]
    fn del_part_compacts_stably() {
        let mut header = Header::new(HashKind::Sha256, SignatureKind::Ed25519);
        for id in [10, 20, 30] {
            header.add_part(id).unwrap();
        }
        header.del_part(20).unwrap();
        let ids: Vec<u32> = header.parts().map(|part| part.id).collect();
        assert_eq!(ids, vec![10, 30]);
        assert!(matches!(header.del_part(20), Err(Error::NotFound)));
    }

    #[test]
    fn meta_pool_allocation() {
        let mut header = Header::new(HashKind::Sha256, SignatureKind::Ed25519);
        header.add_meta(1, 0, 1024).unwrap();
        header.add_meta(2, 0, 1024).unwrap();
        assert!(matches!(header.add_meta(3, 0, 1), Err(Error::NoSpace)));
        assert_eq!(header.get_meta(2, 0).unwrap().len(), 1024);
        assert!(matches!(header.get_meta(2, 9), Err(Error::NotFound)));
    }

    #[test]
    fn meta_scope_lookup() {
        let mut header = Header::new(HashKind::Sha256, SignatureKind::Ed25519);
        header.add_meta(5, 0, 4).unwrap().copy_from_slice(b"glob");
        header.add_meta(5, 77, 4).unwrap().copy_from_slice(b"part");
        assert_eq!(header.get_meta(5, 0).unwrap(), b"glob");
        assert_eq!(header.get_meta(5, 77).unwrap(), b"part");
    }

    #[test]
    fn locate_prefers_front(){
        let header = sample_header();
        let mut file = Vec::new();
        file.extend_from_slice(&header.to_bytes());
        file.extend_from_slice(&[0u8; 123]);
        let mut tail = Header::new(HashKind::Sha512, SignatureKind::Ed25519);
        tail.add_part(1).unwrap();
        file.extend_from_slice(&tail.to_bytes());
        let (found, location) = Header::locate(&mut Cursor::new(&file)).unwrap();
        assert_eq!(location, HeaderLocation::Front);
        assert_eq!(found, header);
    }

    #[test]
    fn locate_falls_back_to_tail() {
        let header = sample_header();
        let mut file = vec![0u8; 8192];
        file.extend_from_slice(&header.to_bytes());
        let (found, location) = Header::locate(&mut Cursor::new(&file)).unwrap();
        assert_eq!(location, HeaderLocation::Tail);
        assert_eq!(found, header);
        assert!(matches!(
            Header::locate(&mut Cursor::new(vec![0u8; 64])),
            Err(Error::NotFound)
        ));
    }
}
