//! End-to-end archive scenarios over real files.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bpak::crypto::{Ed25519Signer, Ed25519Verifier, HashKind, SignatureKind};
use bpak::header::{FLAG_EXCLUDE_FROM_HASH, HEADER_SIZE};
use bpak::id::{id, id_extend};
use bpak::transport::Algorithm;
use bpak::{merkle, meta, Error, HeaderLocation, OpenMode, Package};
use tempfile::TempDir;

fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn signer() -> Ed25519Signer {
    Ed25519Signer::from_seed([42; 32])
}

fn verifier() -> Ed25519Verifier {
    Ed25519Verifier::from_public_key(signer().public_key()).unwrap()
}

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    use std::io::Read;
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0x01;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}

#[test]
fn part_sizing_and_alignment() {
    let dir = TempDir::new().unwrap();
    let kernel = write_file(&dir, "kernel.bin", &patterned(8193, 1));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&kernel, "kernel", 0).unwrap();

    let part = *pkg.header().get_part(id("kernel").unwrap()).unwrap();
    assert_eq!(part.size, 8193);
    assert_eq!(part.pad_bytes, 4095);
    assert_eq!(part.offset, HEADER_SIZE as u64);
    assert_eq!(pkg.installed_size(), 12288);
    assert_eq!(pkg.on_disk_size(), 4096 + 8193);
    drop(pkg);
    assert_eq!(
        std::fs::metadata(&archive).unwrap().len(),
        4096 + 8193 + 4095
    );
}

#[test]
fn sign_then_verify_all_hash_kinds() {
    for hash_kind in [HashKind::Sha256, HashKind::Sha384, HashKind::Sha512] {
        let dir = TempDir::new().unwrap();
        let payload = write_file(&dir, "data.bin", &patterned(20000, 2));
        let archive = dir.path().join("test.bpak");

        let mut pkg = Package::create(&archive, hash_kind, SignatureKind::Ed25519).unwrap();
        pkg.add_file(&payload, "data", 0).unwrap();
        pkg.sign(&signer()).unwrap();
        drop(pkg);

        let mut pkg = Package::open(&archive, OpenMode::Read).unwrap();
        pkg.verify(&verifier()).unwrap();
    }
}

#[test]
fn key_files_round_trip() {
    let dir = TempDir::new().unwrap();
    let seed_path = write_file(&dir, "signing.key", &[42; 32]);
    let public_path = write_file(&dir, "public.key", &signer().public_key());
    let payload = write_file(&dir, "data.bin", &patterned(5000, 3));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&payload, "data", 0).unwrap();
    pkg.sign(&Ed25519Signer::from_seed_file(&seed_path).unwrap()).unwrap();
    pkg.verify(&Ed25519Verifier::from_public_key_file(&public_path).unwrap())
        .unwrap();
}

#[test]
fn package_identity_and_signing_ids() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "data.bin", &patterned(4096, 4));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    let uid = uuid::Uuid::parse_str("0888b0fa-9c48-4524-9845-06a641b61edd").unwrap();
    pkg.add_meta_uuid(meta::package(), 0, uid).unwrap();
    pkg.header_mut().key_id = id("pb-development").unwrap();
    pkg.header_mut().keystore_id = id("pb-internal").unwrap();
    pkg.add_file(&payload, "data", 0).unwrap();
    pkg.sign(&signer()).unwrap();
    drop(pkg);

    let mut pkg = Package::open(&archive, OpenMode::Read).unwrap();
    pkg.verify(&verifier()).unwrap();
    assert_eq!(
        pkg.header().get_meta(meta::package(), 0).unwrap(),
        uid.as_bytes()
    );
    assert_eq!(pkg.header().key_id, id("pb-development").unwrap());
}

#[test]
fn hashes_are_invariant_under_signature_mutation() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "data.bin", &patterned(10000, 5));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&payload, "data", 0).unwrap();
    let payload_hash = pkg.compute_payload_hash().unwrap();
    let header_hash = pkg.compute_header_hash().unwrap();

    pkg.write_signature(&[0xAA; 64]).unwrap();
    assert_eq!(pkg.compute_payload_hash().unwrap(), payload_hash);
    assert_eq!(pkg.compute_header_hash().unwrap(), header_hash);
}

#[test]
fn payload_tampering_is_detected() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "data.bin", &patterned(8193, 6));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&payload, "data", 0).unwrap();
    pkg.sign(&signer()).unwrap();
    drop(pkg);

    flip_byte(&archive, 8192);
    let mut pkg = Package::open(&archive, OpenMode::Read).unwrap();
    assert!(matches!(
        pkg.verify(&verifier()),
        Err(Error::PayloadHashMismatch)
    ));
}

#[test]
fn header_tampering_is_detected() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "data.bin", &patterned(4000, 7));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&payload, "data", 0).unwrap();
    pkg.sign(&signer()).unwrap();
    drop(pkg);

    // The keystore id field; the header still parses.
    flip_byte(&archive, 0x256);
    let mut pkg = Package::open(&archive, OpenMode::Read).unwrap();
    assert!(matches!(
        pkg.verify(&verifier()),
        Err(Error::InvalidSignature)
    ));
}

#[test]
fn excluded_parts_do_not_affect_the_payload_hash() {
    let dir = TempDir::new().unwrap();
    let hashed = write_file(&dir, "hashed.bin", &patterned(4096, 8));
    let scratch = write_file(&dir, "scratch.bin", &patterned(4096, 9));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&hashed, "hashed", 0).unwrap();
    pkg.add_file(&scratch, "scratch", FLAG_EXCLUDE_FROM_HASH).unwrap();
    pkg.sign(&signer()).unwrap();
    drop(pkg);

    // Inside the excluded part.
    flip_byte(&archive, 4096 + 4096 + 17);
    let mut pkg = Package::open(&archive, OpenMode::Read).unwrap();
    pkg.verify(&verifier()).unwrap();
}

#[test]
fn transport_compression_round_trip() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "kernel.bin", &patterned(100_000, 10));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&payload, "kernel", 0).unwrap();
    pkg.set_transport(
        id("kernel").unwrap(),
        Algorithm::Heatshrink,
        Algorithm::Heatshrink,
    )
    .unwrap();
    pkg.sign(&signer()).unwrap();

    let encoded = dir.path().join("test.transport.bpak");
    pkg.transport_encode(&encoded, None).unwrap();
    drop(pkg);

    let mut transported = Package::open(&encoded, OpenMode::Read).unwrap();
    let part = *transported
        .header()
        .get_part(id("kernel").unwrap())
        .unwrap();
    assert!(part.is_transport_encoded());
    assert_eq!(part.size, 100_000);
    assert!(part.transport_size > 0 && part.transport_size < part.size);
    assert!(transported.on_disk_size() < 4096 + 100_000);

    let decoded = dir.path().join("test.decoded.bpak");
    transported.transport_decode(&decoded, None).unwrap();
    assert_eq!(
        std::fs::read(&archive).unwrap(),
        std::fs::read(&decoded).unwrap()
    );
    let mut decoded = Package::open(&decoded, OpenMode::Read).unwrap();
    decoded.verify(&verifier()).unwrap();
}

#[test]
fn transport_delta_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut old_data = patterned(60_000, 11);
    let origin_file = write_file(&dir, "rootfs-v1.bin", &old_data);
    // A realistic successor: mostly identical with a few edits.
    old_data[1000..1100].copy_from_slice(&[0xEE; 100]);
    old_data.extend_from_slice(&patterned(500, 12));
    let new_file = write_file(&dir, "rootfs-v2.bin", &old_data);

    let origin_archive = dir.path().join("v1.bpak");
    let mut origin = Package::create(&origin_archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    origin.add_file(&origin_file, "rootfs", 0).unwrap();
    origin.sign(&signer()).unwrap();

    let new_archive = dir.path().join("v2.bpak");
    let mut new_pkg = Package::create(&new_archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    new_pkg.add_file(&new_file, "rootfs", 0).unwrap();
    new_pkg
        .set_transport(id("rootfs").unwrap(), Algorithm::Bsdiff, Algorithm::Bsdiff)
        .unwrap();
    new_pkg.sign(&signer()).unwrap();

    let encoded = dir.path().join("v2.patch.bpak");
    new_pkg.transport_encode(&encoded, Some(&mut origin)).unwrap();
    drop(new_pkg);

    let mut transported = Package::open(&encoded, OpenMode::Read).unwrap();
    let part = *transported
        .header()
        .get_part(id("rootfs").unwrap())
        .unwrap();
    assert!(part.is_transport_encoded());
    assert!(part.transport_size < part.size / 4);

    let decoded = dir.path().join("v2.decoded.bpak");
    transported
        .transport_decode(&decoded, Some(&mut origin))
        .unwrap();
    assert_eq!(
        std::fs::read(&new_archive).unwrap(),
        std::fs::read(&decoded).unwrap()
    );
}

#[test]
fn merkle_tree_archive_layout() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "rootfs.bin", &patterned(1024 * 1024, 13));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file_with_merkle_tree(&payload, "rootfs", 0).unwrap();

    let data_id = id("rootfs").unwrap();
    let tree_id = id_extend(data_id, "-hash-tree");
    let tree_part = *pkg.header().get_part(tree_id).unwrap();
    assert_eq!(tree_part.size, merkle::tree_size(1024 * 1024));
    assert_eq!(tree_part.pad_bytes, 0);

    let salt: [u8; 32] = pkg
        .header()
        .get_meta(meta::merkle_salt(), data_id)
        .unwrap()
        .try_into()
        .unwrap();
    let root: [u8; 32] = pkg
        .header()
        .get_meta(meta::merkle_root_hash(), data_id)
        .unwrap()
        .try_into()
        .unwrap();

    // The stored tree verifies any single data block.
    let tree = pkg.read_part(&tree_part).unwrap();
    let data = std::fs::read(&payload).unwrap();
    merkle::verify_block(&tree, &salt, &root, data.len() as u64, 37, &data[37 * 4096..38 * 4096])
        .unwrap();

    pkg.sign(&signer()).unwrap();
    pkg.verify(&verifier()).unwrap();
}

#[test]
fn merkle_tree_is_regenerated_on_decode() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "rootfs.bin", &patterned(300_000, 14));
    let archive = dir.path().join("test.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file_with_merkle_tree(&payload, "rootfs", 0).unwrap();
    let data_id = id("rootfs").unwrap();
    let tree_id = id_extend(data_id, "-hash-tree");
    pkg.set_transport(data_id, Algorithm::Heatshrink, Algorithm::Heatshrink)
        .unwrap();
    pkg.set_transport(tree_id, Algorithm::RemoveData, Algorithm::MerkleGenerate)
        .unwrap();
    pkg.sign(&signer()).unwrap();

    let encoded = dir.path().join("test.transport.bpak");
    pkg.transport_encode(&encoded, None).unwrap();
    drop(pkg);

    let mut transported = Package::open(&encoded, OpenMode::Read).unwrap();
    let tree_part = *transported.header().get_part(tree_id).unwrap();
    assert!(tree_part.is_transport_encoded());
    assert_eq!(tree_part.transport_size, 0);

    let decoded = dir.path().join("test.decoded.bpak");
    transported.transport_decode(&decoded, None).unwrap();
    assert_eq!(
        std::fs::read(&archive).unwrap(),
        std::fs::read(&decoded).unwrap()
    );
}

#[test]
fn tail_located_headers_open() {
    let dir = TempDir::new().unwrap();
    let payload = write_file(&dir, "data.bin", &patterned(6000, 15));
    let archive = dir.path().join("front.bpak");

    let mut pkg = Package::create(&archive, HashKind::Sha256, SignatureKind::Ed25519).unwrap();
    pkg.add_file(&payload, "data", 0).unwrap();
    pkg.sign(&signer()).unwrap();
    let mut header = pkg.header().clone();
    let part = *header.get_part(id("data").unwrap()).unwrap();
    drop(pkg);

    // Rebase the same payload into a tail-header layout.
    let bytes = std::fs::read(&archive).unwrap();
    let body = &bytes[HEADER_SIZE..];
    header.get_part_mut(id("data").unwrap()).unwrap().offset = 0;
    let tail_archive = dir.path().join("tail.bpak");
    let mut rebased = Vec::from(body);
    rebased.extend_from_slice(&header.to_bytes());
    std::fs::write(&tail_archive, &rebased).unwrap();

    let mut pkg = Package::open(&tail_archive, OpenMode::Read).unwrap();
    assert_eq!(pkg.location(), HeaderLocation::Tail);
    assert_eq!(pkg.header().get_part(part.id).unwrap().size, part.size);
    // Payload bytes moved but did not change; the stored hash still holds.
    let digest = pkg.compute_payload_hash().unwrap();
    assert_eq!(digest[..], pkg.header().payload_hash[..digest.len()]);
}

#[test]
fn open_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "garbage.bin", &patterned(10000, 16));
    assert!(matches!(
        Package::open(&path, OpenMode::Read),
        Err(Error::InvalidHeader(_))
    ));
    assert!(matches!(
        Package::open(&dir.path().join("missing.bpak"), OpenMode::Read),
        Err(Error::NotFound)
    ));
}
