//! Implementations of the CLI subcommands.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use bpak::crypto::{Ed25519Signer, Ed25519Verifier, HashKind, SignatureKind};
use bpak::header::{FLAG_EXCLUDE_FROM_HASH, FLAG_TRANSPORT};
use bpak::id::id;
use bpak::transport::{Algorithm, TransportMeta};
use bpak::{meta, Header, MetaHeader, OpenMode, Package};

#[derive(Debug, Parser)]
pub struct CreateCmd {
    file: PathBuf,
    /// Overwrite an existing file.
    #[arg(short = 'Y', long = "force")]
    force: bool,
    #[arg(long, default_value = "sha256")]
    hash_kind: HashKind,
    #[arg(long, default_value = "ed25519")]
    signature_kind: SignatureKind,
}

pub fn create(cmd: CreateCmd) -> anyhow::Result<()> {
    if cmd.file.exists() && !cmd.force {
        bail!("{} already exists, pass -Y to overwrite", cmd.file.display());
    }
    Package::create(&cmd.file, cmd.hash_kind, cmd.signature_kind)?;
    Ok(())
}

/// How a meta value given on the command line is turned into bytes.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MetaValueEncoder {
    /// UUID string to its 16-byte representation.
    Uuid,
    /// Decimal integer to 8 little-endian bytes.
    Integer,
    /// Name to its 4-byte id hash.
    Id,
}

#[derive(Debug, Parser)]
pub struct AddCmd {
    file: PathBuf,
    /// Name of the part to append.
    #[arg(long, conflicts_with = "meta")]
    part: Option<String>,
    /// Key of the metadata entry to add.
    #[arg(long)]
    meta: Option<String>,
    #[arg(long, conflicts_with = "from_string")]
    from_file: Option<PathBuf>,
    #[arg(long)]
    from_string: Option<String>,
    /// Value encoding for metadata entries.
    #[arg(long)]
    encoder: Option<MetaValueEncoder>,
    /// Part name scoping a metadata entry.
    #[arg(long)]
    part_ref: Option<String>,
    /// Also build a hash tree over the part.
    #[arg(long)]
    merkle: bool,
    /// Embed the file as a raw public key part.
    #[arg(long)]
    key: bool,
    /// Exclude the part from the payload hash.
    #[arg(long)]
    dont_hash: bool,
}

pub fn add(cmd: AddCmd) -> anyhow::Result<()> {
    let mut pkg = Package::open(&cmd.file, OpenMode::ReadWrite)?;
    if let Some(key) = &cmd.meta {
        let key_id = id(key)?;
        let part_ref = match &cmd.part_ref {
            Some(name) => id(name)?,
            None => 0,
        };
        let value = cmd
            .from_string
            .as_ref()
            .context("metadata entries are added with --from-string")?;
        match cmd.encoder {
            Some(MetaValueEncoder::Uuid) => pkg.add_meta_uuid(
                key_id,
                part_ref,
                uuid::Uuid::parse_str(value).context("invalid UUID")?,
            )?,
            Some(MetaValueEncoder::Integer) => {
                pkg.add_meta_u64(key_id, part_ref, value.parse().context("invalid integer")?)?
            }
            Some(MetaValueEncoder::Id) => pkg.add_meta_id(key_id, part_ref, id(value)?)?,
            None => pkg.add_meta_string(key_id, part_ref, value)?,
        }
        return Ok(());
    }
    let Some(part) = &cmd.part else {
        bail!("either --part or --meta is required");
    };
    let mut flags = 0;
    if cmd.dont_hash {
        flags |= FLAG_EXCLUDE_FROM_HASH;
    }
    if let Some(value) = &cmd.from_string {
        pkg.add_blob(value.as_bytes(), part, flags)?;
    } else {
        let source = cmd
            .from_file
            .as_ref()
            .context("either --from-file or --from-string is required")?;
        if cmd.key {
            pkg.add_key(source, part, flags)?;
        } else if cmd.merkle {
            pkg.add_file_with_merkle_tree(source, part, flags)?;
        } else {
            pkg.add_file(source, part, flags)?;
        }
    }
    Ok(())
}

#[derive(Debug, Parser)]
pub struct SetCmd {
    file: PathBuf,
    /// Key id, either numeric or a name to be id-hashed.
    #[arg(long)]
    key_id: Option<String>,
    /// Keystore id, either numeric or a name to be id-hashed.
    #[arg(long)]
    keystore_id: Option<String>,
}

pub fn set(cmd: SetCmd) -> anyhow::Result<()> {
    let mut pkg = Package::open(&cmd.file, OpenMode::ReadWrite)?;
    if let Some(value) = &cmd.key_id {
        pkg.header_mut().key_id = parse_id(value)?;
        echo_id_meta(&mut pkg, meta::key_id(), value)?;
    }
    if let Some(value) = &cmd.keystore_id {
        pkg.header_mut().keystore_id = parse_id(value)?;
        echo_id_meta(&mut pkg, meta::keystore_id(), value)?;
    }
    pkg.write_header()?;
    Ok(())
}

fn parse_id(value: &str) -> anyhow::Result<u32> {
    if let Some(hex) = value.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).context("invalid hexadecimal id");
    }
    if let Ok(numeric) = value.parse::<u32>() {
        return Ok(numeric);
    }
    Ok(id(value)?)
}

/// Keep the human-readable name next to the numeric field, for `show`.
fn echo_id_meta(pkg: &mut Package, key: u32, value: &str) -> anyhow::Result<()> {
    if value.parse::<u32>().is_ok() || value.starts_with("0x") {
        return Ok(());
    }
    if pkg.header().get_meta(key, 0).is_err() {
        pkg.add_meta_string(key, 0, value)?;
    }
    Ok(())
}

#[derive(Debug, Parser)]
pub struct SignCmd {
    file: PathBuf,
    /// File holding the raw 32-byte ed25519 seed.
    #[arg(long)]
    key: PathBuf,
}

pub fn sign(cmd: SignCmd) -> anyhow::Result<()> {
    let signer = Ed25519Signer::from_seed_file(&cmd.key)?;
    let mut pkg = Package::open(&cmd.file, OpenMode::ReadWrite)?;
    pkg.sign(&signer)?;
    Ok(())
}

#[derive(Debug, Parser)]
pub struct VerifyCmd {
    file: PathBuf,
    /// File holding the raw 32-byte ed25519 public key.
    #[arg(long)]
    key: PathBuf,
}

pub fn verify(cmd: VerifyCmd) -> anyhow::Result<()> {
    let verifier = Ed25519Verifier::from_public_key_file(&cmd.key)?;
    let mut pkg = Package::open(&cmd.file, OpenMode::Read)?;
    pkg.verify(&verifier)?;
    println!("ok");
    Ok(())
}

#[derive(Debug, Parser)]
pub struct ShowCmd {
    file: PathBuf,
}

pub fn show(cmd: ShowCmd) -> anyhow::Result<()> {
    let pkg = Package::open(&cmd.file, OpenMode::Read)?;
    let header = pkg.header();
    println!("Archive:        {}", cmd.file.display());
    println!("Hash kind:      {}", header.hash_kind.name());
    println!("Signature kind: {}", header.signature_kind.name());
    println!("Signature:      {} bytes", header.signature_sz);
    println!("Key id:         0x{:08x}", header.key_id);
    println!("Keystore id:    0x{:08x}", header.keystore_id);
    println!("Alignment:      {}", header.alignment);
    println!("Installed size: {}", pkg.installed_size());
    println!("On-disk size:   {}", pkg.on_disk_size());
    println!();
    println!("Parts:");
    for part in pkg.header().parts() {
        let mut flags = String::new();
        if part.flags & FLAG_TRANSPORT != 0 {
            flags.push('T');
        }
        if part.flags & FLAG_EXCLUDE_FROM_HASH != 0 {
            flags.push('X');
        }
        println!(
            "  0x{:08x}  size {:>10}  transport {:>10}  offset {:>10}  pad {:>4}  [{flags}]",
            part.id, part.size, part.transport_size, part.offset, part.pad_bytes,
        );
    }
    println!();
    println!("Meta:");
    for slot in pkg.header().metas() {
        let key = meta::name_of(slot.id)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("0x{:08x}", slot.id));
        println!(
            "  {key:<20} part 0x{:08x}  {:>4} bytes  {}",
            slot.part_id_ref,
            slot.size,
            render_meta(pkg.header(), slot),
        );
    }
    Ok(())
}

fn render_meta(header: &Header, slot: &MetaHeader) -> String {
    let data = header.meta_data(slot);
    if slot.id == meta::package() || slot.id == meta::package_uid() {
        if let Ok(bytes) = <[u8; 16]>::try_from(data) {
            return uuid::Uuid::from_bytes(bytes).to_string();
        }
    }
    if slot.id == meta::transport() {
        if let Ok(value) = TransportMeta::from_bytes(data) {
            return format!(
                "encode {} decode {}",
                algorithm_name(value.encode_id),
                algorithm_name(value.decode_id)
            );
        }
    }
    if [meta::version(), meta::dependency(), meta::key_id(), meta::keystore_id()]
        .contains(&slot.id)
    {
        if let Ok(text) = std::str::from_utf8(data) {
            return text.to_owned();
        }
    }
    hex::encode(data)
}

fn algorithm_name(wire_id: u32) -> String {
    Algorithm::from_wire_id(wire_id)
        .map(|algorithm| algorithm.name().to_owned())
        .unwrap_or_else(|_| format!("0x{wire_id:08x}"))
}

#[derive(Debug, Parser)]
pub struct TransportCmd {
    input: PathBuf,
    output: Option<PathBuf>,
    #[arg(long, conflicts_with = "decode")]
    encode: bool,
    #[arg(long)]
    decode: bool,
    /// Origin archive for delta algorithms.
    #[arg(long)]
    origin: Option<PathBuf>,
    /// Register transport algorithms for a part instead of re-encoding.
    #[arg(long)]
    add: Option<String>,
    #[arg(long)]
    set_encoder: Option<Algorithm>,
    #[arg(long)]
    set_decoder: Option<Algorithm>,
}

pub fn transport(cmd: TransportCmd) -> anyhow::Result<()> {
    if let Some(part) = &cmd.add {
        let mut pkg = Package::open(&cmd.input, OpenMode::ReadWrite)?;
        pkg.set_transport(
            id(part)?,
            cmd.set_encoder.context("--set-encoder is required")?,
            cmd.set_decoder.context("--set-decoder is required")?,
        )?;
        return Ok(());
    }
    let output = cmd.output.context("an output archive is required")?;
    let mut origin = match &cmd.origin {
        Some(path) => Some(Package::open(path, OpenMode::Read)?),
        None => None,
    };
    let mut input = Package::open(&cmd.input, OpenMode::Read)?;
    // Encoding is the default direction when neither flag is given.
    let encode = cmd.encode || !cmd.decode;
    if encode {
        input.transport_encode(&output, origin.as_mut())?;
        println!(
            "note: the transport archive carries the original signature; re-sign it to verify in transit"
        );
    } else {
        input.transport_decode(&output, origin.as_mut())?;
    }
    Ok(())
}

#[derive(Debug, Parser)]
pub struct CompareCmd {
    first: PathBuf,
    second: PathBuf,
}

pub fn compare(cmd: CompareCmd) -> anyhow::Result<()> {
    let first = Package::open(&cmd.first, OpenMode::Read)?;
    let second = Package::open(&cmd.second, OpenMode::Read)?;
    let a = first.header();
    let b = second.header();

    let row = |label: &str, left: String, right: String| {
        let marker = if left == right { ' ' } else { '*' };
        println!("{marker} {label:<16} {left:<40} {right}");
    };
    row("hash kind", a.hash_kind.name().into(), b.hash_kind.name().into());
    row(
        "signature kind",
        a.signature_kind.name().into(),
        b.signature_kind.name().into(),
    );
    row("key id", format!("0x{:08x}", a.key_id), format!("0x{:08x}", b.key_id));
    row(
        "keystore id",
        format!("0x{:08x}", a.keystore_id),
        format!("0x{:08x}", b.keystore_id),
    );
    row("alignment", a.alignment.to_string(), b.alignment.to_string());
    row(
        "payload hash",
        hex::encode(&a.payload_hash[..a.hash_kind.digest_size()]),
        hex::encode(&b.payload_hash[..b.hash_kind.digest_size()]),
    );

    let mut part_ids: Vec<u32> = a.parts().chain(b.parts()).map(|part| part.id).collect();
    part_ids.sort_unstable();
    part_ids.dedup();
    for part_id in part_ids {
        let describe = |header: &Header| match header.get_part(part_id) {
            Ok(part) => format!(
                "size {} transport {} offset {} flags {:#04x}",
                part.size, part.transport_size, part.offset, part.flags
            ),
            Err(_) => "absent".to_owned(),
        };
        row(&format!("part 0x{part_id:08x}"), describe(a), describe(b));
    }
    Ok(())
}
