//! Well-known metadata keys.
//!
//! Meta entries are keyed by the id hash of a human-readable name. The keys
//! below are the ones interpreted by this crate or conventionally attached
//! by the tooling; everything else is opaque to the core.

use crate::id::name_hash;

/// `bpak-transport`: per-part encode/decode algorithm ids.
pub fn transport() -> u32 {
    name_hash("bpak-transport")
}

/// `merkle-salt`: 32-byte salt of a part's hash tree.
pub fn merkle_salt() -> u32 {
    name_hash("merkle-salt")
}

/// `merkle-root-hash`: root hash of a part's hash tree.
pub fn merkle_root_hash() -> u32 {
    name_hash("merkle-root-hash")
}

/// `bpak-key-id`: human-readable echo of the header's key id.
pub fn key_id() -> u32 {
    name_hash("bpak-key-id")
}

/// `bpak-keystore-id`: human-readable echo of the header's keystore id.
pub fn keystore_id() -> u32 {
    name_hash("bpak-keystore-id")
}

/// `bpak-package`: UUID identifying the package.
pub fn package() -> u32 {
    name_hash("bpak-package")
}

/// `bpak-package-uid`: UUID identifying this build of the package.
pub fn package_uid() -> u32 {
    name_hash("bpak-package-uid")
}

/// `bpak-version`: opaque version string for the catalog layer.
pub fn version() -> u32 {
    name_hash("bpak-version")
}

/// `bpak-dependency`: opaque dependency string for the catalog layer.
pub fn dependency() -> u32 {
    name_hash("bpak-dependency")
}

/// Name of a well-known key, for display.
pub fn name_of(id: u32) -> Option<&'static str> {
    const NAMES: &[&str] = &[
        "bpak-transport",
        "merkle-salt",
        "merkle-root-hash",
        "bpak-key-id",
        "bpak-keystore-id",
        "bpak-package",
        "bpak-package-uid",
        "bpak-version",
        "bpak-dependency",
    ];
    NAMES.iter().find(|name| name_hash(name) == id).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_back() {
        assert_eq!(name_of(transport()), Some("bpak-transport"));
        assert_eq!(name_of(merkle_root_hash()), Some("merkle-root-hash"));
        assert_eq!(name_of(0xDEAD_BEEF), None);
    }
}
