//! 32-bit name identifiers.
//!
//! Parts, metadata keys, signing keys, and transport algorithms are all
//! referred to by the CRC-32 of their human-readable name. Ids are used for
//! lookup only; they are not part of the trust boundary.

use crate::error::{Error, Result};

/// CRC-32 of a name's UTF-8 bytes, without the empty-input check.
pub(crate) fn name_hash(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

/// Compute the identifier of a name.
pub fn id(name: &str) -> Result<u32> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("name must not be empty"));
    }
    Ok(name_hash(name))
}

/// Continue an identifier over a name suffix.
///
/// CRC-32 can be resumed, so `id_extend(id("kernel")?, "-hash-tree")` equals
/// `id("kernel-hash-tree")?` without knowing the original name. The transport
/// decoder relies on this to pair a hash-tree part with its data part.
pub fn id_extend(base: u32, suffix: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(base);
    hasher.update(suffix.as_bytes());
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_rejected() {
        assert!(matches!(id(""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn matches_crc32_check_value() {
        // The standard CRC-32 check input.
        assert_eq!(id("123456789").unwrap(), 0xCBF43926);
    }

    #[test]
    fn extension_matches_concatenation() {
        let full = id("kernel-hash-tree").unwrap();
        assert_eq!(id_extend(id("kernel").unwrap(), "-hash-tree"), full);
        assert_ne!(id_extend(id("rootfs").unwrap(), "-hash-tree"), full);
    }
}
