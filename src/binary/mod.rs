//! Embedded iPXE binaries.
//!
//! The four iPXE images ship inside the server binary. The masters are
//! immutable; every patched response is a fresh buffer, so concurrent
//! requests with different patches never observe each other.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Region reserved inside each image for the runtime patch. The offset is
/// agreed with the iPXE build; bytes are copied in verbatim.
pub const PATCH_OFFSET: usize = 512;
pub const PATCH_LEN: usize = 256;

static UNDIONLY: &[u8] = include_bytes!("../../ipxe/undionly.kpxe");
static IPXE_EFI: &[u8] = include_bytes!("../../ipxe/ipxe.efi");
static SNP_EFI: &[u8] = include_bytes!("../../ipxe/snp.efi");
static SNP_ARM64_EFI: &[u8] = include_bytes!("../../ipxe/snp-arm64.efi");

/// Clients append a W3C traceparent to the filename so distributed traces
/// survive the protocol hop: `snp.efi-00-<trace-id>-<span-id>-<flags>`.
static TRACEPARENT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-00-[0-9a-fA-F]{32}-[0-9a-fA-F]{16}-[0-9a-fA-F]{2}$")
        .expect("traceparent pattern is valid")
});

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("patch is {got} bytes, at most {max} fit in the reserved region")]
    TooLong { got: usize, max: usize },
}

/// The embedded images plus the deployment's patch bytes.
#[derive(Debug)]
pub struct Binaries {
    patch: Vec<u8>,
}

impl Binaries {
    pub fn new(patch: Vec<u8>) -> Result<Self, PatchError> {
        if patch.len() > PATCH_LEN {
            return Err(PatchError::TooLong {
                got: patch.len(),
                max: PATCH_LEN,
            });
        }
        Ok(Self { patch })
    }

    pub fn unpatched() -> Self {
        Self { patch: Vec::new() }
    }

    pub fn names() -> [&'static str; 4] {
        ["undionly.kpxe", "ipxe.efi", "snp.efi", "snp-arm64.efi"]
    }

    /// The embedded master bytes for a binary name.
    pub fn master(name: &str) -> Option<&'static [u8]> {
        match name {
            "undionly.kpxe" => Some(UNDIONLY),
            "ipxe.efi" => Some(IPXE_EFI),
            "snp.efi" => Some(SNP_EFI),
            "snp-arm64.efi" => Some(SNP_ARM64_EFI),
            _ => None,
        }
    }

    /// A serveable copy of the named binary with the patch applied. An empty
    /// patch is a no-op copy.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        let master = Self::master(name)?;
        let mut image = master.to_vec();
        if !self.patch.is_empty() && image.len() >= PATCH_OFFSET + self.patch.len() {
            image[PATCH_OFFSET..PATCH_OFFSET + self.patch.len()].copy_from_slice(&self.patch);
        }
        Some(image)
    }
}

/// Reduce a requested path to the binary name: basename, then any
/// traceparent suffix stripped.
pub fn canonical_name(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    match TRACEPARENT_SUFFIX.find(base) {
        Some(m) => &base[..m.start()],
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masters_are_embedded() {
        for name in Binaries::names() {
            let master = Binaries::master(name).unwrap();
            assert!(master.len() > PATCH_OFFSET + PATCH_LEN, "{name} too small");
        }
        assert!(Binaries::master("grub.efi").is_none());
    }

    #[test]
    fn empty_patch_returns_master_copy() {
        let binaries = Binaries::unpatched();
        let image = binaries.get("snp.efi").unwrap();
        assert_eq!(image, Binaries::master("snp.efi").unwrap());
    }

    #[test]
    fn patch_lands_at_the_agreed_offset() {
        let patch = b"set user-class Tinkerbell".to_vec();
        let binaries = Binaries::new(patch.clone()).unwrap();

        let image = binaries.get("ipxe.efi").unwrap();
        assert_eq!(&image[PATCH_OFFSET..PATCH_OFFSET + patch.len()], &patch[..]);
        // bytes outside the region are untouched
        let master = Binaries::master("ipxe.efi").unwrap();
        assert_eq!(&image[..PATCH_OFFSET], &master[..PATCH_OFFSET]);
        assert_eq!(
            &image[PATCH_OFFSET + patch.len()..],
            &master[PATCH_OFFSET + patch.len()..]
        );
    }

    #[test]
    fn masters_survive_patching() {
        let before = Binaries::master("undionly.kpxe").unwrap().to_vec();
        let binaries = Binaries::new(vec![0xAA; 16]).unwrap();
        let _ = binaries.get("undionly.kpxe").unwrap();
        assert_eq!(before, Binaries::master("undionly.kpxe").unwrap());
    }

    #[test]
    fn concurrent_patches_do_not_interfere() {
        let a = Binaries::new(vec![0x11; 8]).unwrap();
        let b = Binaries::new(vec![0x22; 8]).unwrap();

        let image_a = a.get("snp-arm64.efi").unwrap();
        let image_b = b.get("snp-arm64.efi").unwrap();
        assert_ne!(image_a, image_b);
        assert_eq!(image_a[PATCH_OFFSET], 0x11);
        assert_eq!(image_b[PATCH_OFFSET], 0x22);
    }

    #[test]
    fn oversized_patch_is_rejected() {
        let err = Binaries::new(vec![0u8; PATCH_LEN + 1]).unwrap_err();
        assert!(matches!(err, PatchError::TooLong { .. }));
    }

    #[test]
    fn canonical_name_takes_basename() {
        assert_eq!(canonical_name("ipxe.efi"), "ipxe.efi");
        assert_eq!(canonical_name("01:02:03:04:05:06/ipxe.efi"), "ipxe.efi");
        assert_eq!(canonical_name("/ipxe/snp.efi"), "snp.efi");
    }

    #[test]
    fn canonical_name_strips_traceparent() {
        assert_eq!(
            canonical_name(
                "snp.efi-00-23b1e307bb35484f535a1f772c06910e-d887dc3912240434-01"
            ),
            "snp.efi"
        );
        // malformed suffixes stay attached
        assert_eq!(
            canonical_name("snp.efi-00-23b1e307-d887dc3912240434-01"),
            "snp.efi-00-23b1e307-d887dc3912240434-01"
        );
    }
}
