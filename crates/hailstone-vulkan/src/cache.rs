//! Pipeline cache persistence.
//!
//! A cache blob starts with a header identifying the device that wrote it:
//!
//! ```text
//! offset  size  field
//! 0       4     header size (>= 32)
//! 4       4     header version (1)
//! 8       4     vendor id
//! 12      4     device id
//! 16      16    pipeline cache UUID
//! ```
//!
//! Integers are in host byte order. A blob whose header does not match the
//! current device is discarded and the pipeline is built from an empty cache.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use hailstone_core::Error;
use tracing::{debug, info, warn};

/// Length of the version-one header.
pub const HEADER_LEN: usize = 32;

/// `VK_PIPELINE_CACHE_HEADER_VERSION_ONE`.
const HEADER_VERSION_ONE: u32 = 1;

/// Values a cache header must carry to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheIdentity {
    pub vendor_id: u32,
    pub device_id: u32,
    pub uuid: [u8; 16],
}

/// Parsed cache header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    pub header_size: u32,
    pub header_version: u32,
    pub identity: CacheIdentity,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(word)
}

/// Parses the header of a cache blob.
pub fn parse_header(blob: &[u8]) -> Option<CacheHeader> {
    if blob.len() < HEADER_LEN {
        return None;
    }
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&blob[16..32]);
    Some(CacheHeader {
        header_size: read_u32(blob, 0),
        header_version: read_u32(blob, 4),
        identity: CacheIdentity {
            vendor_id: read_u32(blob, 8),
            device_id: read_u32(blob, 12),
            uuid,
        },
    })
}

/// Why a blob was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Truncated,
    HeaderSize(u32),
    Version(u32),
    OtherDevice,
}

/// Checks that a blob was written by this device.
pub fn validate(blob: &[u8], identity: &CacheIdentity) -> std::result::Result<(), Rejection> {
    let header = parse_header(blob).ok_or(Rejection::Truncated)?;
    if (header.header_size as usize) < HEADER_LEN || header.header_size as usize > blob.len() {
        return Err(Rejection::HeaderSize(header.header_size));
    }
    if header.header_version != HEADER_VERSION_ONE {
        return Err(Rejection::Version(header.header_version));
    }
    if header.identity != *identity {
        return Err(Rejection::OtherDevice);
    }
    Ok(())
}

/// Loads a blob for this device, or `None` to start empty.
///
/// Missing, unreadable and mismatched files all yield `None`.
pub fn load_blob(path: &Path, identity: &CacheIdentity) -> Option<Vec<u8>> {
    let blob = match fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no pipeline cache yet");
            return None;
        }
        Err(e) => {
            let err = Error::pipeline_cache(&e);
            warn!(path = %path.display(), error = %err, "pipeline cache unreadable, starting empty");
            return None;
        }
    };

    match validate(&blob, identity) {
        Ok(()) => {
            info!(path = %path.display(), bytes = blob.len(), "loaded pipeline cache");
            Some(blob)
        }
        Err(reason) => {
            warn!(path = %path.display(), ?reason, "pipeline cache rejected, starting empty");
            None
        }
    }
}

/// Writes a blob atomically.
pub fn store_blob(path: &Path, blob: &[u8]) -> hailstone_core::Result<()> {
    let tmp = path.with_extension("tmp");
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&tmp)?;
        file.write_all(blob)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::pipeline_cache(&e)
    })?;
    debug!(path = %path.display(), bytes = blob.len(), "pipeline cache saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> CacheIdentity {
        CacheIdentity {
            vendor_id: 0x10de,
            device_id: 0x2684,
            uuid: [7; 16],
        }
    }

    fn blob(identity: &CacheIdentity, payload: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(HEADER_LEN as u32).to_ne_bytes());
        out.extend_from_slice(&HEADER_VERSION_ONE.to_ne_bytes());
        out.extend_from_slice(&identity.vendor_id.to_ne_bytes());
        out.extend_from_slice(&identity.device_id.to_ne_bytes());
        out.extend_from_slice(&identity.uuid);
        out.resize(HEADER_LEN + payload, 0xab);
        out
    }

    #[test]
    fn test_accepts_matching_header() {
        let id = identity();
        assert_eq!(validate(&blob(&id, 100), &id), Ok(()));
        assert_eq!(parse_header(&blob(&id, 0)).unwrap().identity, id);
    }

    #[test]
    fn test_rejects_foreign_and_malformed_blobs() {
        let id = identity();
        assert_eq!(validate(&blob(&id, 0)[..20], &id), Err(Rejection::Truncated));

        let other = CacheIdentity { device_id: 1, ..id };
        assert_eq!(validate(&blob(&other, 8), &id), Err(Rejection::OtherDevice));

        let other_uuid = CacheIdentity { uuid: [9; 16], ..id };
        assert_eq!(validate(&blob(&other_uuid, 8), &id), Err(Rejection::OtherDevice));

        let mut bad_version = blob(&id, 8);
        bad_version[4..8].copy_from_slice(&2u32.to_ne_bytes());
        assert_eq!(validate(&bad_version, &id), Err(Rejection::Version(2)));

        let mut bad_size = blob(&id, 8);
        bad_size[0..4].copy_from_slice(&16u32.to_ne_bytes());
        assert_eq!(validate(&bad_size, &id), Err(Rejection::HeaderSize(16)));
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/pipeline.cache");
        let id = identity();

        assert!(load_blob(&path, &id).is_none());
        store_blob(&path, &blob(&id, 64)).unwrap();
        assert_eq!(load_blob(&path, &id).unwrap().len(), HEADER_LEN + 64);
        assert!(!path.with_extension("tmp").exists());

        let other = CacheIdentity { vendor_id: 0x1002, ..id };
        assert!(load_blob(&path, &other).is_none());
    }

    #[test]
    fn test_garbage_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.cache");
        fs::write(&path, b"not a cache").unwrap();
        assert!(load_blob(&path, &identity()).is_none());
    }
}
