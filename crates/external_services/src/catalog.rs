//! Shared-memory instrument catalog, read-only at runtime.
//!
//! An out-of-process feed handler maintains a segment of known instrument
//! symbols. We map it read-only and expose enumeration and search. If the
//! segment does not exist yet we create an empty one of the fixed size and
//! serve an empty catalog; a missing catalog is never fatal.
//!
//! Segment layout: a 16-byte header (magic, version, entry count, reserved)
//! followed by fixed 32-byte NUL-padded keys.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

const MAGIC: &[u8; 4] = b"MDIC";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// Fixed key record width; symbols are at most 31 bytes plus NUL padding.
pub const KEY_LEN: usize = 32;

/// Fixed segment size, matching the writer side.
pub const SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

/// Read-only view of the instrument segment.
pub struct InstrumentCatalog {
    map: Option<Mmap>,
    count: usize,
}

impl InstrumentCatalog {
    /// A catalog with no backing segment. Enumeration and search return
    /// empty results.
    pub fn empty() -> Self {
        Self {
            map: None,
            count: 0,
        }
    }

    /// Map an existing segment, or create an empty one and map that.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Catalog segment {:?} not found, creating empty segment", path);
            create_empty_segment(path)?;
        }
        Self::open(path)
    }

    /// Map an existing segment read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < HEADER_LEN {
            return Err(Error::InvalidSegment(format!(
                "segment too small: {} bytes",
                map.len()
            )));
        }
        if &map[0..4] != MAGIC {
            return Err(Error::InvalidSegment("bad magic".to_string()));
        }
        let version = u32::from_le_bytes(map[4..8].try_into().unwrap_or_default());
        if version != VERSION {
            return Err(Error::InvalidSegment(format!("unsupported version {}", version)));
        }

        let count = u32::from_le_bytes(map[8..12].try_into().unwrap_or_default()) as usize;
        let available = (map.len() - HEADER_LEN) / KEY_LEN;
        if count > available {
            return Err(Error::InvalidSegment(format!(
                "entry count {} exceeds segment capacity {}",
                count, available
            )));
        }

        info!("Mapped instrument catalog with {} entries", count);
        Ok(Self {
            map: Some(map),
            count,
        })
    }

    /// Number of stored entries, including any later skipped as malformed.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// All instrument symbols, sorted.
    pub fn instruments(&self) -> Vec<String> {
        let mut out: Vec<String> = self.iter_keys().collect();
        out.sort_unstable();
        out
    }

    /// Case-insensitive substring search over the catalog.
    pub fn search(&self, pattern: &str) -> Vec<String> {
        let needle = pattern.to_lowercase();
        let mut out: Vec<String> = self
            .iter_keys()
            .filter(|key| key.to_lowercase().contains(&needle))
            .collect();
        out.sort_unstable();
        out
    }

    fn iter_keys(&self) -> impl Iterator<Item = String> + '_ {
        let map = self.map.as_deref();
        (0..self.count).filter_map(move |i| {
            let map = map?;
            let start = HEADER_LEN + i * KEY_LEN;
            trim_key(&map[start..start + KEY_LEN])
        })
    }
}

/// Extract the symbol from a fixed NUL-padded record.
///
/// Bytes past the first NUL are ignored, whatever they contain. Empty keys
/// and keys with non-printable bytes are dropped rather than surfaced.
fn trim_key(record: &[u8]) -> Option<String> {
    let end = record.iter().position(|&b| b == 0).unwrap_or(record.len());
    let bytes = &record[..end];
    if bytes.is_empty() || bytes.len() >= KEY_LEN {
        return None;
    }
    if !bytes.iter().all(|&b| (0x20..0x7f).contains(&b)) {
        return None;
    }
    String::from_utf8(bytes.to_vec()).ok()
}

fn create_empty_segment(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(SEGMENT_SIZE)?;
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..8].copy_from_slice(&VERSION.to_le_bytes());
    // count and reserved stay zero
    file.write_all(&header)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn write_segment(path: &Path, keys: &[&[u8]]) {
        create_empty_segment(path).unwrap();
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&(keys.len() as u32).to_le_bytes()).unwrap();
        for (i, key) in keys.iter().enumerate() {
            let mut record = [0u8; KEY_LEN];
            record[..key.len()].copy_from_slice(key);
            file.seek(SeekFrom::Start((HEADER_LEN + i * KEY_LEN) as u64))
                .unwrap();
            file.write_all(&record).unwrap();
        }
        file.flush().unwrap();
    }

    #[test]
    fn test_missing_segment_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        let catalog = InstrumentCatalog::open_or_create(&path).unwrap();
        assert!(catalog.is_empty());
        assert!(catalog.instruments().is_empty());
        assert!(catalog.search("rb").is_empty());
        // A second open maps the segment we just created.
        let again = InstrumentCatalog::open(&path).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_enumerate_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        write_segment(&path, &[b"rb2501", b"cu2412", b"rb2410"]);

        let catalog = InstrumentCatalog::open(&path).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.instruments(), vec!["cu2412", "rb2410", "rb2501"]);
    }

    #[test]
    fn test_search_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        write_segment(&path, &[b"rb2410", b"rb2501", b"cu2412"]);

        let catalog = InstrumentCatalog::open(&path).unwrap();
        assert_eq!(catalog.search("RB"), vec!["rb2410", "rb2501"]);
        assert_eq!(catalog.search("2412"), vec!["cu2412"]);
        assert!(catalog.search("ag").is_empty());
    }

    #[test]
    fn test_malformed_keys_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        // Interior NUL: bytes after the first NUL are padding, whatever follows.
        let interior: &[u8] = b"rb2410\0junk";
        let empty: &[u8] = b"";
        let unprintable: &[u8] = b"rb\x0124";
        write_segment(&path, &[interior, empty, unprintable, b"cu2412"]);

        let catalog = InstrumentCatalog::open(&path).unwrap();
        assert_eq!(catalog.instruments(), vec!["cu2412", "rb2410"]);
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = InstrumentCatalog::empty();
        assert!(catalog.is_empty());
        assert!(catalog.instruments().is_empty());
        assert!(catalog.search("rb").is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        std::fs::write(&path, b"not a catalog segment").unwrap();
        assert!(InstrumentCatalog::open(&path).is_err());
    }
}
