//! Stable binary encoding for persisted overlay records.
//!
//! Records carry an explicit format version so a reader that did not
//! produce a record can still decode it (or reject it loudly). The
//! payloads are small; `bincode` keeps them compact without a schema
//! compiler.

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::{OsStrExt as _, OsStringExt as _};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::inodes::dir::{DirContents, DirEntry};
use crate::inodes::{InodeNumber, InodeTimestamps};
use crate::scm::{Hash, HASH_LEN};

/// Version written into every record. Bump when the layout changes.
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct DirEntryRecord {
    name: Vec<u8>,
    mode: u32,
    number: u64,
    hash: Option<[u8; HASH_LEN]>,
}

#[derive(Serialize, Deserialize)]
struct DirRecord {
    format: u32,
    tree_hash: Option<[u8; HASH_LEN]>,
    timestamps: InodeTimestamps,
    entries: Vec<DirEntryRecord>,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    format: u32,
    timestamps: InodeTimestamps,
    content: Vec<u8>,
}

/// A decoded overlay directory record.
pub struct LoadedOverlayDir {
    /// The directory's entries, none loaded.
    pub entries: DirContents,
    /// The directory's own source-control hash when it was last saved
    /// non-materialized; `None` when it was materialized.
    pub tree_hash: Option<Hash>,
    /// Timestamps at last save.
    pub timestamps: InodeTimestamps,
}

/// A decoded overlay file record.
pub struct LoadedOverlayFile {
    /// File content bytes.
    pub content: Bytes,
    /// Timestamps at last save.
    pub timestamps: InodeTimestamps,
}

fn encode_error(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Serialize a directory's entries and state.
#[must_use]
pub fn encode_dir(
    entries: &DirContents,
    tree_hash: Option<Hash>,
    timestamps: InodeTimestamps,
) -> Bytes {
    let record = DirRecord {
        format: FORMAT_VERSION,
        tree_hash: tree_hash.map(|h| *h.as_bytes()),
        timestamps,
        entries: entries
            .iter()
            .map(|(name, entry)| DirEntryRecord {
                name: name.as_bytes().to_vec(),
                mode: entry.mode(),
                number: entry.number().0,
                hash: entry.hash().map(|h| *h.as_bytes()),
            })
            .collect(),
    };
    // Serialization of an in-memory record cannot fail.
    Bytes::from(bincode::serialize(&record).expect("overlay dir record serialization"))
}

/// Deserialize a directory record.
pub fn decode_dir(data: &[u8]) -> io::Result<LoadedOverlayDir> {
    let record: DirRecord = bincode::deserialize(data).map_err(encode_error)?;
    if record.format != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported overlay dir format {}", record.format),
        ));
    }
    let mut entries = DirContents::new();
    for entry in record.entries {
        entries.insert(
            OsString::from_vec(entry.name),
            DirEntry::new(
                entry.mode,
                InodeNumber(entry.number),
                entry.hash.map(Hash::from_bytes),
            ),
        );
    }
    Ok(LoadedOverlayDir {
        entries,
        tree_hash: record.tree_hash.map(Hash::from_bytes),
        timestamps: record.timestamps,
    })
}

/// Serialize a file's content and timestamps.
#[must_use]
pub fn encode_file(content: &[u8], timestamps: InodeTimestamps) -> Bytes {
    let record = FileRecord {
        format: FORMAT_VERSION,
        timestamps,
        content: content.to_vec(),
    };
    Bytes::from(bincode::serialize(&record).expect("overlay file record serialization"))
}

/// Deserialize a file record.
pub fn decode_file(data: &[u8]) -> io::Result<LoadedOverlayFile> {
    let record: FileRecord = bincode::deserialize(data).map_err(encode_error)?;
    if record.format != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported overlay file format {}", record.format),
        ));
    }
    Ok(LoadedOverlayFile {
        content: Bytes::from(record.content),
        timestamps: record.timestamps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn dir_round_trip() {
        let mut entries = DirContents::new();
        entries.insert(
            OsString::from("file"),
            DirEntry::new(libc::S_IFREG | 0o644, InodeNumber(12), None),
        );
        entries.insert(
            OsString::from("sub"),
            DirEntry::new(
                libc::S_IFDIR | 0o755,
                InodeNumber(13),
                Some(Hash::digest(b"sub")),
            ),
        );
        let ts = InodeTimestamps::new(SystemTime::now());
        let encoded = encode_dir(&entries, Some(Hash::digest(b"self")), ts);

        let decoded = decode_dir(&encoded).unwrap();
        assert_eq!(decoded.tree_hash, Some(Hash::digest(b"self")));
        assert_eq!(decoded.timestamps, ts);
        assert_eq!(decoded.entries.len(), 2);
        let file = &decoded.entries[std::ffi::OsStr::new("file")];
        assert!(file.is_materialized());
        assert_eq!(file.number(), InodeNumber(12));
        let sub = &decoded.entries[std::ffi::OsStr::new("sub")];
        assert_eq!(sub.hash(), Some(Hash::digest(b"sub")));
        assert!(sub.is_directory());
    }

    #[test]
    fn file_round_trip() {
        let ts = InodeTimestamps::new(SystemTime::now());
        let encoded = encode_file(b"hello", ts);
        let decoded = decode_file(&encoded).unwrap();
        assert_eq!(&decoded.content[..], b"hello");
        assert_eq!(decoded.timestamps, ts);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_dir(b"\xff\xff\xff").is_err());
    }
}
