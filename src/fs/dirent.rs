//! Raw on-disk directory-entry layout: a directory is just a file whose
//! bytes are a sequence of these fixed-size records. Parsing one record is
//! a data-format concern, not name *resolution* (searching records for a
//! match), so it stays in scope even though §1 excludes the latter.

use crate::config::{DIRENT_SIZE, NAME_MAX};

/// One parsed directory-entry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_sector: u32,
    pub name: String,
}

/// Parse a [`DIRENT_SIZE`]-byte record. Returns `None` if the in-use flag
/// is clear (a deleted or never-written slot) or the name isn't valid
/// UTF-8.
pub fn parse(raw: &[u8; DIRENT_SIZE]) -> Option<DirEntry> {
    let in_use = raw[DIRENT_SIZE - 1] != 0;
    if !in_use {
        return None;
    }
    let inode_sector = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let name_bytes = &raw[4..4 + NAME_MAX + 1];
    let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let name = std::str::from_utf8(&name_bytes[..nul]).ok()?.to_string();
    Some(DirEntry { inode_sector, name })
}

/// Serialize one record, used by test scaffolding that builds directory
/// contents directly rather than through a name-resolution layer.
pub fn serialize(entry: &DirEntry) -> [u8; DIRENT_SIZE] {
    let mut raw = [0u8; DIRENT_SIZE];
    raw[0..4].copy_from_slice(&entry.inode_sector.to_le_bytes());
    let name_bytes = entry.name.as_bytes();
    let n = name_bytes.len().min(NAME_MAX + 1);
    raw[4..4 + n].copy_from_slice(&name_bytes[..n]);
    raw[DIRENT_SIZE - 1] = 1;
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let entry = DirEntry {
            inode_sector: 42,
            name: "notes.txt".to_string(),
        };
        let raw = serialize(&entry);
        assert_eq!(parse(&raw), Some(entry));
    }

    #[test]
    fn an_unused_slot_parses_to_none() {
        let raw = [0u8; DIRENT_SIZE];
        assert_eq!(parse(&raw), None);
    }
}
