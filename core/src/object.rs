//! Binary layouts for the stored object kinds.
//!
//! Directory and snapshot payloads are packed arrays of [`FileEntry`]
//! records; file payloads are packed [`ChunkEntry`] records followed by a
//! little-endian total length; snapshot payloads carry a fixed
//! [`SnapshotHeader`] before their entries. Two directory/snapshot
//! generations remain readable; generation 2 is the only one written.
//! All decoders are plain views over the input buffer so they can run
//! concurrently across many objects.

use crate::error::{Error, Result};
use crate::types::{ObjectId, ObjectType};

/// Fixed bytes before the NUL-terminated name in a generation-1 entry:
/// kind(1) + id(32) + mtime(8) + mode(4).
pub const ENTRY_PREFIX_LEN_1: usize = 45;

/// Generation 2 adds btime(8) + uid(4) + gid(4).
pub const ENTRY_PREFIX_LEN_2: usize = 61;

/// id(32) + offset(8) + len(8).
pub const CHUNK_ENTRY_LEN: usize = 48;

pub const SNAPSHOT_NAME_LEN: usize = 256;

/// name(256) + time(8) + len(8) + stored(8).
pub const SNAPSHOT_HEADER_LEN: usize = SNAPSHOT_NAME_LEN + 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Link,
}

impl EntryKind {
    pub fn as_byte(self) -> u8 {
        match self {
            EntryKind::Directory => 0,
            EntryKind::File => 1,
            EntryKind::Link => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(EntryKind::Directory),
            1 => Some(EntryKind::File),
            2 => Some(EntryKind::Link),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::File => write!(f, "file"),
            EntryKind::Link => write!(f, "link"),
        }
    }
}

/// One record of a directory or snapshot payload. Generation-1 records
/// decode with `btime`, `uid` and `gid` zeroed.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub kind: EntryKind,
    pub id: ObjectId,
    pub name: String,
    pub mtime: i64,
    pub btime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

fn malformed(id: &ObjectId, reason: impl Into<String>) -> Error {
    Error::MalformedObject {
        id: id.to_hex(),
        reason: reason.into(),
    }
}

fn read_i64(buf: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    i64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}

fn read_id(buf: &[u8]) -> ObjectId {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&buf[..32]);
    ObjectId::from_bytes(bytes)
}

/// Iterator over the packed entries of a directory or snapshot payload.
pub struct FileEntryIter<'a> {
    owner: ObjectId,
    payload: &'a [u8],
    prefix_len: usize,
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for FileEntryIter<'a> {
    type Item = Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.payload.len() {
            return None;
        }

        match self.decode_next() {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> FileEntryIter<'a> {
    fn decode_next(&mut self) -> Result<FileEntry> {
        let record = &self.payload[self.offset..];
        if record.len() < self.prefix_len + 1 {
            return Err(malformed(&self.owner, "truncated entry"));
        }

        let kind = EntryKind::from_byte(record[0]).ok_or_else(|| {
            malformed(&self.owner, format!("unknown entry kind {:#04x}", record[0]))
        })?;
        let id = read_id(&record[1..]);
        let mtime = read_i64(&record[33..]);

        let (btime, mode, uid, gid) = if self.prefix_len == ENTRY_PREFIX_LEN_1 {
            (0, read_u32(&record[41..]), 0, 0)
        } else {
            (
                read_i64(&record[41..]),
                read_u32(&record[49..]),
                read_u32(&record[53..]),
                read_u32(&record[57..]),
            )
        };

        let name_bytes = &record[self.prefix_len..];
        let name_len = name_bytes
            .iter()
            .position(|&byte| byte == 0)
            .ok_or_else(|| malformed(&self.owner, "entry name is not terminated"))?;
        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| malformed(&self.owner, "entry name is not valid UTF-8"))?
            .to_string();

        self.offset += self.prefix_len + name_len + 1;

        Ok(FileEntry {
            kind,
            id,
            name,
            mtime,
            btime,
            mode,
            uid,
            gid,
        })
    }
}

/// Walk the entries of a directory or snapshot payload, selecting the
/// record layout from the stored object type.
pub fn decode_file_entries<'a>(
    owner: &ObjectId,
    kind: ObjectType,
    payload: &'a [u8],
) -> Result<FileEntryIter<'a>> {
    let prefix_len = match kind {
        ObjectType::Directory1 | ObjectType::Snapshot1 => ENTRY_PREFIX_LEN_1,
        ObjectType::Directory2 | ObjectType::Snapshot2 => ENTRY_PREFIX_LEN_2,
        _ => {
            return Err(malformed(
                owner,
                format!("object type '{kind}' does not carry file entries"),
            ));
        }
    };

    Ok(FileEntryIter {
        owner: *owner,
        payload,
        prefix_len,
        offset: 0,
        failed: false,
    })
}

/// Append one generation-2 entry record. The caller is responsible for
/// validating the name first.
pub fn encode_file_entry(buf: &mut Vec<u8>, entry: &FileEntry) {
    buf.push(entry.kind.as_byte());
    buf.extend_from_slice(entry.id.as_bytes());
    buf.extend_from_slice(&entry.mtime.to_le_bytes());
    buf.extend_from_slice(&entry.btime.to_le_bytes());
    buf.extend_from_slice(&entry.mode.to_le_bytes());
    buf.extend_from_slice(&entry.uid.to_le_bytes());
    buf.extend_from_slice(&entry.gid.to_le_bytes());
    buf.extend_from_slice(entry.name.as_bytes());
    buf.push(0);
}

/// Reference to one chunk of a file, positioned at `offset` within the
/// reconstructed content. Entries are stored in ascending offset order
/// with no gaps or overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub id: ObjectId,
    pub offset: i64,
    pub len: i64,
}

/// Decode a file payload into its chunk entries and the declared total
/// length carried by the trailing eight bytes.
pub fn decode_chunk_entries(owner: &ObjectId, payload: &[u8]) -> Result<(Vec<ChunkEntry>, i64)> {
    if payload.len() < 8 || (payload.len() - 8) % CHUNK_ENTRY_LEN != 0 {
        return Err(malformed(owner, "invalid chunk entry array size"));
    }

    let entry_bytes = &payload[..payload.len() - 8];
    let file_len = read_i64(&payload[payload.len() - 8..]);
    if file_len < 0 {
        return Err(malformed(owner, "negative file length"));
    }

    let mut entries = Vec::with_capacity(entry_bytes.len() / CHUNK_ENTRY_LEN);
    for record in entry_bytes.chunks_exact(CHUNK_ENTRY_LEN) {
        entries.push(ChunkEntry {
            id: read_id(record),
            offset: read_i64(&record[32..]),
            len: read_i64(&record[40..]),
        });
    }

    Ok((entries, file_len))
}

/// Encode a file payload. Fails if the entries are not contiguous from
/// offset zero or do not add up to `file_len`.
pub fn encode_chunk_entries(entries: &[ChunkEntry], file_len: i64) -> Result<Vec<u8>> {
    let mut end = 0i64;
    for entry in entries {
        if entry.offset != end || entry.len < 0 {
            return Err(Error::SizeMismatch {
                id: entry.id.to_hex(),
                expected: end,
                actual: entry.offset,
            });
        }
        end += entry.len;
    }
    if end != file_len {
        return Err(Error::SizeMismatch {
            id: entries.last().map(|e| e.id.to_hex()).unwrap_or_default(),
            expected: file_len,
            actual: end,
        });
    }

    let mut buf = Vec::with_capacity(entries.len() * CHUNK_ENTRY_LEN + 8);
    for entry in entries {
        buf.extend_from_slice(entry.id.as_bytes());
        buf.extend_from_slice(&entry.offset.to_le_bytes());
        buf.extend_from_slice(&entry.len.to_le_bytes());
    }
    buf.extend_from_slice(&file_len.to_le_bytes());
    Ok(buf)
}

/// Fixed header at the front of a snapshot payload.
#[derive(Debug, Clone)]
pub struct SnapshotHeader {
    pub name: String,
    pub time: i64,
    pub len: i64,
    pub stored: i64,
}

/// Decode the snapshot header. A snapshot with no entries after the
/// header is rejected, it does not describe anything.
pub fn decode_snapshot_header(owner: &ObjectId, payload: &[u8]) -> Result<SnapshotHeader> {
    if payload.len() <= SNAPSHOT_HEADER_LEN {
        return Err(malformed(owner, "snapshot payload is too small"));
    }

    let name_bytes = &payload[..SNAPSHOT_NAME_LEN];
    let name_len = name_bytes
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(SNAPSHOT_NAME_LEN);
    let name = std::str::from_utf8(&name_bytes[..name_len])
        .map_err(|_| malformed(owner, "snapshot name is not valid UTF-8"))?
        .to_string();

    Ok(SnapshotHeader {
        name,
        time: read_i64(&payload[SNAPSHOT_NAME_LEN..]),
        len: read_i64(&payload[SNAPSHOT_NAME_LEN + 8..]),
        stored: read_i64(&payload[SNAPSHOT_NAME_LEN + 16..]),
    })
}

pub fn encode_snapshot_header(buf: &mut Vec<u8>, header: &SnapshotHeader) -> Result<()> {
    let name = header.name.as_bytes();
    if name.len() >= SNAPSHOT_NAME_LEN {
        return Err(Error::Other(format!(
            "snapshot name '{}' is too long",
            header.name
        )));
    }
    if name.contains(&0) {
        return Err(Error::Other("snapshot name contains NUL".to_string()));
    }

    buf.extend_from_slice(name);
    buf.resize(buf.len() + SNAPSHOT_NAME_LEN - name.len(), 0);
    buf.extend_from_slice(&header.time.to_le_bytes());
    buf.extend_from_slice(&header.len.to_le_bytes());
    buf.extend_from_slice(&header.stored.to_le_bytes());
    Ok(())
}

/// Validate an entry name before it is used to build a destination path
/// or written into a directory payload. Separators are only tolerated in
/// top-level snapshot entries, which may encode nested relative paths.
pub fn validate_entry_name(name: &str, allow_separators: bool) -> Result<()> {
    let unsafe_name = || Error::UnsafeName {
        name: name.to_string(),
    };

    if name.is_empty() {
        return Err(unsafe_name());
    }
    if name.starts_with('/') || name.starts_with('\\') || std::path::Path::new(name).is_absolute()
    {
        return Err(unsafe_name());
    }
    if name
        .split(['/', '\\'])
        .any(|segment| segment.is_empty() || segment == "..")
    {
        return Err(unsafe_name());
    }
    if !allow_separators && name.contains(['/', '\\']) {
        return Err(unsafe_name());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 32])
    }

    fn encode_entry_gen1(buf: &mut Vec<u8>, kind: u8, id: &ObjectId, name: &[u8]) {
        buf.push(kind);
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&7i64.to_le_bytes());
        buf.extend_from_slice(&0o644u32.to_le_bytes());
        buf.extend_from_slice(name);
        buf.push(0);
    }

    #[test]
    fn decodes_generation_1_entries() {
        let mut payload = Vec::new();
        encode_entry_gen1(&mut payload, 1, &test_id(0xAA), b"a.txt");
        encode_entry_gen1(&mut payload, 0, &test_id(0xBB), b"sub");

        let owner = test_id(1);
        let entries: Vec<_> = decode_file_entries(&owner, ObjectType::Directory1, &payload)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].id, test_id(0xAA));
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].mtime, 7);
        assert_eq!(entries[0].mode, 0o644);
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].name, "sub");
    }

    #[test]
    fn round_trips_generation_2_entries() {
        let entry = FileEntry {
            kind: EntryKind::Link,
            id: test_id(0xCC),
            name: "latest".to_string(),
            mtime: 1_700_000_000,
            btime: 1_600_000_000,
            mode: 0o777,
            uid: 1000,
            gid: 1000,
        };

        let mut payload = Vec::new();
        encode_file_entry(&mut payload, &entry);

        let owner = test_id(2);
        let decoded: Vec<_> = decode_file_entries(&owner, ObjectType::Directory2, &payload)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].kind, EntryKind::Link);
        assert_eq!(decoded[0].id, entry.id);
        assert_eq!(decoded[0].name, entry.name);
        assert_eq!(decoded[0].btime, entry.btime);
        assert_eq!(decoded[0].uid, 1000);
    }

    #[test]
    fn rejects_unknown_entry_kind() {
        let mut payload = Vec::new();
        encode_entry_gen1(&mut payload, 9, &test_id(0xAA), b"x");

        let owner = test_id(3);
        let result: Result<Vec<_>> = decode_file_entries(&owner, ObjectType::Snapshot1, &payload)
            .unwrap()
            .collect();
        assert!(matches!(result, Err(Error::MalformedObject { .. })));
    }

    #[test]
    fn rejects_unterminated_entry_name() {
        let mut payload = Vec::new();
        encode_entry_gen1(&mut payload, 1, &test_id(0xAA), b"x");
        payload.pop();

        let owner = test_id(4);
        let result: Result<Vec<_>> = decode_file_entries(&owner, ObjectType::Directory1, &payload)
            .unwrap()
            .collect();
        assert!(matches!(result, Err(Error::MalformedObject { .. })));
    }

    #[test]
    fn chunk_entries_round_trip() {
        let entries = vec![
            ChunkEntry {
                id: test_id(1),
                offset: 0,
                len: 100,
            },
            ChunkEntry {
                id: test_id(2),
                offset: 100,
                len: 50,
            },
        ];

        let payload = encode_chunk_entries(&entries, 150).unwrap();
        let owner = test_id(5);
        let (decoded, file_len) = decode_chunk_entries(&owner, &payload).unwrap();

        assert_eq!(decoded, entries);
        assert_eq!(file_len, 150);
    }

    #[test]
    fn empty_file_has_zero_length_trailer() {
        let payload = encode_chunk_entries(&[], 0).unwrap();
        let owner = test_id(5);
        let (decoded, file_len) = decode_chunk_entries(&owner, &payload).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(file_len, 0);
    }

    #[test]
    fn rejects_misaligned_chunk_entries() {
        let owner = test_id(6);
        let payload = vec![0u8; CHUNK_ENTRY_LEN + 7];
        assert!(matches!(
            decode_chunk_entries(&owner, &payload),
            Err(Error::MalformedObject { .. })
        ));
    }

    #[test]
    fn rejects_negative_file_length() {
        let owner = test_id(7);
        let payload = (-1i64).to_le_bytes().to_vec();
        assert!(matches!(
            decode_chunk_entries(&owner, &payload),
            Err(Error::MalformedObject { .. })
        ));
    }

    #[test]
    fn encode_rejects_gap_between_chunks() {
        let entries = vec![
            ChunkEntry {
                id: test_id(1),
                offset: 0,
                len: 100,
            },
            ChunkEntry {
                id: test_id(2),
                offset: 120,
                len: 50,
            },
        ];
        assert!(matches!(
            encode_chunk_entries(&entries, 170),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn encode_rejects_wrong_total_length() {
        let entries = vec![ChunkEntry {
            id: test_id(1),
            offset: 0,
            len: 100,
        }];
        assert!(matches!(
            encode_chunk_entries(&entries, 99),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn snapshot_header_round_trip() {
        let header = SnapshotHeader {
            name: "nightly".to_string(),
            time: 1_700_000_000,
            len: 4096,
            stored: 2048,
        };

        let mut payload = Vec::new();
        encode_snapshot_header(&mut payload, &header).unwrap();
        assert_eq!(payload.len(), SNAPSHOT_HEADER_LEN);

        // At least one entry must follow the header.
        encode_file_entry(
            &mut payload,
            &FileEntry {
                kind: EntryKind::File,
                id: test_id(1),
                name: "a".to_string(),
                mtime: 0,
                btime: 0,
                mode: 0o644,
                uid: 0,
                gid: 0,
            },
        );

        let owner = test_id(8);
        let decoded = decode_snapshot_header(&owner, &payload).unwrap();
        assert_eq!(decoded.name, "nightly");
        assert_eq!(decoded.time, 1_700_000_000);
        assert_eq!(decoded.len, 4096);
        assert_eq!(decoded.stored, 2048);
    }

    #[test]
    fn rejects_snapshot_without_entries() {
        let header = SnapshotHeader {
            name: String::new(),
            time: 0,
            len: 0,
            stored: 0,
        };
        let mut payload = Vec::new();
        encode_snapshot_header(&mut payload, &header).unwrap();

        let owner = test_id(9);
        assert!(matches!(
            decode_snapshot_header(&owner, &payload),
            Err(Error::MalformedObject { .. })
        ));
    }

    #[test]
    fn name_validation() {
        assert!(validate_entry_name("a.txt", false).is_ok());
        assert!(validate_entry_name("a/b", true).is_ok());

        assert!(validate_entry_name("", false).is_err());
        assert!(validate_entry_name("/x", true).is_err());
        assert!(validate_entry_name("../x", true).is_err());
        assert!(validate_entry_name("a/../b", true).is_err());
        assert!(validate_entry_name("a/b", false).is_err());
        assert!(validate_entry_name("a\\b", false).is_err());
    }
}
