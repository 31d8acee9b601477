//! Directory serializer.
//!
//! A directory listing is a newline-delimited JSON stream, stored as a
//! regular object: a literal `DIRECTORY:v1` marker line, then one JSON
//! line per entry (or per bundle of small files). Entries are written in
//! canonical name-sorted order, the same order the hash cache assumes.

use serde::{Deserialize, Serialize};

use crate::error::{KopiaError, Result};

use super::object_manager::{ObjectId, ObjectManager, ObjectWriter, ObjectWriterOptions};

pub const DIRECTORY_MARKER: &str = "DIRECTORY:v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Socket,
    Device,
    Pipe,
}

/// A single filesystem entry, as recorded on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub etype: EntryType,
    pub mode: u32,
    pub mtime_ns: i64,
    pub uid: u32,
    pub gid: u32,
    /// Only meaningful for `EntryType::File`.
    pub size: Option<u64>,
    pub object: ObjectId,
}

/// Per-child metadata inside a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundledChild {
    pub name: String,
    pub mode: u32,
    pub mtime_ns: i64,
    pub uid: u32,
    pub gid: u32,
    pub offset: u64,
    pub length: u64,
}

/// A bundle of small regular files sharing one storage object, keyed by
/// `year * 100 + month` of their `mtime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub bucket: u32,
    pub object: ObjectId,
    pub declared_size: u64,
    pub children: Vec<BundledChild>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "k")]
enum Record {
    #[serde(rename = "e")]
    Entry(EntryRecord),
    #[serde(rename = "b")]
    Bundle(BundleRecord),
}

impl Record {
    fn sort_key(&self) -> &str {
        match self {
            Record::Entry(e) => &e.name,
            // A bundle has no single name of its own; order it by its
            // first child so bundle placement still participates in the
            // caller's sorted-name invariant.
            Record::Bundle(b) => b.children.first().map(|c| c.name.as_str()).unwrap_or(""),
        }
    }
}

/// Streaming directory writer enforcing strictly-increasing entry order.
pub struct DirectoryWriter {
    writer: ObjectWriter,
    last_key: Option<String>,
}

impl DirectoryWriter {
    pub fn new(object_manager: &ObjectManager, options: ObjectWriterOptions) -> Self {
        let mut writer = object_manager.new_writer(options);
        writer
            .write(DIRECTORY_MARKER.as_bytes())
            .expect("writing to a freshly created ObjectWriter cannot fail");
        writer.write(b"\n").expect("writing a single newline cannot fail");
        Self { writer, last_key: None }
    }

    fn write_record(&mut self, record: Record) -> Result<()> {
        let key = record.sort_key().to_string();
        if let Some(last) = &self.last_key {
            if key.as_str() <= last.as_str() {
                return Err(KopiaError::Malformed(format!(
                    "directory entries out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }
        self.last_key = Some(key);
        let line = serde_json::to_vec(&record).map_err(|e| KopiaError::Malformed(e.to_string()))?;
        self.writer.write(&line)?;
        self.writer.write(b"\n")
    }

    pub fn write_entry(&mut self, entry: EntryRecord) -> Result<()> {
        self.write_record(Record::Entry(entry))
    }

    pub fn write_bundle(&mut self, bundle: BundleRecord) -> Result<()> {
        self.write_record(Record::Bundle(bundle))
    }

    pub fn finish(self) -> Result<ObjectId> {
        self.writer.result(true)
    }
}

/// A flattened, read-facing directory entry: bundled children are
/// presented exactly like ordinary entries, with their object id
/// rewritten to a `Section` view into the bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub etype: EntryType,
    pub mode: u32,
    pub mtime_ns: i64,
    pub uid: u32,
    pub gid: u32,
    pub size: Option<u64>,
    pub object: ObjectId,
}

pub struct DirectoryReader {
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryReader {
    pub fn read(object_manager: &ObjectManager, id: &ObjectId) -> Result<Self> {
        let mut reader = object_manager.open(id)?;
        let mut buf = Vec::with_capacity(reader.len() as usize);
        std::io::Read::read_to_end(&mut reader, &mut buf)?;

        let mut lines = buf.split(|&b| b == b'\n').filter(|l| !l.is_empty());
        let marker = lines
            .next()
            .ok_or_else(|| KopiaError::Malformed("empty directory object".into()))?;
        if marker != DIRECTORY_MARKER.as_bytes() {
            return Err(KopiaError::Malformed("missing DIRECTORY:v1 marker".into()));
        }

        let mut entries = Vec::new();
        for line in lines {
            let record: Record =
                serde_json::from_slice(line).map_err(|e| KopiaError::Malformed(format!("directory entry: {}", e)))?;
            match record {
                Record::Entry(e) => entries.push(DirectoryEntry {
                    name: e.name,
                    etype: e.etype,
                    mode: e.mode,
                    mtime_ns: e.mtime_ns,
                    uid: e.uid,
                    gid: e.gid,
                    size: e.size,
                    object: e.object,
                }),
                Record::Bundle(b) => {
                    let total: u64 = b.children.iter().map(|c| c.length).sum();
                    if total != b.declared_size {
                        return Err(KopiaError::InconsistentSize(format!(
                            "bundle declares {} bytes but children sum to {}",
                            b.declared_size, total
                        )));
                    }
                    for child in &b.children {
                        entries.push(DirectoryEntry {
                            name: child.name.clone(),
                            etype: EntryType::File,
                            mode: child.mode,
                            mtime_ns: child.mtime_ns,
                            uid: child.uid,
                            gid: child.gid,
                            size: Some(child.length),
                            object: ObjectId::Section {
                                start: child.offset,
                                length: child.length,
                                base: Box::new(b.object.clone()),
                            },
                        });
                    }
                }
            }
        }

        Ok(Self { entries })
    }
}

/// `year * 100 + month` bucket used to group small files for bundling.
/// `mtime_ns` is nanoseconds since the Unix epoch, UTC.
pub fn bundle_bucket(mtime_ns: i64) -> u32 {
    let secs = mtime_ns.div_euclid(1_000_000_000);
    let datetime = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
        .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap());
    use chrono::Datelike;
    (datetime.year() as u32) * 100 + datetime.month()
}

/// Files at or below this size are eligible for bundling.
pub const BUNDLE_SIZE_THRESHOLD: u64 = 64 * 1024;
