//! Durable pairing of a [`VectorIndex`] with its [`MetadataStore`].
//!
//! The index is stored as a little-endian binary file:
//!
//! ```text
//! magic "FRVI" | version u32 | dimension u32 | count u64 | snapshot id [u8; 16] | count * dimension f32
//! ```
//!
//! The metadata is a JSON document carrying the same snapshot id. Both ids are
//! compared on load so artifacts from different saves are never paired.
//!
//! A [`SnapshotDir`] keeps each saved pair in its own `gen-<uuid>` directory and
//! switches between them by atomically replacing a `CURRENT` pointer file, so a
//! reader sees either the old pair or the new one. An advisory lock on
//! `snapshot.lock` serializes writers across processes and keeps readers out
//! while a writer commits.

use crate::error::{RagError, RagResult};
use crate::vector_db::{MetadataStore, VectorIndex};
use fd_lock::RwLock as FileLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

const INDEX_MAGIC: &[u8; 4] = b"FRVI";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 16;

pub const INDEX_FILE_NAME: &str = "fomc.index";
pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const CURRENT_FILE_NAME: &str = "CURRENT";
pub const LOCK_FILE_NAME: &str = "snapshot.lock";
const GENERATION_PREFIX: &str = "gen-";

/// Locations of the two artifacts that make up a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub index: PathBuf,
    pub metadata: PathBuf,
}

impl SnapshotPaths {
    pub fn new(index: impl Into<PathBuf>, metadata: impl Into<PathBuf>) -> Self {
        SnapshotPaths {
            index: index.into(),
            metadata: metadata.into(),
        }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join(INDEX_FILE_NAME), dir.join(METADATA_FILE_NAME))
    }
}

/// A directory holding committed snapshot generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDir {
    root: PathBuf,
}

impl SnapshotDir {
    pub fn open(root: impl Into<PathBuf>) -> RagResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(SnapshotDir { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_file(&self) -> RagResult<FileLock<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE_NAME))?;
        Ok(FileLock::new(file))
    }

    /// Runs `f` holding the shared lock. Blocks while a writer holds the lock.
    pub fn read_locked<T>(&self, f: impl FnOnce(&SnapshotDir) -> RagResult<T>) -> RagResult<T> {
        let lock = self.lock_file()?;
        let _guard = lock.read()?;
        f(self)
    }

    /// Runs `f` holding the exclusive lock.
    pub fn write_locked<T>(&self, f: impl FnOnce(&SnapshotDir) -> RagResult<T>) -> RagResult<T> {
        let mut lock = self.lock_file()?;
        let _guard = lock.write()?;
        f(self)
    }

    /// Artifact paths of the committed generation, or `None` before the first commit.
    pub fn current(&self) -> RagResult<Option<SnapshotPaths>> {
        let pointer = match fs::read_to_string(self.root.join(CURRENT_FILE_NAME)) {
            Ok(pointer) => pointer,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let name = pointer.trim();
        if !is_generation_name(name) {
            return Err(RagError::SnapshotCorrupt(format!(
                "{CURRENT_FILE_NAME} names '{name}', which is not a snapshot generation"
            )));
        }
        Ok(Some(SnapshotPaths::in_dir(self.root.join(name))))
    }

    /// Loads the committed generation.
    pub fn load(&self) -> RagResult<(VectorIndex, MetadataStore)> {
        let Some(paths) = self.current()? else {
            return Err(RagError::SnapshotNotFound(self.root.join(CURRENT_FILE_NAME)));
        };
        load(&paths).map_err(|e| match e {
            RagError::SnapshotNotFound(missing) => RagError::SnapshotCorrupt(format!(
                "committed snapshot is missing '{}'",
                missing.display()
            )),
            other => other,
        })
    }

    /// Saves a new generation and makes it current. Call with the exclusive lock held.
    pub fn commit(&self, index: &VectorIndex, metadata: &MetadataStore) -> RagResult<SnapshotPaths> {
        let name = format!("{GENERATION_PREFIX}{}", Uuid::new_v4().simple());
        let paths = SnapshotPaths::in_dir(self.root.join(&name));
        save(index, metadata, &paths)?;

        let mut pointer = NamedTempFile::new_in(&self.root)?;
        pointer.write_all(name.as_bytes())?;
        pointer.as_file().sync_all()?;
        pointer.persist(self.root.join(CURRENT_FILE_NAME)).map_err(|e| e.error)?;

        tracing::debug!(generation = %name, entries = index.len(), "snapshot committed");
        self.prune_generations(&name);
        Ok(paths)
    }

    /// Removes every generation except `keep`, including ones left by interrupted commits.
    fn prune_generations(&self, keep: &str) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "could not list snapshot generations");
                return;
            }
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if name != keep && name.starts_with(GENERATION_PREFIX) {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    tracing::warn!(generation = name, error = %e, "could not remove old snapshot generation");
                }
            }
        }
    }
}

fn is_generation_name(name: &str) -> bool {
    name.strip_prefix(GENERATION_PREFIX)
        .is_some_and(|id| Uuid::parse_str(id).is_ok())
}

#[derive(Serialize)]
struct MetadataFileRef<'a> {
    version: u32,
    snapshot_id: Uuid,
    paragraphs: &'a [String],
}

#[derive(Deserialize)]
struct MetadataFile {
    version: u32,
    snapshot_id: Uuid,
    paragraphs: Vec<String>,
}

/// Writes both artifacts, replacing any earlier snapshot at the same paths.
pub fn save(index: &VectorIndex, metadata: &MetadataStore, paths: &SnapshotPaths) -> RagResult<()> {
    if index.len() != metadata.len() {
        return Err(RagError::SnapshotCorrupt(format!(
            "refusing to save {} vectors with {} paragraphs",
            index.len(),
            metadata.len()
        )));
    }

    let snapshot_id = Uuid::new_v4();

    let index_tmp = temp_file_beside(&paths.index)?;
    {
        let mut writer = BufWriter::new(index_tmp.as_file());
        write_index(&mut writer, index, snapshot_id)?;
        writer.flush()?;
    }
    index_tmp.as_file().sync_all()?;

    let metadata_tmp = temp_file_beside(&paths.metadata)?;
    {
        let mut writer = BufWriter::new(metadata_tmp.as_file());
        let document = MetadataFileRef {
            version: FORMAT_VERSION,
            snapshot_id,
            paragraphs: metadata.paragraphs(),
        };
        serde_json::to_writer(&mut writer, &document).map_err(std::io::Error::from)?;
        writer.flush()?;
    }
    metadata_tmp.as_file().sync_all()?;

    index_tmp.persist(&paths.index).map_err(|e| e.error)?;
    metadata_tmp.persist(&paths.metadata).map_err(|e| e.error)?;

    tracing::debug!(
        entries = index.len(),
        %snapshot_id,
        index = %paths.index.display(),
        "snapshot saved"
    );
    Ok(())
}

/// Reads both artifacts and verifies they belong together.
pub fn load(paths: &SnapshotPaths) -> RagResult<(VectorIndex, MetadataStore)> {
    for path in [&paths.index, &paths.metadata] {
        if !path.exists() {
            return Err(RagError::SnapshotNotFound(path.clone()));
        }
    }

    let mut reader = BufReader::new(File::open(&paths.index)?);
    let (index, index_id) = read_index(&mut reader)?;

    let metadata_file: MetadataFile = serde_json::from_reader(BufReader::new(File::open(&paths.metadata)?))
        .map_err(|e| RagError::SnapshotCorrupt(format!("metadata: {e}")))?;

    if metadata_file.version != FORMAT_VERSION {
        return Err(RagError::SnapshotCorrupt(format!(
            "unsupported metadata version {}",
            metadata_file.version
        )));
    }
    if metadata_file.snapshot_id != index_id {
        return Err(RagError::SnapshotCorrupt(format!(
            "index snapshot {} does not match metadata snapshot {}",
            index_id, metadata_file.snapshot_id
        )));
    }
    if metadata_file.paragraphs.len() != index.len() {
        return Err(RagError::SnapshotCorrupt(format!(
            "index holds {} vectors but metadata holds {} paragraphs",
            index.len(),
            metadata_file.paragraphs.len()
        )));
    }

    Ok((index, MetadataStore::from_paragraphs(metadata_file.paragraphs)))
}

fn temp_file_beside(target: &Path) -> RagResult<NamedTempFile> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    Ok(NamedTempFile::new_in(dir)?)
}

fn write_index<W: Write>(writer: &mut W, index: &VectorIndex, snapshot_id: Uuid) -> RagResult<()> {
    let dimension = u32::try_from(index.dimension())
        .map_err(|_| RagError::InvalidArgument(format!("dimension {} too large", index.dimension())))?;

    writer.write_all(INDEX_MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&dimension.to_le_bytes())?;
    writer.write_all(&(index.len() as u64).to_le_bytes())?;
    writer.write_all(snapshot_id.as_bytes())?;
    for row in index.rows() {
        for value in row.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_index<R: Read>(reader: &mut R) -> RagResult<(VectorIndex, Uuid)> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| RagError::SnapshotCorrupt(format!("index header: {e}")))?;

    if &header[0..4] != INDEX_MAGIC {
        return Err(RagError::SnapshotCorrupt("index file has wrong magic".to_string()));
    }
    let version = le_u32(&header[4..8]);
    if version != FORMAT_VERSION {
        return Err(RagError::SnapshotCorrupt(format!("unsupported index version {version}")));
    }
    let dimension = le_u32(&header[8..12]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header[12..20]);
    let count = u64::from_le_bytes(count_bytes);
    let snapshot_id = Uuid::from_slice(&header[20..36])
        .map_err(|e| RagError::SnapshotCorrupt(e.to_string()))?;

    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;

    let expected_len = usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(dimension))
        .and_then(|n| n.checked_mul(size_of::<f32>()));
    if expected_len != Some(body.len()) {
        return Err(RagError::SnapshotCorrupt(format!(
            "index declares {count} vectors of dimension {dimension} but carries {} bytes",
            body.len()
        )));
    }

    let data: Vec<f32> = body
        .chunks_exact(size_of::<f32>())
        .map(|b| f32::from_bits(le_u32(b)))
        .collect();
    let index = VectorIndex::from_raw(dimension, data)?;
    Ok((index, snapshot_id))
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_db::Embedding;
    use ndarray::array;
    use tempfile::tempdir;

    fn sample() -> (VectorIndex, MetadataStore) {
        let mut index = VectorIndex::new(3);
        let vectors: Vec<Embedding> = vec![
            array![0.0, 1.0, 0.0],
            array![1.0, 0.5, -2.0],
            array![0.25, 0.25, 0.25],
        ];
        index.insert(&vectors).unwrap();
        let mut metadata = MetadataStore::new();
        metadata.append(["alpha", "beta", "gamma"].map(String::from));
        (index, metadata)
    }

    #[test]
    fn test_save_then_load_behaves_identically() -> RagResult<()> {
        let dir = tempdir()?;
        let paths = SnapshotPaths::in_dir(dir.path());
        let (index, metadata) = sample();
        save(&index, &metadata, &paths)?;

        let (loaded_index, loaded_metadata) = load(&paths)?;
        assert_eq!(loaded_index.len(), 3);
        assert_eq!(loaded_index.dimension(), 3);
        assert_eq!(loaded_metadata, metadata);

        for query in [array![0.0, 0.0, 0.0], array![1.0, 0.0, -1.0], array![9.0, 9.0, 9.0]] {
            assert_eq!(index.search(&query, 3)?, loaded_index.search(&query, 3)?);
        }
        Ok(())
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() -> RagResult<()> {
        let dir = tempdir()?;
        let paths = SnapshotPaths::in_dir(dir.path());
        let (index, metadata) = sample();
        save(&index, &metadata, &paths)?;
        save(&VectorIndex::new(3), &MetadataStore::new(), &paths)?;

        let (loaded_index, loaded_metadata) = load(&paths)?;
        assert!(loaded_index.is_empty());
        assert!(loaded_metadata.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_missing_artifacts() -> RagResult<()> {
        let dir = tempdir()?;
        let paths = SnapshotPaths::in_dir(dir.path());
        assert!(matches!(load(&paths), Err(RagError::SnapshotNotFound(_))));

        let (index, metadata) = sample();
        save(&index, &metadata, &paths)?;
        fs::remove_file(&paths.metadata)?;
        match load(&paths) {
            Err(RagError::SnapshotNotFound(path)) => assert_eq!(path, paths.metadata),
            other => panic!("expected SnapshotNotFound, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_load_detects_count_divergence() -> RagResult<()> {
        let dir = tempdir()?;
        let paths = SnapshotPaths::in_dir(dir.path());
        let (index, metadata) = sample();
        save(&index, &metadata, &paths)?;

        // Drop one paragraph while keeping the snapshot id intact.
        let mut document: serde_json::Value = serde_json::from_str(&fs::read_to_string(&paths.metadata)?).unwrap();
        document["paragraphs"].as_array_mut().unwrap().pop();
        fs::write(&paths.metadata, document.to_string())?;

        assert!(matches!(load(&paths), Err(RagError::SnapshotCorrupt(_))));
        Ok(())
    }

    #[test]
    fn test_load_detects_mixed_snapshots() -> RagResult<()> {
        let dir = tempdir()?;
        let first = SnapshotPaths::in_dir(dir.path().join("first"));
        let second = SnapshotPaths::in_dir(dir.path().join("second"));
        let (index, metadata) = sample();
        save(&index, &metadata, &first)?;
        save(&index, &metadata, &second)?;

        let mixed = SnapshotPaths::new(&first.index, &second.metadata);
        assert!(matches!(load(&mixed), Err(RagError::SnapshotCorrupt(_))));
        Ok(())
    }

    #[test]
    fn test_load_rejects_truncated_index() -> RagResult<()> {
        let dir = tempdir()?;
        let paths = SnapshotPaths::in_dir(dir.path());
        let (index, metadata) = sample();
        save(&index, &metadata, &paths)?;

        let bytes = fs::read(&paths.index)?;
        fs::write(&paths.index, &bytes[..bytes.len() - 2])?;
        assert!(matches!(load(&paths), Err(RagError::SnapshotCorrupt(_))));

        fs::write(&paths.index, b"FR")?;
        assert!(matches!(load(&paths), Err(RagError::SnapshotCorrupt(_))));
        Ok(())
    }

    #[test]
    fn test_save_refuses_misaligned_pair() {
        let dir = tempdir().unwrap();
        let paths = SnapshotPaths::in_dir(dir.path());
        let (index, _) = sample();
        assert!(matches!(
            save(&index, &MetadataStore::new(), &paths),
            Err(RagError::SnapshotCorrupt(_))
        ));
        assert!(!paths.index.exists());
        assert!(!paths.metadata.exists());
    }

    #[test]
    fn test_snapshot_dir_before_first_commit() -> RagResult<()> {
        let dir = tempdir()?;
        let snapshots = SnapshotDir::open(dir.path().join("snapshot"))?;
        assert!(snapshots.current()?.is_none());
        assert!(matches!(snapshots.load(), Err(RagError::SnapshotNotFound(_))));
        Ok(())
    }

    #[test]
    fn test_commit_switches_generation_and_prunes_old_ones() -> RagResult<()> {
        let dir = tempdir()?;
        let snapshots = SnapshotDir::open(dir.path())?;
        let (index, metadata) = sample();

        let first = snapshots.write_locked(|s| s.commit(&index, &metadata))?;
        // leftover from a commit that died before switching CURRENT
        let stale = dir.path().join(format!("{GENERATION_PREFIX}{}", Uuid::new_v4().simple()));
        fs::create_dir(&stale)?;
        fs::write(stale.join(INDEX_FILE_NAME), b"partial")?;

        let (loaded, _) = snapshots.read_locked(|s| s.load())?;
        assert_eq!(loaded.len(), 3);

        let second = snapshots.write_locked(|s| s.commit(&VectorIndex::new(3), &MetadataStore::new()))?;
        assert_ne!(first, second);
        assert_eq!(snapshots.current()?, Some(second.clone()));
        assert!(snapshots.load()?.0.is_empty());
        assert!(!first.index.exists());
        assert!(!stale.exists());
        assert!(second.index.exists());
        Ok(())
    }

    #[test]
    fn test_snapshot_dir_detects_damaged_generation() -> RagResult<()> {
        let dir = tempdir()?;
        let snapshots = SnapshotDir::open(dir.path())?;
        let (index, metadata) = sample();
        let paths = snapshots.commit(&index, &metadata)?;

        fs::remove_file(&paths.metadata)?;
        assert!(matches!(snapshots.load(), Err(RagError::SnapshotCorrupt(_))));

        fs::write(dir.path().join(CURRENT_FILE_NAME), "../elsewhere")?;
        assert!(matches!(snapshots.current(), Err(RagError::SnapshotCorrupt(_))));
        Ok(())
    }
}
