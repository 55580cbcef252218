//! Write-Ahead Log (WAL) implementation for Tagline.
//!
//! This module provides durable write-ahead logging for entity mutations,
//! ensuring a mutation is on disk before it becomes visible to readers.
//!
//! # Architecture
//!
//! Each shard owns one WAL. The write path is:
//!
//! ```text
//! Client → entity lock → WAL append → batch fsync → timeline append → Ack
//! ```
//!
//! # Features
//!
//! - **Batch Writes**: Records of one request are written and synced together
//! - **CRC32 Checksums**: Each record frame is protected by a CRC32 checksum
//! - **Segment Rotation**: Log segments are rotated based on size thresholds
//! - **Crash Recovery**: Records are replayed on open; a torn tail ends a segment
//! - **Truncation**: Segments covered by a checkpoint can be removed
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_tagline::wal::{Wal, WalConfig, WalRecord};
//!
//! let mut wal = Wal::new("/path/to/wal", WalConfig::default())?;
//! let lsns = wal.append_batch(&[WalRecord::append_tags(entity_id, versions)])?;
//!
//! // After a checkpoint covering `lsn`
//! wal.truncate(lsn)?;
//!
//! // On recovery
//! let records = Wal::recover("/path/to/wal")?;
//! ```

use crate::codec::{ByteReader, ByteWriter};
use crate::error::{Result, TagError};
use crate::tag::{current_timestamp_nanos, EntityId, PruneMark, TagVersion, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default number of buffered records before an automatic flush.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default maximum segment size (64 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Largest record payload accepted on read (16 MB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// WAL segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// WAL segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// WAL file magic bytes.
const WAL_MAGIC: [u8; 4] = [b'T', b'W', b'A', b'L']; // "TWAL" for Tagline WAL

/// WAL format version.
const WAL_VERSION: u16 = 2;

/// Frame overhead: length (4) + crc (4).
const FRAME_HEADER_SIZE: usize = 8;

/// Sync mode for WAL durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each batch write (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for WAL behavior.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum number of buffered records before automatic flush.
    pub batch_size: usize,
    /// Maximum size of a single WAL segment file.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl WalConfig {
    /// Creates a new WAL configuration with custom settings.
    pub fn new(batch_size: usize, segment_size: usize, sync_mode: SyncMode) -> Self {
        Self {
            batch_size,
            segment_size,
            sync_mode,
        }
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the segment size threshold.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum WalRecordType {
    CreateEntity = 1,
    AppendTags = 2,
    DeleteEntity = 3,
}

/// A single mutation record in the Write-Ahead Log.
///
/// Versions are logged after the server assigned their timestamps and
/// sequences, together with the retention marks the write triggered, so
/// replay reproduces the exact timeline without consulting any policy.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// Entity creation, including its initial tag versions.
    CreateEntity {
        /// Log sequence number, set by the WAL when appending.
        lsn: u64,
        /// New entity id.
        entity_id: EntityId,
        /// Dataset the entity belongs to.
        dataset: String,
        /// Entity type.
        entity_type: String,
        /// Creation timestamp.
        created_at: Timestamp,
        /// Opaque entity content.
        content: Vec<u8>,
        /// Initial tag versions.
        versions: Vec<TagVersion>,
        /// Retention applied after the versions.
        pruned: Vec<PruneMark>,
    },
    /// Atomic multi-tag append.
    AppendTags {
        /// Log sequence number, set by the WAL when appending.
        lsn: u64,
        /// Target entity.
        entity_id: EntityId,
        /// Versions appended by the request.
        versions: Vec<TagVersion>,
        /// Retention applied after the versions.
        pruned: Vec<PruneMark>,
    },
    /// Entity deletion.
    DeleteEntity {
        /// Log sequence number, set by the WAL when appending.
        lsn: u64,
        /// Deleted entity.
        entity_id: EntityId,
        /// Deletion timestamp.
        deleted_at: Timestamp,
    },
}

impl WalRecord {
    /// Creates an entity-creation record.
    ///
    /// Note: The LSN is set by the WAL when appending.
    pub fn create_entity(
        entity_id: EntityId,
        dataset: impl Into<String>,
        entity_type: impl Into<String>,
        created_at: Timestamp,
        content: Vec<u8>,
        versions: Vec<TagVersion>,
    ) -> Self {
        Self::CreateEntity {
            lsn: 0,
            entity_id,
            dataset: dataset.into(),
            entity_type: entity_type.into(),
            created_at,
            content,
            versions,
            pruned: Vec::new(),
        }
    }

    /// Creates a tag-append record.
    pub fn append_tags(entity_id: EntityId, versions: Vec<TagVersion>) -> Self {
        Self::AppendTags {
            lsn: 0,
            entity_id,
            versions,
            pruned: Vec::new(),
        }
    }

    /// Attaches the retention marks of a create or append. Deletions carry
    /// no versions and ignore them.
    pub fn with_pruned(mut self, marks: Vec<PruneMark>) -> Self {
        match &mut self {
            Self::CreateEntity { pruned, .. } | Self::AppendTags { pruned, .. } => *pruned = marks,
            Self::DeleteEntity { .. } => {}
        }
        self
    }

    /// Creates an entity-deletion record.
    pub fn delete_entity(entity_id: EntityId, deleted_at: Timestamp) -> Self {
        Self::DeleteEntity {
            lsn: 0,
            entity_id,
            deleted_at,
        }
    }

    /// Returns the log sequence number of the record.
    pub fn lsn(&self) -> u64 {
        match self {
            Self::CreateEntity { lsn, .. }
            | Self::AppendTags { lsn, .. }
            | Self::DeleteEntity { lsn, .. } => *lsn,
        }
    }

    /// Sets the log sequence number of the record.
    pub fn set_lsn(&mut self, value: u64) {
        match self {
            Self::CreateEntity { lsn, .. }
            | Self::AppendTags { lsn, .. }
            | Self::DeleteEntity { lsn, .. } => *lsn = value,
        }
    }

    /// Returns the entity the record mutates.
    pub fn entity_id(&self) -> EntityId {
        match self {
            Self::CreateEntity { entity_id, .. }
            | Self::AppendTags { entity_id, .. }
            | Self::DeleteEntity { entity_id, .. } => *entity_id,
        }
    }

    /// Serializes the record payload.
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(64);
        match self {
            Self::CreateEntity {
                lsn,
                entity_id,
                dataset,
                entity_type,
                created_at,
                content,
                versions,
                pruned,
            } => {
                writer.put_u8(WalRecordType::CreateEntity as u8);
                writer.put_u64(*lsn);
                writer.put_entity_id(entity_id);
                writer.put_str(dataset);
                writer.put_str(entity_type);
                writer.put_i64(*created_at);
                writer.put_bytes(content);
                writer.put_versions(versions);
                writer.put_marks(pruned);
            }
            Self::AppendTags {
                lsn,
                entity_id,
                versions,
                pruned,
            } => {
                writer.put_u8(WalRecordType::AppendTags as u8);
                writer.put_u64(*lsn);
                writer.put_entity_id(entity_id);
                writer.put_versions(versions);
                writer.put_marks(pruned);
            }
            Self::DeleteEntity {
                lsn,
                entity_id,
                deleted_at,
            } => {
                writer.put_u8(WalRecordType::DeleteEntity as u8);
                writer.put_u64(*lsn);
                writer.put_entity_id(entity_id);
                writer.put_i64(*deleted_at);
            }
        }
        writer.into_inner()
    }

    /// Deserializes a record payload.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let record_type = reader.get_u8()?;
        let lsn = reader.get_u64()?;
        let entity_id = reader.get_entity_id()?;

        let record = match record_type {
            x if x == WalRecordType::CreateEntity as u8 => Self::CreateEntity {
                lsn,
                entity_id,
                dataset: reader.get_str()?,
                entity_type: reader.get_str()?,
                created_at: reader.get_i64()?,
                content: reader.get_bytes()?,
                versions: reader.get_versions()?,
                pruned: reader.get_marks()?,
            },
            x if x == WalRecordType::AppendTags as u8 => Self::AppendTags {
                lsn,
                entity_id,
                versions: reader.get_versions()?,
                pruned: reader.get_marks()?,
            },
            x if x == WalRecordType::DeleteEntity as u8 => Self::DeleteEntity {
                lsn,
                entity_id,
                deleted_at: reader.get_i64()?,
            },
            other => {
                return Err(TagError::Corrupted(format!(
                    "unknown WAL record type {}",
                    other
                )))
            }
        };
        reader.finish()?;
        Ok(record)
    }
}

/// WAL segment header.
#[derive(Debug, Clone)]
struct SegmentHeader {
    magic: [u8; 4],
    version: u16,
    segment_id: u64,
    created_at: i64,
}

impl SegmentHeader {
    const SIZE: usize = 22; // 4 + 2 + 8 + 8

    fn new(segment_id: u64) -> Self {
        Self {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            segment_id,
            created_at: current_timestamp_nanos(),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != WAL_MAGIC {
            return Err(TagError::InvalidMagic(magic));
        }

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        let version = u16::from_le_bytes(buf);

        if version != WAL_VERSION {
            return Err(TagError::UnsupportedVersion(version));
        }

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let segment_id = u64::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let created_at = i64::from_le_bytes(buf);

        Ok(Self {
            magic,
            version,
            segment_id,
            created_at,
        })
    }
}

/// Write-Ahead Log for entity mutations.
///
/// Provides durable storage for mutations before they are applied to the
/// in-memory timelines, ensuring crash recovery capabilities.
pub struct Wal {
    /// Directory containing WAL segments.
    log_dir: PathBuf,
    /// Current segment file being written to.
    current_segment: BufWriter<File>,
    /// Current segment ID.
    current_segment_id: u64,
    /// Current segment size in bytes.
    current_segment_size: usize,
    /// Next LSN to assign.
    next_lsn: u64,
    /// Highest LSN passed to `truncate`.
    truncated_lsn: u64,
    /// WAL configuration.
    config: WalConfig,
    /// Batch buffer for pending writes.
    batch_buffer: Vec<WalRecord>,
}

impl Wal {
    /// Creates a new WAL in the specified directory.
    ///
    /// If the directory doesn't exist, it will be created.
    /// If there are existing WAL segments, the WAL will continue from the
    /// highest segment ID and LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or accessed.
    pub fn new(log_dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();

        fs::create_dir_all(&log_dir)?;

        let (next_segment_id, next_lsn) = Self::scan_existing_segments(&log_dir)?;

        let segment_path = Self::segment_path(&log_dir, next_segment_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment_path)?;

        let mut writer = BufWriter::new(file);
        SegmentHeader::new(next_segment_id).write_to(&mut writer)?;
        writer.flush()?;

        let batch_capacity = config.batch_size;
        Ok(Self {
            log_dir,
            current_segment: writer,
            current_segment_id: next_segment_id,
            current_segment_size: SegmentHeader::SIZE,
            next_lsn,
            truncated_lsn: 0,
            config,
            batch_buffer: Vec::with_capacity(batch_capacity),
        })
    }

    /// Scans existing segments to determine the next segment ID and LSN.
    fn scan_existing_segments(log_dir: &Path) -> Result<(u64, u64)> {
        let mut max_segment_id: Option<u64> = None;
        let mut max_lsn: u64 = 0;

        for path in Self::segment_files(log_dir)? {
            let Some(id) = Self::parse_segment_id(&path) else {
                continue;
            };
            // Option distinguishes "no segments" from "segment 0"
            if max_segment_id.map_or(true, |max_id| id > max_id) {
                max_segment_id = Some(id);
            }
            if let Ok(records) = Self::read_segment(&path) {
                if let Some(lsn) = records.iter().map(WalRecord::lsn).max() {
                    max_lsn = max_lsn.max(lsn);
                }
            }
        }

        let next_segment_id = max_segment_id.map_or(0, |id| id + 1);
        Ok((next_segment_id, max_lsn + 1))
    }

    /// Generates the path for a segment file.
    fn segment_path(log_dir: &Path, segment_id: u64) -> PathBuf {
        log_dir.join(format!(
            "{}_{:016x}.{}",
            SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
        ))
    }

    /// Lists segment files in a directory, sorted by name (and so by ID).
    fn segment_files(log_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(log_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Parses the segment ID from a segment file path.
    fn parse_segment_id(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&format!("{}_", SEGMENT_PREFIX)))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
    }

    /// Reads all records from a segment file.
    ///
    /// A bad header fails the whole segment. A bad record ends the segment:
    /// the records before it are returned and the rest is treated as a torn
    /// tail.
    fn read_segment(path: &Path) -> Result<Vec<WalRecord>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let _header = SegmentHeader::read_from(&mut reader)?;

        let mut records = Vec::new();
        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "Torn or corrupt WAL record in {} after {} records: {:?}",
                        path.display(),
                        records.len(),
                        e
                    );
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Reads a single record frame from a reader.
    fn read_record<R: Read>(reader: &mut R) -> Result<Option<WalRecord>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(None);
        }
        if len > MAX_RECORD_SIZE {
            return Err(TagError::Corrupted(format!(
                "WAL record length {} exceeds limit {}",
                len, MAX_RECORD_SIZE
            )));
        }

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_le_bytes(crc_buf);

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let actual_crc = crc32fast::hash(&data);
        if actual_crc != expected_crc {
            return Err(TagError::ChecksumMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        WalRecord::from_bytes(&data).map(Some)
    }

    /// Appends a single record to the WAL.
    ///
    /// The record is buffered until the batch is full or [`Wal::sync`] is
    /// called.
    ///
    /// # Errors
    ///
    /// Returns an error if an automatic flush fails.
    pub fn append(&mut self, mut record: WalRecord) -> Result<u64> {
        record.set_lsn(self.next_lsn);
        self.next_lsn += 1;
        let lsn = record.lsn();

        self.batch_buffer.push(record);

        if self.batch_buffer.len() >= self.config.batch_size {
            self.flush_batch()?;
        }

        Ok(lsn)
    }

    /// Appends multiple records as one batch and syncs them immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or fsync fails. In that case none of the
    /// records should be considered committed.
    pub fn append_batch(&mut self, records: &[WalRecord]) -> Result<Vec<u64>> {
        let mut lsns = Vec::with_capacity(records.len());

        for record in records {
            let mut r = record.clone();
            r.set_lsn(self.next_lsn);
            self.next_lsn += 1;
            lsns.push(r.lsn());
            self.batch_buffer.push(r);
        }

        self.flush_batch()?;

        Ok(lsns)
    }

    /// Flushes pending records in the batch buffer to disk.
    fn flush_batch(&mut self) -> Result<()> {
        if self.batch_buffer.is_empty() {
            return Ok(());
        }

        let entries = std::mem::take(&mut self.batch_buffer);
        let frames: Vec<Vec<u8>> = entries.iter().map(WalRecord::to_bytes).collect();

        let batch_size: usize = frames.iter().map(|f| f.len() + FRAME_HEADER_SIZE).sum();
        if self.current_segment_size > SegmentHeader::SIZE
            && self.current_segment_size + batch_size > self.config.segment_size
        {
            self.rotate()?;
        }

        for frame in &frames {
            self.write_frame(frame)?;
        }

        self.current_segment.flush()?;

        match self.config.sync_mode {
            SyncMode::Fsync => {
                self.current_segment.get_ref().sync_all()?;
            }
            SyncMode::Fdatasync => {
                self.current_segment.get_ref().sync_data()?;
            }
            SyncMode::None => {}
        }

        debug!(
            "Flushed {} WAL records to segment {}",
            entries.len(),
            self.current_segment_id
        );

        Ok(())
    }

    /// Writes a single frame to the current segment.
    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let crc = crc32fast::hash(data);

        // Write: length (4) + crc (4) + payload
        self.current_segment
            .write_all(&(data.len() as u32).to_le_bytes())?;
        self.current_segment.write_all(&crc.to_le_bytes())?;
        self.current_segment.write_all(data)?;

        self.current_segment_size += FRAME_HEADER_SIZE + data.len();
        Ok(())
    }

    /// Rotates to a new segment file.
    ///
    /// After rotation every previously written record lives in a closed
    /// segment, which makes it eligible for [`Wal::truncate`].
    pub fn rotate(&mut self) -> Result<()> {
        self.current_segment.flush()?;
        self.current_segment.get_ref().sync_all()?;

        let next_segment_id = self.current_segment_id + 1;
        let segment_path = Self::segment_path(&self.log_dir, next_segment_id);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment_path)?;

        let mut writer = BufWriter::new(file);
        SegmentHeader::new(next_segment_id).write_to(&mut writer)?;
        writer.flush()?;

        self.current_segment = writer;
        self.current_segment_id = next_segment_id;
        self.current_segment_size = SegmentHeader::SIZE;

        debug!("Rotated to new WAL segment: {}", segment_path.display());

        Ok(())
    }

    /// Truncates WAL records up to the given LSN.
    ///
    /// Closed segments whose records all have `lsn <= up_to_lsn` are removed.
    /// The current segment is never removed.
    ///
    /// # Errors
    ///
    /// Returns an error if segment files cannot be listed or deleted.
    pub fn truncate(&mut self, up_to_lsn: u64) -> Result<usize> {
        self.truncated_lsn = up_to_lsn;
        let mut removed = 0;

        for segment_path in Self::segment_files(&self.log_dir)? {
            if let Some(segment_id) = Self::parse_segment_id(&segment_path) {
                if segment_id >= self.current_segment_id {
                    continue;
                }
            }

            let records = match Self::read_segment(&segment_path) {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        "Skipping WAL segment {} due to read error: {:?}",
                        segment_path.display(),
                        e
                    );
                    continue;
                }
            };

            if records.iter().all(|r| r.lsn() <= up_to_lsn) {
                fs::remove_file(&segment_path)?;
                removed += 1;
                debug!("Removed WAL segment: {}", segment_path.display());
            }
        }

        Ok(removed)
    }

    /// Recovers WAL records from the specified directory.
    ///
    /// Scans all segment files and returns all valid records in LSN order.
    /// Segments with unreadable headers are skipped with warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn recover(log_dir: impl AsRef<Path>) -> Result<Vec<WalRecord>> {
        let log_dir = log_dir.as_ref();
        if !log_dir.exists() {
            return Ok(Vec::new());
        }

        let mut all_records = Vec::new();
        for segment_path in Self::segment_files(log_dir)? {
            match Self::read_segment(&segment_path) {
                Ok(records) => {
                    debug!(
                        "Recovered {} records from segment {}",
                        records.len(),
                        segment_path.display()
                    );
                    all_records.extend(records);
                }
                Err(e) => {
                    warn!(
                        "Failed to read WAL segment {}: {:?}",
                        segment_path.display(),
                        e
                    );
                }
            }
        }

        all_records.sort_by_key(WalRecord::lsn);

        debug!("Total recovered WAL records: {}", all_records.len());
        Ok(all_records)
    }

    /// Ensures the next assigned LSN is greater than `lsn`.
    ///
    /// Used after loading a checkpoint whose WAL segments were truncated.
    pub fn advance_lsn(&mut self, lsn: u64) {
        if self.next_lsn <= lsn {
            self.next_lsn = lsn + 1;
        }
    }

    /// Forces a flush of any buffered records.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_batch()
    }

    /// Returns the next LSN to be assigned.
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Returns the highest LSN passed to [`Wal::truncate`].
    pub fn truncated_lsn(&self) -> u64 {
        self.truncated_lsn
    }

    /// Returns the number of pending records in the batch buffer.
    pub fn pending_count(&self) -> usize {
        self.batch_buffer.len()
    }

    /// Returns the current segment ID.
    pub fn current_segment_id(&self) -> u64 {
        self.current_segment_id
    }

    /// Returns the log directory path.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Best effort to flush remaining records
        if let Err(e) = self.flush_batch() {
            warn!("Failed to flush WAL on drop: {:?}", e);
        }
    }
}
