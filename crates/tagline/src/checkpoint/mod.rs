//! Shard checkpoints.
//!
//! A checkpoint is a full image of a shard's live entities and their retained
//! versions, tagged with the last WAL LSN it covers. Once written, WAL
//! segments whose records all fall at or below that LSN can be removed.
//!
//! # File Format
//!
//! ```text
//! magic "TCKP" (4) | version u16 (2) | payload | crc32(payload) u32 (4)
//!
//! payload:
//!   lsn u64 | entity count u32 | entity*
//!
//! entity:
//!   id (16) | dataset str | type str | created_at i64 | content bytes
//!   | next_sequence u64 | last_write i64 | versions
//! ```
//!
//! Files are written to a temporary path, synced, then renamed over the
//! previous checkpoint.

use crate::codec::{ByteReader, ByteWriter};
use crate::error::{Result, TagError};
use crate::timeline::{Entity, TagTimeline};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Checkpoint file name inside a shard directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.ckpt";

/// Checkpoint magic bytes.
const CHECKPOINT_MAGIC: [u8; 4] = [b'T', b'C', b'K', b'P'];

/// Checkpoint format version.
const CHECKPOINT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 6;
const FOOTER_SIZE: usize = 4;

/// Decoded contents of a checkpoint file.
#[derive(Debug, Clone)]
pub struct ShardCheckpoint {
    /// Highest WAL LSN reflected in the image.
    pub lsn: u64,
    /// Live entities.
    pub entities: Vec<Entity>,
}

/// Path of the checkpoint file for a shard directory.
pub fn checkpoint_path(shard_dir: &Path) -> PathBuf {
    shard_dir.join(CHECKPOINT_FILE)
}

/// Writes a checkpoint atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written, synced or renamed. The
/// previous checkpoint is left untouched in that case.
pub fn write(path: &Path, lsn: u64, entities: &[Entity]) -> Result<()> {
    let mut payload = ByteWriter::with_capacity(4096);
    payload.put_u64(lsn);
    payload.put_u32(entities.len() as u32);
    for entity in entities {
        payload.put_entity_id(&entity.id);
        payload.put_str(&entity.dataset);
        payload.put_str(&entity.entity_type);
        payload.put_i64(entity.created_at);
        payload.put_bytes(&entity.content);
        payload.put_u64(entity.timeline.next_sequence());
        payload.put_i64(entity.timeline.last_write());
        let versions: Vec<_> = entity.timeline.all_versions().cloned().collect();
        payload.put_versions(&versions);
    }
    let payload = payload.into_inner();
    let crc = crc32fast::hash(&payload);

    let tmp_path = path.with_extension("ckpt.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&CHECKPOINT_MAGIC)?;
        file.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    // Persist the rename itself.
    #[cfg(unix)]
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }

    info!(
        "Wrote checkpoint {} at lsn {} with {} entities",
        path.display(),
        lsn,
        entities.len()
    );
    Ok(())
}

/// Loads a checkpoint, or `None` if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but is damaged.
pub fn load(path: &Path) -> Result<Option<ShardCheckpoint>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(TagError::Corrupted(format!(
            "checkpoint {} is only {} bytes",
            path.display(),
            bytes.len()
        )));
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);
    if magic != CHECKPOINT_MAGIC {
        return Err(TagError::InvalidMagic(magic));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != CHECKPOINT_VERSION {
        return Err(TagError::UnsupportedVersion(version));
    }

    let (payload, footer) = bytes[HEADER_SIZE..].split_at(bytes.len() - HEADER_SIZE - FOOTER_SIZE);
    let expected = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(TagError::ChecksumMismatch { expected, actual });
    }

    let mut reader = ByteReader::new(payload);
    let lsn = reader.get_u64()?;
    let count = reader.get_u32()? as usize;
    let mut entities = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = reader.get_entity_id()?;
        let dataset = reader.get_str()?;
        let entity_type = reader.get_str()?;
        let created_at = reader.get_i64()?;
        let content = reader.get_bytes()?;
        let next_sequence = reader.get_u64()?;
        let last_write = reader.get_i64()?;
        let versions = reader.get_versions()?;

        let mut entity = Entity::new(id, dataset, entity_type, content, created_at);
        entity.timeline = TagTimeline::restore(versions, next_sequence, last_write);
        entities.push(entity);
    }
    reader.finish()?;

    Ok(Some(ShardCheckpoint { lsn, entities }))
}
