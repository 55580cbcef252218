//! Little-endian byte encoding shared by the WAL and checkpoint files.

use crate::error::{Result, TagError};
use crate::tag::{EntityId, PruneMark, TagOp, TagVersion};

/// Append-only buffer for building record payloads.
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a u32 length prefix followed by the bytes.
    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub(crate) fn put_entity_id(&mut self, id: &EntityId) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    pub(crate) fn put_version(&mut self, version: &TagVersion) {
        self.put_i64(version.timestamp);
        self.put_u64(version.sequence);
        self.put_u8(version.op as u8);
        self.put_str(&version.key);
        self.put_str(&version.value);
    }

    pub(crate) fn put_versions(&mut self, versions: &[TagVersion]) {
        self.put_u32(versions.len() as u32);
        for version in versions {
            self.put_version(version);
        }
    }

    pub(crate) fn put_marks(&mut self, marks: &[PruneMark]) {
        self.put_u32(marks.len() as u32);
        for mark in marks {
            self.put_str(&mark.key);
            self.put_i64(mark.through.0);
            self.put_u64(mark.through.1);
        }
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded payload. Every getter fails with
/// [`TagError::Corrupted`] instead of panicking on short input.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                TagError::Corrupted(format!(
                    "record truncated: wanted {} bytes at offset {} of {}",
                    len,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn get_str(&mut self) -> Result<String> {
        String::from_utf8(self.get_bytes()?)
            .map_err(|err| TagError::Corrupted(format!("invalid UTF-8 in record: {}", err)))
    }

    pub(crate) fn get_entity_id(&mut self) -> Result<EntityId> {
        Ok(EntityId::from_bytes(self.take_array()?))
    }

    pub(crate) fn get_version(&mut self) -> Result<TagVersion> {
        let timestamp = self.get_i64()?;
        let sequence = self.get_u64()?;
        let op_byte = self.get_u8()?;
        let op = TagOp::from_u8(op_byte)
            .ok_or_else(|| TagError::Corrupted(format!("unknown tag op {}", op_byte)))?;
        let key = self.get_str()?;
        let value = self.get_str()?;
        Ok(TagVersion {
            timestamp,
            key,
            value,
            op,
            sequence,
        })
    }

    pub(crate) fn get_versions(&mut self) -> Result<Vec<TagVersion>> {
        let count = self.get_u32()? as usize;
        // Cap the pre-allocation; a corrupt count must not trigger a huge alloc.
        let mut versions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            versions.push(self.get_version()?);
        }
        Ok(versions)
    }

    pub(crate) fn get_marks(&mut self) -> Result<Vec<PruneMark>> {
        let count = self.get_u32()? as usize;
        let mut marks = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = self.get_str()?;
            let through = (self.get_i64()?, self.get_u64()?);
            marks.push(PruneMark { key, through });
        }
        Ok(marks)
    }

    /// Fails if any bytes remain unread.
    pub(crate) fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(TagError::Corrupted(format!(
                "{} trailing bytes after record",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}
