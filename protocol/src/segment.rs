//! Lazy field slots backing decoded objects.
//!
//! A decoded object does not parse its fields up front. Fixed-width fields
//! keep a handle on their raw bytes and decode on every read (the read is a
//! few byte loads). Variable-width fields live in a [`CacheSegment`] that
//! parses once on first read and caches the result.
//!
//! Both slot kinds share the tracker node of the object that owns them and
//! mark it dirty on every write.

use crate::binary;
use crate::error::{CodecError, Result};
use crate::tracker::DirtyTracker;
use bytes::Bytes;
use std::fmt;
use std::sync::OnceLock;

/// A field with a fixed encoded width.
pub trait FixedField: Copy + Default + fmt::Debug + Send + Sync + 'static {
    const WIDTH: usize;

    fn read(bytes: &[u8], offset: usize) -> Result<Self>;

    fn write(self, buf: &mut Vec<u8>, offset: usize) -> usize;
}

/// A field whose encoded width depends on its value.
pub trait VariableField: Clone + fmt::Debug + Send + Sync + 'static {
    /// Parses a value that must occupy all of `bytes`.
    fn read(bytes: &[u8]) -> Result<Self>;

    fn write(&self, buf: &mut Vec<u8>, offset: usize) -> Result<usize>;
}

impl FixedField for u64 {
    const WIDTH: usize = 8;

    fn read(bytes: &[u8], offset: usize) -> Result<Self> {
        binary::read_u64(bytes, offset)
    }

    fn write(self, buf: &mut Vec<u8>, offset: usize) -> usize {
        binary::write_u64(buf, offset, self)
    }
}

impl FixedField for i32 {
    const WIDTH: usize = 4;

    fn read(bytes: &[u8], offset: usize) -> Result<Self> {
        binary::read_i32(bytes, offset)
    }

    fn write(self, buf: &mut Vec<u8>, offset: usize) -> usize {
        binary::write_i32(buf, offset, self)
    }
}

fn exact<T>(value: T, consumed: usize, available: usize) -> Result<T> {
    if consumed != available {
        return Err(CodecError::Corrupt(format!(
            "variable field spans {} bytes but its content uses {}",
            available, consumed
        )));
    }
    Ok(value)
}

impl VariableField for Option<String> {
    fn read(bytes: &[u8]) -> Result<Self> {
        let (value, consumed) = binary::read_string(bytes, 0)?;
        exact(value, consumed, bytes.len())
    }

    fn write(&self, buf: &mut Vec<u8>, offset: usize) -> Result<usize> {
        binary::write_string(buf, offset, self.as_deref())
    }
}

impl VariableField for Option<Vec<u8>> {
    fn read(bytes: &[u8]) -> Result<Self> {
        let (value, consumed) = binary::read_bytes(bytes, 0)?;
        exact(value.map(<[u8]>::to_vec), consumed, bytes.len())
    }

    fn write(&self, buf: &mut Vec<u8>, offset: usize) -> Result<usize> {
        binary::write_bytes(buf, offset, self.as_deref())
    }
}

#[derive(Debug, Clone)]
enum FixedState<T> {
    /// Exactly `T::WIDTH` bytes of the decoded object.
    Raw(Bytes),
    /// The producer did not know this field.
    Absent,
    Value(T),
}

/// Slot for a fixed-width field.
#[derive(Debug, Clone)]
pub struct FixedSlot<T> {
    state: FixedState<T>,
    tracker: Option<DirtyTracker>,
}

impl<T: FixedField> FixedSlot<T> {
    pub fn from_value(value: T) -> Self {
        Self {
            state: FixedState::Value(value),
            tracker: None,
        }
    }

    pub(crate) fn from_raw(raw: Bytes, tracker: DirtyTracker) -> Self {
        Self {
            state: FixedState::Raw(raw),
            tracker: Some(tracker),
        }
    }

    pub(crate) fn absent(tracker: DirtyTracker) -> Self {
        Self {
            state: FixedState::Absent,
            tracker: Some(tracker),
        }
    }

    pub fn get(&self) -> Result<T> {
        match &self.state {
            FixedState::Raw(raw) => T::read(raw, 0),
            FixedState::Absent => Ok(T::default()),
            FixedState::Value(value) => Ok(*value),
        }
    }

    pub fn set(&mut self, value: T) {
        self.state = FixedState::Value(value);
        if let Some(tracker) = &self.tracker {
            tracker.mark_dirty();
        }
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>, offset: usize) -> usize {
        match &self.state {
            FixedState::Raw(raw) => binary::write_raw(buf, offset, raw),
            FixedState::Absent => T::default().write(buf, offset),
            FixedState::Value(value) => value.write(buf, offset),
        }
    }
}

/// Slot for a variable-width field: either the untouched bytes it was
/// decoded from, or a materialized value.
///
/// Reads materialize at most once. A write replaces the value, drops the
/// claim that the original bytes are still current and marks the owning
/// object dirty.
#[derive(Debug, Clone)]
pub struct CacheSegment<T> {
    raw: Option<Bytes>,
    value: OnceLock<T>,
    dirty: bool,
    tracker: Option<DirtyTracker>,
}

impl<T: VariableField> CacheSegment<T> {
    pub fn from_value(value: T) -> Self {
        Self {
            raw: None,
            value: OnceLock::from(value),
            dirty: false,
            tracker: None,
        }
    }

    pub(crate) fn from_raw(raw: Bytes, tracker: DirtyTracker) -> Self {
        Self {
            raw: Some(raw),
            value: OnceLock::new(),
            dirty: false,
            tracker: Some(tracker),
        }
    }

    pub fn get(&self) -> Result<&T> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }
        let raw = self
            .raw
            .as_ref()
            .ok_or_else(|| CodecError::Corrupt("cache segment holds neither bytes nor value".into()))?;
        let parsed = T::read(raw)?;
        Ok(self.value.get_or_init(|| parsed))
    }

    pub fn set(&mut self, value: T) {
        self.value = OnceLock::from(value);
        self.dirty = true;
        if let Some(tracker) = &self.tracker {
            tracker.mark_dirty();
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the field, copying the original bytes when they are still
    /// current instead of re-encoding the value.
    pub(crate) fn write(&self, buf: &mut Vec<u8>, offset: usize) -> Result<usize> {
        if !self.dirty {
            if let Some(raw) = &self.raw {
                return Ok(binary::write_raw(buf, offset, raw));
            }
        }
        match self.value.get() {
            Some(value) => value.write(buf, offset),
            None => Err(CodecError::Corrupt("cache segment holds neither bytes nor value".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_string(text: Option<&str>) -> Bytes {
        let mut buf = Vec::new();
        binary::write_string(&mut buf, 0, text).unwrap();
        Bytes::from(buf)
    }

    #[test]
    fn test_cache_segment_materializes_once() {
        let tracker = DirtyTracker::root().create_child();
        let segment = CacheSegment::<Option<String>>::from_raw(encoded_string(Some("arena")), tracker.clone());

        assert!(!segment.is_materialized());
        let first = segment.get().unwrap() as *const Option<String>;
        assert!(segment.is_materialized());
        let second = segment.get().unwrap() as *const Option<String>;

        assert_eq!(first, second);
        assert_eq!(segment.get().unwrap().as_deref(), Some("arena"));
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_cache_segment_write_marks_owner_dirty() {
        let root = DirtyTracker::root();
        let tracker = root.create_child();
        let mut segment = CacheSegment::<Option<String>>::from_raw(encoded_string(Some("old")), tracker.clone());

        segment.set(Some("new".to_string()));

        assert!(segment.is_dirty());
        assert!(tracker.is_dirty());
        assert!(root.is_dirty());
        assert_eq!(segment.get().unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn test_clean_segment_copies_original_bytes() {
        let raw = encoded_string(Some("copied"));
        let segment = CacheSegment::<Option<String>>::from_raw(raw.clone(), DirtyTracker::root());
        segment.get().unwrap();

        let mut out = Vec::new();
        let written = segment.write(&mut out, 0).unwrap();
        assert_eq!(written, raw.len());
        assert_eq!(&out[..], &raw[..]);
    }

    #[test]
    fn test_dirty_segment_reencodes_value() {
        let mut segment =
            CacheSegment::<Option<Vec<u8>>>::from_raw(encoded_string(Some("abc")), DirtyTracker::root());
        segment.set(None);

        let mut out = Vec::new();
        assert_eq!(segment.write(&mut out, 0).unwrap(), 4);
        assert_eq!(out, (-1i32).to_le_bytes());
    }

    #[test]
    fn test_field_with_trailing_garbage_is_corrupt() {
        let mut buf = Vec::new();
        binary::write_string(&mut buf, 0, Some("ok")).unwrap();
        buf.push(0xAA);
        let segment = CacheSegment::<Option<String>>::from_raw(Bytes::from(buf), DirtyTracker::root());
        assert!(matches!(segment.get(), Err(CodecError::Corrupt(_))));
    }

    #[test]
    fn test_fixed_slot_states() {
        let tracker = DirtyTracker::root().create_child();
        let mut buf = Vec::new();
        binary::write_u64(&mut buf, 0, 77);

        let mut raw = FixedSlot::<u64>::from_raw(Bytes::from(buf), tracker.clone());
        let absent = FixedSlot::<u64>::absent(tracker.clone());
        assert_eq!(raw.get().unwrap(), 77);
        assert_eq!(absent.get().unwrap(), 0);
        assert!(!tracker.is_dirty());

        raw.set(78);
        assert_eq!(raw.get().unwrap(), 78);
        assert!(tracker.is_dirty());
    }

    #[test]
    fn test_fresh_values_have_no_tracker() {
        let mut slot = FixedSlot::from_value(5i32);
        slot.set(6);
        assert_eq!(slot.get().unwrap(), 6);

        let segment = CacheSegment::from_value(Some("fresh".to_string()));
        assert!(segment.is_materialized());
        assert!(!segment.is_dirty());
    }
}
