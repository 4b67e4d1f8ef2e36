//! Object envelope shared by every message type.
//!
//! ```text
//! 0            totalLength          i32, -1 for a null object
//! 4            lastFixedFieldIndex  i32, fixed field count of the producer - 1
//! 8            offset table         i32 x (V + 1), relative to the object start:
//!                                     [0]   end of the fixed region
//!                                     [i]   end of variable field i - 1
//! 8 + 4(V+1)   fixed fields         declaration order, fixed widths
//! table[0]     variable fields      declaration order
//! ```
//!
//! `V` is the number of variable fields of the type. Since slot 0 records
//! where the fixed region ends, a reader skips fixed fields it does not know
//! about, and fields a producer did not know about read as their default.

use crate::binary;
use crate::error::{CodecError, Result};
use crate::segment::{CacheSegment, FixedField, FixedSlot, VariableField};
use crate::tracker::DirtyTracker;
use bytes::Bytes;

pub const NULL_OBJECT: i32 = -1;

/// Bytes taken by the length, the fixed index and the offset table.
pub const fn header_len(variable_count: usize) -> usize {
    8 + 4 * (variable_count + 1)
}

/// Wire layout and field access for one message type.
pub trait ObjectCodec: Sized + Send + Sync + 'static {
    const NAME: &'static str;

    /// Widths of the fixed fields, in declaration order.
    const FIXED_WIDTHS: &'static [usize];

    const VARIABLE_COUNT: usize;

    /// The decoded bytes behind this value, `None` for a value built in
    /// memory.
    fn origin(&self) -> Option<&Origin>;

    /// Builds a lazy value over a validated envelope.
    fn from_view(view: &ObjectView) -> Result<Self>;

    /// Writes every field, fixed and variable, in declaration order.
    fn write_fields(&self, writer: &mut ObjectWriter<'_>) -> Result<()>;

    /// True if this value was decoded and has been mutated since.
    fn is_dirty(&self) -> bool {
        self.origin().map_or(false, Origin::is_dirty)
    }
}

/// Byte range and tracker node of a decoded object.
#[derive(Debug, Clone)]
pub struct Origin {
    bytes: Bytes,
    tracker: DirtyTracker,
    producer_older: bool,
}

impl Origin {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    /// The original bytes can stand in for a re-encode: nothing was mutated
    /// and the producer knew every fixed field this build knows.
    pub fn can_direct_copy(&self) -> bool {
        !self.producer_older && !self.tracker.is_dirty()
    }
}

/// A validated envelope being turned into a lazy value.
pub struct ObjectView {
    bytes: Bytes,
    tracker: DirtyTracker,
    last_fixed_index: i32,
    fixed_start: usize,
    fixed_end: usize,
    variable_ends: Vec<usize>,
    fixed_widths: &'static [usize],
}

impl ObjectView {
    pub fn last_fixed_index(&self) -> i32 {
        self.last_fixed_index
    }

    /// Slot for fixed field `index` of the reading schema.
    pub fn fixed<T: FixedField>(&self, index: usize) -> Result<FixedSlot<T>> {
        debug_assert_eq!(self.fixed_widths.get(index), Some(&T::WIDTH));
        let known = i64::from(self.last_fixed_index) >= index as i64;
        let offset = self.fixed_start + self.fixed_widths[..index].iter().sum::<usize>();
        let end = offset + T::WIDTH;

        if !known {
            return Ok(FixedSlot::absent(self.tracker.clone()));
        }
        if end > self.fixed_end {
            return Err(CodecError::Corrupt(format!(
                "fixed field {} ends at {} past the fixed region end {}",
                index, end, self.fixed_end
            )));
        }
        Ok(FixedSlot::from_raw(self.bytes.slice(offset..end), self.tracker.clone()))
    }

    /// Slot for variable field `index`, left unparsed.
    pub fn variable<T: VariableField>(&self, index: usize) -> Result<CacheSegment<T>> {
        let end = *self
            .variable_ends
            .get(index)
            .ok_or_else(|| CodecError::Corrupt(format!("no variable field {}", index)))?;
        let start = match index {
            0 => self.fixed_end,
            _ => self.variable_ends[index - 1],
        };
        Ok(CacheSegment::from_raw(self.bytes.slice(start..end), self.tracker.clone()))
    }

    pub fn origin(&self) -> Origin {
        let expected = self.fixed_widths.len() as i64 - 1;
        Origin {
            bytes: self.bytes.clone(),
            tracker: self.tracker.clone(),
            producer_older: i64::from(self.last_fixed_index) < expected,
        }
    }
}

/// Decodes one object of type `T` at `offset`.
///
/// Returns the value (`None` for the null sentinel) and the number of bytes
/// it occupied. The value keeps a reference to `buffer` and a new tracker
/// node below `parent`; no field is parsed yet.
pub fn decode_object<T: ObjectCodec>(
    buffer: &Bytes,
    offset: usize,
    parent: &DirtyTracker,
) -> Result<(Option<T>, usize)> {
    let total = binary::read_i32(buffer, offset)?;
    if total == NULL_OBJECT {
        return Ok((None, 4));
    }

    let header = header_len(T::VARIABLE_COUNT);
    if total < 0 || (total as usize) < header {
        return Err(CodecError::InvalidLength {
            offset,
            length: total,
        });
    }
    let total = total as usize;
    binary::read_raw(buffer, offset, total)?;
    let bytes = buffer.slice(offset..offset + total);

    let last_fixed_index = binary::read_i32(&bytes, 4)?;
    if last_fixed_index < -1 {
        return Err(CodecError::Corrupt(format!(
            "{}: last fixed index {}",
            T::NAME,
            last_fixed_index
        )));
    }

    let mut table = Vec::with_capacity(T::VARIABLE_COUNT + 1);
    let mut previous = header;
    for slot in 0..=T::VARIABLE_COUNT {
        let value = binary::read_i32(&bytes, 8 + 4 * slot)?;
        if value < 0 || (value as usize) < previous || value as usize > total {
            return Err(CodecError::Corrupt(format!(
                "{}: offset slot {} holds {} (previous {}, object {})",
                T::NAME,
                slot,
                value,
                previous,
                total
            )));
        }
        previous = value as usize;
        table.push(previous);
    }
    if previous != total {
        return Err(CodecError::Corrupt(format!(
            "{}: variable region ends at {} but object is {} bytes",
            T::NAME,
            previous,
            total
        )));
    }

    let view = ObjectView {
        bytes,
        tracker: parent.create_child(),
        last_fixed_index,
        fixed_start: header,
        fixed_end: table[0],
        variable_ends: table.split_off(1),
        fixed_widths: T::FIXED_WIDTHS,
    };
    let value = T::from_view(&view)?;
    Ok((Some(value), total))
}

/// Encodes `value` at `offset` and returns the number of bytes written.
///
/// Clean decoded values are copied byte for byte. Everything else is
/// re-encoded, though variable fields that still hold their original bytes
/// are copied rather than re-serialized.
pub fn encode_object<T: ObjectCodec>(value: Option<&T>, buf: &mut Vec<u8>, offset: usize) -> Result<usize> {
    let value = match value {
        Some(value) => value,
        None => return Ok(binary::write_i32(buf, offset, NULL_OBJECT)),
    };

    if let Some(origin) = value.origin() {
        if origin.can_direct_copy() {
            return Ok(binary::write_raw(buf, offset, origin.bytes()));
        }
    }

    let mut writer = ObjectWriter::new(buf, offset, T::FIXED_WIDTHS, T::VARIABLE_COUNT);
    value.write_fields(&mut writer)?;
    writer.finish()
}

/// Lays out a full re-encode: header reserved first, fixed fields at their
/// positions, variable fields appended, sizes patched at the end.
pub struct ObjectWriter<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
    fixed_widths: &'static [usize],
    variable_count: usize,
    fixed_index: usize,
    fixed_cursor: usize,
    fixed_end: usize,
    variable_index: usize,
    variable_cursor: usize,
}

impl<'a> ObjectWriter<'a> {
    fn new(buf: &'a mut Vec<u8>, start: usize, fixed_widths: &'static [usize], variable_count: usize) -> Self {
        let fixed_start = start + header_len(variable_count);
        let fixed_end = fixed_start + fixed_widths.iter().sum::<usize>();
        if buf.len() < fixed_end {
            buf.resize(fixed_end, 0);
        }
        Self {
            buf,
            start,
            fixed_widths,
            variable_count,
            fixed_index: 0,
            fixed_cursor: fixed_start,
            fixed_end,
            variable_index: 0,
            variable_cursor: fixed_end,
        }
    }

    pub fn fixed<T: FixedField>(&mut self, slot: &FixedSlot<T>) {
        debug_assert_eq!(self.fixed_widths.get(self.fixed_index), Some(&T::WIDTH));
        self.fixed_cursor += slot.write(self.buf, self.fixed_cursor);
        self.fixed_index += 1;
    }

    pub fn variable<T: VariableField>(&mut self, segment: &CacheSegment<T>) -> Result<()> {
        self.variable_cursor += segment.write(self.buf, self.variable_cursor)?;
        self.variable_index += 1;
        let end = self.relative(self.variable_cursor)?;
        binary::write_i32(self.buf, self.start + 8 + 4 * self.variable_index, end);
        Ok(())
    }

    fn relative(&self, position: usize) -> Result<i32> {
        let distance = position - self.start;
        i32::try_from(distance).map_err(|_| CodecError::TooLarge(distance))
    }

    fn finish(self) -> Result<usize> {
        if self.fixed_index != self.fixed_widths.len() || self.variable_index != self.variable_count {
            return Err(CodecError::Corrupt(format!(
                "wrote {} fixed and {} variable fields, layout has {} and {}",
                self.fixed_index,
                self.variable_index,
                self.fixed_widths.len(),
                self.variable_count
            )));
        }
        debug_assert_eq!(self.fixed_cursor, self.fixed_end);

        let total = self.relative(self.variable_cursor)?;
        let fixed_end = self.relative(self.fixed_end)?;
        binary::write_i32(self.buf, self.start, total);
        binary::write_i32(self.buf, self.start + 4, self.fixed_widths.len() as i32 - 1);
        binary::write_i32(self.buf, self.start + 8, fixed_end);
        Ok(total as usize)
    }
}
