//! Minimal FlatBuffers table access.
//!
//! Covers what the bridge schema needs and nothing more: tables holding
//! scalars, byte vectors and vectors of tables. Every read is bounds-checked
//! against the payload, so a hostile peer produces a `DecodeError` rather
//! than a panic.
//!
//! The builder writes front to back. FlatBuffers only requires that `uoffset`
//! fields point forward, which holds when children are written after their
//! parent, and that scalars are naturally aligned relative to the start of
//! the payload.

use crate::error::DecodeError;

/// Size of the vtable header: vtable length plus table length, both `u16`.
const VTABLE_HEADER_SIZE: usize = 4;

/// Size of a `uoffset`/`soffset`/vector length.
const OFFSET_SIZE: usize = 4;

fn read<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    offset
        .checked_add(N)
        .and_then(|end| buf.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::OutOfBounds { offset, len: N })
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, DecodeError> {
    read::<2>(buf, offset).map(u16::from_le_bytes)
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, DecodeError> {
    read::<4>(buf, offset).map(u32::from_le_bytes)
}

fn read_i32(buf: &[u8], offset: usize) -> Result<i32, DecodeError> {
    read::<4>(buf, offset).map(i32::from_le_bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, DecodeError> {
    read::<8>(buf, offset).map(u64::from_le_bytes)
}

/// A table inside a payload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

impl<'a> Table<'a> {
    /// The root table of a payload.
    pub(crate) fn root(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let pos = read_u32(buf, 0)? as usize;
        Self::at(buf, pos)
    }

    fn at(buf: &'a [u8], pos: usize) -> Result<Self, DecodeError> {
        let soffset = i64::from(read_i32(buf, pos)?);
        let vtable = usize::try_from(pos as i64 - soffset)
            .map_err(|_| DecodeError::InvalidVtable(pos))?;
        let vtable_len = read_u16(buf, vtable)? as usize;
        let table_len = read_u16(buf, vtable + 2)? as usize;

        if vtable_len < VTABLE_HEADER_SIZE
            || vtable_len % 2 != 0
            || vtable + vtable_len > buf.len()
            || pos + table_len > buf.len()
        {
            return Err(DecodeError::InvalidVtable(pos));
        }

        Ok(Self {
            buf,
            pos,
            vtable,
            vtable_len,
        })
    }

    /// Absolute position of a field, or `None` when the field is absent.
    fn field(&self, slot: usize) -> Result<Option<usize>, DecodeError> {
        let entry = VTABLE_HEADER_SIZE + 2 * slot;
        if entry + 2 > self.vtable_len {
            return Ok(None);
        }
        let offset = read_u16(self.buf, self.vtable + entry)? as usize;
        Ok((offset != 0).then_some(self.pos + offset))
    }

    /// Follow the `uoffset` stored at `at`.
    fn indirect(&self, at: usize) -> Result<usize, DecodeError> {
        let rel = read_u32(self.buf, at)? as usize;
        at.checked_add(rel)
            .filter(|target| *target < self.buf.len())
            .ok_or(DecodeError::OutOfBounds { offset: at, len: rel })
    }

    pub(crate) fn u8_field(&self, slot: usize, default: u8) -> Result<u8, DecodeError> {
        match self.field(slot)? {
            Some(at) => read::<1>(self.buf, at).map(|b| b[0]),
            None => Ok(default),
        }
    }

    pub(crate) fn i8_field(&self, slot: usize, default: i8) -> Result<i8, DecodeError> {
        self.u8_field(slot, default as u8).map(|v| v as i8)
    }

    pub(crate) fn u16_field(&self, slot: usize, default: u16) -> Result<u16, DecodeError> {
        match self.field(slot)? {
            Some(at) => read_u16(self.buf, at),
            None => Ok(default),
        }
    }

    pub(crate) fn u64_field(&self, slot: usize, default: u64) -> Result<u64, DecodeError> {
        match self.field(slot)? {
            Some(at) => read_u64(self.buf, at),
            None => Ok(default),
        }
    }

    /// A `[ubyte]` field as a slice of the payload. Absent means empty.
    pub(crate) fn bytes_field(&self, slot: usize) -> Result<&'a [u8], DecodeError> {
        let Some(at) = self.field(slot)? else {
            return Ok(&[]);
        };
        let start = self.indirect(at)?;
        let len = read_u32(self.buf, start)? as usize;
        let data = start + OFFSET_SIZE;
        data.checked_add(len)
            .and_then(|end| self.buf.get(data..end))
            .ok_or(DecodeError::OutOfBounds { offset: data, len })
    }

    /// A vector-of-tables field. Absent means empty.
    pub(crate) fn tables_field(&self, slot: usize) -> Result<Vec<Table<'a>>, DecodeError> {
        let Some(at) = self.field(slot)? else {
            return Ok(Vec::new());
        };
        let start = self.indirect(at)?;
        let count = read_u32(self.buf, start)? as usize;
        let elems = start + OFFSET_SIZE;
        if count > self.buf.len().saturating_sub(elems) / OFFSET_SIZE {
            return Err(DecodeError::OutOfBounds {
                offset: elems,
                len: count.saturating_mul(OFFSET_SIZE),
            });
        }

        (0..count)
            .map(|i| {
                let target = self.indirect(elems + i * OFFSET_SIZE)?;
                Table::at(self.buf, target)
            })
            .collect()
    }
}

/// One field handed to [`Builder::table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    U8(u8),
    I8(i8),
    U16(u16),
    U64(u64),
    /// A `uoffset` to a child object, patched once the child is written.
    Offset,
}

impl Field {
    fn size(&self) -> usize {
        match self {
            Field::U8(_) | Field::I8(_) => 1,
            Field::U16(_) => 2,
            Field::Offset => OFFSET_SIZE,
            Field::U64(_) => 8,
        }
    }
}

/// Front-to-back FlatBuffers writer producing a length-prefixed frame.
#[derive(Debug)]
pub(crate) struct Builder {
    buf: Vec<u8>,
    /// Start of the FlatBuffers payload, after the length prefix.
    base: usize,
}

impl Builder {
    /// Start a frame: length prefix, then the root offset.
    pub(crate) fn framed(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity + 2 * OFFSET_SIZE);
        buf.extend_from_slice(&[0u8; OFFSET_SIZE]);
        let mut builder = Self {
            buf,
            base: OFFSET_SIZE,
        };
        builder.push_u32(0);
        builder
    }

    /// Position relative to the payload start (alignment is measured from there).
    fn pos(&self) -> usize {
        self.buf.len() - self.base
    }

    /// Pad so that `ahead` bytes from now lands on a multiple of `align`.
    fn pad_to(&mut self, align: usize, ahead: usize) {
        while (self.pos() + ahead) % align != 0 {
            self.buf.push(0);
        }
    }

    fn push_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a vtable and its table.
    ///
    /// Fields are laid out largest first so that each is naturally aligned.
    /// Returns the table position and the position of every field, in the
    /// order given; `Field::Offset` positions are later passed to
    /// [`Builder::patch_offset`].
    pub(crate) fn table(&mut self, fields: &[Field]) -> (usize, Vec<usize>) {
        let vtable_len = VTABLE_HEADER_SIZE + 2 * fields.len();

        let mut order: Vec<usize> = (0..fields.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(fields[i].size()));

        let mut field_offsets = vec![0u16; fields.len()];
        let mut cursor = OFFSET_SIZE;
        for &i in &order {
            field_offsets[i] = cursor as u16;
            cursor += fields[i].size();
        }
        let table_len = cursor;

        // With 8-byte fields the table must start at 4 (mod 8) so that the
        // first field, right after the soffset, is 8-aligned.
        if fields.iter().any(|f| f.size() == 8) {
            self.pad_to(8, vtable_len + OFFSET_SIZE);
        } else {
            self.pad_to(OFFSET_SIZE, vtable_len);
        }

        self.push_u16(vtable_len as u16);
        self.push_u16(table_len as u16);
        for offset in &field_offsets {
            self.push_u16(*offset);
        }

        let table = self.buf.len();
        self.buf.extend_from_slice(&(vtable_len as i32).to_le_bytes());

        let mut positions = vec![0usize; fields.len()];
        for &i in &order {
            positions[i] = self.buf.len();
            match fields[i] {
                Field::U8(v) => self.buf.push(v),
                Field::I8(v) => self.buf.push(v as u8),
                Field::U16(v) => self.push_u16(v),
                Field::U64(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
                Field::Offset => self.push_u32(0),
            }
        }

        (table, positions)
    }

    /// Write a `[ubyte]` vector, returning its position.
    pub(crate) fn bytes_vector(&mut self, data: &[u8]) -> usize {
        self.pad_to(OFFSET_SIZE, 0);
        let at = self.buf.len();
        self.push_u32(vector_len(data.len()));
        self.buf.extend_from_slice(data);
        at
    }

    /// Write a vector of `count` offsets, returning its position and the
    /// position of every element slot.
    pub(crate) fn offset_vector(&mut self, count: usize) -> (usize, Vec<usize>) {
        self.pad_to(OFFSET_SIZE, 0);
        let at = self.buf.len();
        self.push_u32(vector_len(count));
        let slots = (0..count)
            .map(|_| {
                let slot = self.buf.len();
                self.push_u32(0);
                slot
            })
            .collect();
        (at, slots)
    }

    /// Point the `uoffset` at `slot` to `target`, which must come after it.
    pub(crate) fn patch_offset(&mut self, slot: usize, target: usize) {
        assert!(target > slot, "flatbuffers offsets must point forward");
        let rel = vector_len(target - slot);
        self.buf[slot..slot + OFFSET_SIZE].copy_from_slice(&rel.to_le_bytes());
    }

    /// Set the root table and fill in the length prefix.
    pub(crate) fn finish(mut self, root: usize) -> Vec<u8> {
        self.patch_offset(self.base, root);
        let len = vector_len(self.buf.len() - self.base);
        self.buf[..OFFSET_SIZE].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

fn vector_len(len: usize) -> u32 {
    assert!(
        len <= u32::MAX as usize,
        "frame component of {len} bytes does not fit a u32 length"
    );
    len as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build `{ a: u64, b: [ubyte], c: u8 }` and return the payload (no prefix).
    fn sample(a: u64, b: &[u8], c: u8) -> Vec<u8> {
        let mut builder = Builder::framed(64);
        let (table, fields) = builder.table(&[Field::U64(a), Field::Offset, Field::U8(c)]);
        let vector = builder.bytes_vector(b);
        builder.patch_offset(fields[1], vector);
        let framed = builder.finish(table);
        framed[OFFSET_SIZE..].to_vec()
    }

    #[test]
    fn test_table_scalars_and_bytes() {
        let payload = sample(0xDEAD_BEEF_0102, b"hello", 7);
        let table = Table::root(&payload).unwrap();

        assert_eq!(table.u64_field(0, 0).unwrap(), 0xDEAD_BEEF_0102);
        assert_eq!(table.bytes_field(1).unwrap(), b"hello");
        assert_eq!(table.u8_field(2, 0).unwrap(), 7);
    }

    #[test]
    fn test_absent_fields_use_defaults() {
        let payload = sample(1, b"", 2);
        let table = Table::root(&payload).unwrap();

        // slots beyond the vtable are absent
        assert_eq!(table.u16_field(5, 42).unwrap(), 42);
        assert_eq!(table.bytes_field(6).unwrap(), b"");
        assert!(table.tables_field(7).unwrap().is_empty());
    }

    #[test]
    fn test_u64_fields_are_aligned() {
        let mut builder = Builder::framed(64);
        builder.bytes_vector(b"xyz");
        let (table, fields) = builder.table(&[Field::U8(1), Field::U64(2)]);
        let framed = builder.finish(table);

        // positions are absolute; alignment is relative to the payload start
        assert_eq!((fields[1] - OFFSET_SIZE) % 8, 0);

        let table = Table::root(&framed[OFFSET_SIZE..]).unwrap();
        assert_eq!(table.u8_field(0, 0).unwrap(), 1);
        assert_eq!(table.u64_field(1, 0).unwrap(), 2);
    }

    #[test]
    fn test_length_prefix() {
        let mut builder = Builder::framed(16);
        let (table, _) = builder.table(&[Field::U16(9)]);
        let framed = builder.finish(table);

        let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let payload = sample(5, b"some body bytes", 1);
        for cut in [0, 3, 8, payload.len() - 4] {
            let err = Table::root(&payload[..cut])
                .and_then(|t| t.bytes_field(1).map(|_| ()));
            assert!(err.is_err(), "cut at {cut} should fail");
        }
    }

    #[test]
    fn test_bad_vtable_offset() {
        // root points at 4, soffset claims the vtable lies far before the buffer
        let mut payload = vec![4, 0, 0, 0];
        payload.extend_from_slice(&1000i32.to_le_bytes());
        assert_eq!(Table::root(&payload).unwrap_err(), DecodeError::InvalidVtable(4));
    }

    #[test]
    fn test_huge_vector_count_rejected() {
        let mut builder = Builder::framed(32);
        let (table, fields) = builder.table(&[Field::Offset]);
        let (vector, _) = builder.offset_vector(0);
        builder.patch_offset(fields[0], vector);
        let mut framed = builder.finish(table);

        // rewrite the element count to something absurd
        let at = vector;
        framed[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let payload = &framed[OFFSET_SIZE..];
        let table = Table::root(payload).unwrap();
        assert!(matches!(
            table.tables_field(0),
            Err(DecodeError::OutOfBounds { .. })
        ));
    }
}
