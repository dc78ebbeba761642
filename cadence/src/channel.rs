//! Channel descriptors.
//!
//! A channel names a contiguous region of a task's state image (signal) or
//! parameter block (parameter): byte offset, row/column shape and element
//! type. Descriptors are declared at registration time and never change for
//! the lifetime of the task.

use serde::{Deserialize, Serialize};

/// Scalar element type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElemType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElemType {
    /// Width of one element in bytes.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            ElemType::I8 | ElemType::U8 => 1,
            ElemType::I16 | ElemType::U16 => 2,
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 | ElemType::F64 => 8,
        }
    }

    /// Unsigned integer types are excluded from delta compression: a
    /// negative difference has no representation in the element type.
    #[must_use]
    pub const fn is_unsigned(self) -> bool {
        matches!(self, ElemType::U8 | ElemType::U16 | ElemType::U32 | ElemType::U64)
    }

    #[must_use]
    pub const fn as_wire(self) -> u8 {
        match self {
            ElemType::I8 => 0,
            ElemType::U8 => 1,
            ElemType::I16 => 2,
            ElemType::U16 => 3,
            ElemType::I32 => 4,
            ElemType::U32 => 5,
            ElemType::I64 => 6,
            ElemType::U64 => 7,
            ElemType::F32 => 8,
            ElemType::F64 => 9,
        }
    }

    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => ElemType::I8,
            1 => ElemType::U8,
            2 => ElemType::I16,
            3 => ElemType::U16,
            4 => ElemType::I32,
            5 => ElemType::U32,
            6 => ElemType::I64,
            7 => ElemType::U64,
            8 => ElemType::F32,
            9 => ElemType::F64,
            _ => return None,
        })
    }
}

/// Which block of task memory a channel addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSpace {
    Signal,
    Parameter,
}

/// Static description of one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Dense index within its space; assigned by the registrant.
    pub index: u32,
    /// Short display name.
    pub name: String,
    /// Hierarchical path, `/`-separated.
    pub path: String,
    /// Byte offset into the state image or parameter block.
    pub offset: usize,
    pub rows: u32,
    pub cols: u32,
    pub elem: ElemType,
}

impl ChannelDescriptor {
    /// Convenience constructor for a scalar or flat vector channel.
    #[must_use]
    pub fn vector(index: u32, path: &str, offset: usize, count: u32, elem: ElemType) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_owned();
        ChannelDescriptor {
            index,
            name,
            path: path.to_owned(),
            offset,
            rows: 1,
            cols: count,
            elem,
        }
    }

    /// Number of scalar elements.
    #[must_use]
    pub fn count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// Total byte length of the channel's region.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.count() * self.elem.width()
    }

    /// True when the channel lies entirely within a block of `block_len`
    /// bytes.
    #[must_use]
    pub fn fits_within(&self, block_len: usize) -> bool {
        self.offset
            .checked_add(self.byte_len())
            .is_some_and(|end| end <= block_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_match_types() {
        assert_eq!(ElemType::U8.width(), 1);
        assert_eq!(ElemType::I16.width(), 2);
        assert_eq!(ElemType::F32.width(), 4);
        assert_eq!(ElemType::U64.width(), 8);
    }

    #[test]
    fn wire_codes_round_trip() {
        for raw in 0..=9u8 {
            let elem = ElemType::from_wire(raw).unwrap();
            assert_eq!(elem.as_wire(), raw);
        }
        assert!(ElemType::from_wire(10).is_none());
    }

    #[test]
    fn bounds_check_uses_byte_length() {
        let ch = ChannelDescriptor::vector(0, "/osc/out", 8, 4, ElemType::F64);
        assert_eq!(ch.byte_len(), 32);
        assert!(ch.fits_within(40));
        assert!(!ch.fits_within(39));
    }

    #[test]
    fn name_is_last_path_segment() {
        let ch = ChannelDescriptor::vector(3, "/plant/valve/cmd", 0, 1, ElemType::F64);
        assert_eq!(ch.name, "cmd");
    }
}
