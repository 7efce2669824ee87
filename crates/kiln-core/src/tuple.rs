//! Tuple descriptors and the raw row layout they describe.
//!
//! # Row Layout
//!
//! ```text
//! [ null bitmap: ceil(natts / 8) bytes ][ attr 0 ][ pad ][ attr 1 ] ...
//! ```
//!
//! Bit `i % 8` of bitmap byte `i / 8` is set when attribute `i` is `NULL`. Every
//! attribute occupies its slot whether or not it is `NULL`, at an offset aligned to its
//! own width, so offsets are a static property of the descriptor. Values are stored in
//! native byte order.
//!
//! Deforming turns a raw row into one `i64` slot per attribute, with `NULL` mapped to
//! [`NULL_SENTINEL`]; this is what [`Expr::Field`](crate::Expr::Field) reads.

use serde::{Deserialize, Serialize};

use crate::datum::{Datum, NULL_SENTINEL};
use crate::error::ExprError;

/// Physical type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    Bool,
    Int2,
    Int4,
    Int8,
}

impl AttrType {
    /// Width in bytes, which is also the alignment.
    pub fn width(self) -> usize {
        match self {
            AttrType::Bool => 1,
            AttrType::Int2 => 2,
            AttrType::Int4 => 4,
            AttrType::Int8 => 8,
        }
    }
}

/// One attribute of a tuple descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttrDesc {
    pub name: String,
    pub ty: AttrType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl AttrDesc {
    pub fn new(name: impl Into<String>, ty: AttrType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    /// Attribute declared `NOT NULL`; its bitmap bit is never consulted.
    pub fn not_null(name: impl Into<String>, ty: AttrType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }
}

/// Describes the shape of the rows a scan produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TupleDesc {
    pub attrs: Vec<AttrDesc>,
}

impl TupleDesc {
    pub fn new(attrs: Vec<AttrDesc>) -> Self {
        Self { attrs }
    }

    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    pub fn bitmap_len(&self) -> usize {
        self.attrs.len().div_ceil(8)
    }

    /// Byte offset of every attribute within a row.
    pub fn offsets(&self) -> Vec<usize> {
        let mut offset = self.bitmap_len();
        self.attrs
            .iter()
            .map(|attr| {
                let width = attr.ty.width();
                offset = offset.next_multiple_of(width);
                let at = offset;
                offset += width;
                at
            })
            .collect()
    }

    /// Total row length in bytes.
    pub fn row_len(&self) -> usize {
        match (self.attrs.last(), self.offsets().last()) {
            (Some(attr), Some(offset)) => offset + attr.ty.width(),
            _ => self.bitmap_len(),
        }
    }

    pub fn validate(&self) -> Result<(), ExprError> {
        if self.attrs.is_empty() {
            return Err(ExprError::EmptyTuple);
        }
        Ok(())
    }

    /// Encodes `values` as a raw row. Missing trailing values are stored as `NULL`.
    pub fn form_row(&self, values: &[Datum]) -> Vec<u8> {
        let mut row = vec![0u8; self.row_len()];
        for ((i, attr), offset) in self.attrs.iter().enumerate().zip(self.offsets()) {
            let value = values.get(i).copied().unwrap_or(Datum::Null);
            if value.is_null() {
                row[i / 8] |= 1 << (i % 8);
                continue;
            }
            let slot = value.to_slot();
            let end = offset + attr.ty.width();
            match attr.ty {
                AttrType::Bool => row[offset] = (slot != 0) as u8,
                AttrType::Int2 => row[offset..end].copy_from_slice(&(slot as i16).to_ne_bytes()),
                AttrType::Int4 => row[offset..end].copy_from_slice(&(slot as i32).to_ne_bytes()),
                AttrType::Int8 => row[offset..end].copy_from_slice(&slot.to_ne_bytes()),
            }
        }
        row
    }

    /// Interpreted deforming: decodes `row` into one slot per attribute.
    pub fn deform(&self, row: &[u8]) -> Vec<i64> {
        let mut out = vec![NULL_SENTINEL; self.natts()];
        self.deform_into(row, &mut out);
        out
    }

    /// Decodes `row` into `out`, which must hold at least `natts()` slots.
    ///
    /// # Panics
    ///
    /// Panics if `row` is shorter than [`row_len`](Self::row_len) or `out` is too small.
    pub fn deform_into(&self, row: &[u8], out: &mut [i64]) {
        assert!(row.len() >= self.row_len(), "row shorter than descriptor");
        assert!(out.len() >= self.natts(), "output slots shorter than descriptor");
        for ((i, attr), offset) in self.attrs.iter().enumerate().zip(self.offsets()) {
            if attr.nullable && row[i / 8] & (1 << (i % 8)) != 0 {
                out[i] = NULL_SENTINEL;
                continue;
            }
            let bytes = &row[offset..offset + attr.ty.width()];
            out[i] = match attr.ty {
                AttrType::Bool => (bytes[0] != 0) as i64,
                AttrType::Int2 => i16::from_ne_bytes([bytes[0], bytes[1]]) as i64,
                AttrType::Int4 => {
                    i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
                }
                AttrType::Int8 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(bytes);
                    i64::from_ne_bytes(b)
                }
            };
        }
    }
}
