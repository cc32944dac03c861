//! # Row Value Model
//!
//! `Datum` is the decoded form of a row: the unit the transform pipeline
//! rewrites and the terminals fold. Values are owned, never borrowed from
//! storage, which is what lets the traversal hand decoded rows across
//! worker threads without lifetime entanglement (the borrowed-view form lives
//! in [`RowHandle`](crate::traverse::RowHandle), not here).
//!
//! ## Variants
//!
//! | Variant | Rust Type | Notes |
//! |---------|----------------------------|------------------------------|
//! | Null | - | absent / SQL-ish NULL |
//! | Bool | bool | |
//! | Int | i64 | promoted to f64 vs Float |
//! | Float | f64 | total order via `total_cmp` |
//! | Text | String | UTF-8 |
//! | Array | Vec\<Datum\> | lexicographic order |
//! | Object | BTreeMap\<String, Datum\> | field-sorted, deterministic |
//!
//! ## Total Order
//!
//! Cross-type ordering is by type rank (`Null < Bool < number < Text < Array
//! < Object`), then by value. Int and Float share the number rank and compare
//! numerically. NaN sorts above every other float. The order is total, which
//! is what `min`/`max`/`reduce` candidate comparison and deterministic
//! grouped output rely on.
//!
//! ## Wire Codec
//!
//! Index values are stored encoded; decoding them is the expensive,
//! concurrency-friendly half of materialization. The format is a one-byte
//! tag followed by a varint-length payload:
//!
//! ```text
//! 0x00 Null | 0x01 false | 0x02 true
//! 0x03 Int    zigzag varint
//! 0x04 Float  8-byte big-endian IEEE-754
//! 0x05 Text   varint len + bytes
//! 0x06 Array  varint count + elements
//! 0x07 Object varint count + (varint len + name, element) pairs
//! ```
//!
//! Lengths use the 240/249 marker varint scheme: values 0-240 are one byte,
//! which covers almost every field name and small collection.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use eyre::{bail, ensure, Result};

use crate::errors::{ScanError, ScanResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Datum>),
    Object(BTreeMap<String, Datum>),
}

impl Datum {
    pub fn text(s: impl Into<String>) -> Datum {
        Datum::Text(s.into())
    }

    pub fn object(fields: impl IntoIterator<Item = (&'static str, Datum)>) -> Datum {
        Datum::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) => 2,
            Datum::Text(_) => 3,
            Datum::Array(_) => 4,
            Datum::Object(_) => 5,
        }
    }

    /// Total order across all variants. See the module docs for the rank
    /// table; within the number rank, ints are promoted to f64.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        use Datum::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Text(a), Text(b)) => a.cmp(b),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Object(a), Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    match ka.cmp(kb).then_with(|| va.total_cmp(vb)) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Field lookup with the engine's error semantics: a non-object row is a
    /// row-eval failure, an absent field is `MissingField` (which `filter`
    /// treats as a fallback condition, not a failure).
    pub fn get_field(&self, name: &str) -> ScanResult<&Datum> {
        match self {
            Datum::Object(fields) => fields
                .get(name)
                .ok_or_else(|| ScanError::missing_field(name)),
            other => Err(ScanError::row_eval(format!(
                "expected an object, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "bool",
            Datum::Int(_) => "number",
            Datum::Float(_) => "number",
            Datum::Text(_) => "string",
            Datum::Array(_) => "array",
            Datum::Object(_) => "object",
        }
    }

    /// `null` and `false` are falsey, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Datum::Null | Datum::Bool(false))
    }

    /// Rough in-memory footprint, used for batch byte budgets. Not exact;
    /// stable across runs, which is all the batcher needs.
    pub fn approx_size(&self) -> usize {
        match self {
            Datum::Null | Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) => 8,
            Datum::Text(s) => s.len() + 8,
            Datum::Array(items) => items.iter().map(Datum::approx_size).sum::<usize>() + 8,
            Datum::Object(fields) => {
                fields
                    .iter()
                    .map(|(k, v)| k.len() + v.approx_size())
                    .sum::<usize>()
                    + 8
            }
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Datum::Null => buf.push(0x00),
            Datum::Bool(false) => buf.push(0x01),
            Datum::Bool(true) => buf.push(0x02),
            Datum::Int(v) => {
                buf.push(0x03);
                let zigzag = ((v << 1) ^ (v >> 63)) as u64;
                encode_varint(zigzag, buf);
            }
            Datum::Float(v) => {
                buf.push(0x04);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Datum::Text(s) => {
                buf.push(0x05);
                encode_varint(s.len() as u64, buf);
                buf.extend_from_slice(s.as_bytes());
            }
            Datum::Array(items) => {
                buf.push(0x06);
                encode_varint(items.len() as u64, buf);
                for item in items {
                    item.encode(buf);
                }
            }
            Datum::Object(fields) => {
                buf.push(0x07);
                encode_varint(fields.len() as u64, buf);
                for (name, value) in fields {
                    encode_varint(name.len() as u64, buf);
                    buf.extend_from_slice(name.as_bytes());
                    value.encode(buf);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Datum> {
        let (datum, read) = decode_one(bytes)?;
        ensure!(
            read == bytes.len(),
            "trailing garbage after datum: {} of {} bytes consumed",
            read,
            bytes.len()
        );
        Ok(datum)
    }

    /// Deterministic byte encoding used as the group-map key. Two datums
    /// encode identically iff `total_cmp` says they are equal, which makes
    /// the encoded form safe as a hash key.
    pub fn group_key(&self) -> Vec<u8> {
        // Int/Float share a rank, so a group key of 1 and 1.0 must collide.
        match self {
            Datum::Int(v) => Datum::Float(*v as f64).to_bytes(),
            other => other.to_bytes(),
        }
    }
}

fn decode_one(bytes: &[u8]) -> Result<(Datum, usize)> {
    ensure!(!bytes.is_empty(), "empty datum encoding");
    let tag = bytes[0];
    let rest = &bytes[1..];
    match tag {
        0x00 => Ok((Datum::Null, 1)),
        0x01 => Ok((Datum::Bool(false), 1)),
        0x02 => Ok((Datum::Bool(true), 1)),
        0x03 => {
            let (zigzag, n) = decode_varint(rest)?;
            let v = ((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64);
            Ok((Datum::Int(v), 1 + n))
        }
        0x04 => {
            ensure!(rest.len() >= 8, "truncated float datum");
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&rest[..8]);
            Ok((Datum::Float(f64::from_be_bytes(raw)), 9))
        }
        0x05 => {
            let (len, n) = decode_varint(rest)?;
            // Checked: a hostile length field must not overflow the bound.
            let end = match n.checked_add(len as usize) {
                Some(end) if end <= rest.len() => end,
                _ => bail!("truncated string datum"),
            };
            let s = std::str::from_utf8(&rest[n..end])?.to_string();
            Ok((Datum::Text(s), 1 + end))
        }
        0x06 => {
            let (count, mut off) = decode_varint(rest)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (item, n) = decode_one(&rest[off..])?;
                items.push(item);
                off += n;
            }
            Ok((Datum::Array(items), 1 + off))
        }
        0x07 => {
            let (count, mut off) = decode_varint(rest)?;
            let mut fields = BTreeMap::new();
            for _ in 0..count {
                let (len, n) = decode_varint(&rest[off..])?;
                off += n;
                let end = match off.checked_add(len as usize) {
                    Some(end) if end <= rest.len() => end,
                    _ => bail!("truncated field name"),
                };
                let name = std::str::from_utf8(&rest[off..end])?.to_string();
                off = end;
                let (value, n) = decode_one(&rest[off..])?;
                off += n;
                fields.insert(name, value);
            }
            Ok((Datum::Object(fields), 1 + off))
        }
        other => bail!("unknown datum tag 0x{other:02x}"),
    }
}

/// Variable-length integer, 240/249 marker scheme: one byte for 0-240, two
/// bytes up to 2287, three up to 67823, then 4/5/9-byte big-endian forms.
pub fn encode_varint(value: u64, buf: &mut Vec<u8>) {
    if value <= 240 {
        buf.push(value as u8);
    } else if value <= 2287 {
        let v = value - 240;
        buf.push(241 + (v >> 8) as u8);
        buf.push((v & 0xFF) as u8);
    } else if value <= 67823 {
        let v = value - 2288;
        buf.push(249);
        buf.push((v >> 8) as u8);
        buf.push((v & 0xFF) as u8);
    } else if value <= 0xFF_FFFF {
        buf.push(250);
        buf.extend_from_slice(&value.to_be_bytes()[5..]);
    } else if value <= 0xFFFF_FFFF {
        buf.push(251);
        buf.extend_from_slice(&value.to_be_bytes()[4..]);
    } else {
        buf.push(255);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Returns the decoded value and the number of bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    ensure!(!bytes.is_empty(), "empty varint");
    let marker = bytes[0];
    let need = |n: usize| -> Result<()> {
        ensure!(bytes.len() > n, "truncated varint (marker {marker})");
        Ok(())
    };
    match marker {
        0..=240 => Ok((marker as u64, 1)),
        241..=248 => {
            need(1)?;
            let v = 240 + (((marker - 241) as u64) << 8) + bytes[1] as u64;
            Ok((v, 2))
        }
        249 => {
            need(2)?;
            let v = 2288 + ((bytes[1] as u64) << 8) + bytes[2] as u64;
            Ok((v, 3))
        }
        250 => {
            need(3)?;
            let v = ((bytes[1] as u64) << 16) | ((bytes[2] as u64) << 8) | bytes[3] as u64;
            Ok((v, 4))
        }
        251 => {
            need(4)?;
            let mut v = 0u64;
            for b in &bytes[1..5] {
                v = (v << 8) | *b as u64;
            }
            Ok((v, 5))
        }
        255 => {
            need(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[1..9]);
            Ok((u64::from_be_bytes(raw), 9))
        }
        other => bail!("reserved varint marker {other}"),
    }
}
