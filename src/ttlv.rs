//! TTLV (Tag-Type-Length-Value) codec — KMIP's binary wire format (§4.1).
//!
//! Layout per item: 3-byte big-endian tag, 1-byte type, 4-byte big-endian
//! length (of the *unpadded* value), value, zero padding out to an 8-byte
//! boundary. Structures nest: a Structure's value is the concatenation of
//! its children's encoded items.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag(pub u32);

impl Tag {
    pub const fn new(b0: u8, b1: u8, b2: u8) -> Self {
        Tag(u32::from_be_bytes([0, b0, b1, b2]))
    }

    fn to_be_bytes3(self) -> [u8; 3] {
        let b = self.0.to_be_bytes();
        [b[1], b[2], b[3]]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    Structure = 0x01,
    Integer = 0x02,
    LongInteger = 0x03,
    BigInteger = 0x04,
    Enumeration = 0x05,
    Boolean = 0x06,
    TextString = 0x07,
    ByteString = 0x08,
    DateTime = 0x09,
    Interval = 0x0A,
}

impl ItemType {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0x01 => ItemType::Structure,
            0x02 => ItemType::Integer,
            0x03 => ItemType::LongInteger,
            0x04 => ItemType::BigInteger,
            0x05 => ItemType::Enumeration,
            0x06 => ItemType::Boolean,
            0x07 => ItemType::TextString,
            0x08 => ItemType::ByteString,
            0x09 => ItemType::DateTime,
            0x0A => ItemType::Interval,
            other => {
                return Err(Error::ProtocolMismatch {
                    reason: format!("unknown TTLV type byte 0x{other:02x}"),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Structure(Vec<Item>),
    Integer(i32),
    LongInteger(i64),
    BigInteger(Vec<u8>),
    Enumeration(u32),
    Boolean(bool),
    TextString(String),
    ByteString(Vec<u8>),
    DateTime(i64),
    Interval(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub tag: Tag,
    pub value: Value,
}

impl Item {
    pub fn structure(tag: Tag, children: Vec<Item>) -> Self {
        Item { tag, value: Value::Structure(children) }
    }
    pub fn integer(tag: Tag, v: i32) -> Self {
        Item { tag, value: Value::Integer(v) }
    }
    pub fn long_integer(tag: Tag, v: i64) -> Self {
        Item { tag, value: Value::LongInteger(v) }
    }
    pub fn enumeration(tag: Tag, v: u32) -> Self {
        Item { tag, value: Value::Enumeration(v) }
    }
    pub fn boolean(tag: Tag, v: bool) -> Self {
        Item { tag, value: Value::Boolean(v) }
    }
    pub fn text_string(tag: Tag, v: impl Into<String>) -> Self {
        Item { tag, value: Value::TextString(v.into()) }
    }
    pub fn byte_string(tag: Tag, v: impl Into<Vec<u8>>) -> Self {
        Item { tag, value: Value::ByteString(v.into()) }
    }
    pub fn date_time(tag: Tag, v: i64) -> Self {
        Item { tag, value: Value::DateTime(v) }
    }
    pub fn interval(tag: Tag, v: u32) -> Self {
        Item { tag, value: Value::Interval(v) }
    }

    fn item_type(&self) -> ItemType {
        match &self.value {
            Value::Structure(_) => ItemType::Structure,
            Value::Integer(_) => ItemType::Integer,
            Value::LongInteger(_) => ItemType::LongInteger,
            Value::BigInteger(_) => ItemType::BigInteger,
            Value::Enumeration(_) => ItemType::Enumeration,
            Value::Boolean(_) => ItemType::Boolean,
            Value::TextString(_) => ItemType::TextString,
            Value::ByteString(_) => ItemType::ByteString,
            Value::DateTime(_) => ItemType::DateTime,
            Value::Interval(_) => ItemType::Interval,
        }
    }

    /// Encodes this item (and, recursively, its children) onto `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_be_bytes3());
        out.push(self.item_type() as u8);

        let mut body = Vec::new();
        match &self.value {
            Value::Structure(children) => {
                for child in children {
                    child.encode(&mut body);
                }
            }
            Value::Integer(v) => body.extend_from_slice(&v.to_be_bytes()),
            Value::LongInteger(v) => body.extend_from_slice(&v.to_be_bytes()),
            Value::BigInteger(v) => body.extend_from_slice(v),
            Value::Enumeration(v) => body.extend_from_slice(&v.to_be_bytes()),
            Value::Boolean(v) => {
                let n: u64 = if *v { 1 } else { 0 };
                body.extend_from_slice(&n.to_be_bytes());
            }
            Value::TextString(v) => body.extend_from_slice(v.as_bytes()),
            Value::ByteString(v) => body.extend_from_slice(v),
            Value::DateTime(v) => body.extend_from_slice(&v.to_be_bytes()),
            Value::Interval(v) => body.extend_from_slice(&v.to_be_bytes()),
        }

        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        let pad = pad_len(body.len());
        out.extend(std::iter::repeat(0u8).take(pad));
    }

    /// Decodes one item (header + value + padding) from the front of `buf`,
    /// returning the item and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Item, usize)> {
        if buf.len() < 8 {
            return Err(Error::ProtocolMismatch {
                reason: "truncated TTLV header".into(),
            });
        }
        let tag = Tag(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]));
        let item_type = ItemType::from_u8(buf[3])?;
        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let value_start = 8;
        let value_end = value_start
            .checked_add(len)
            .ok_or_else(|| Error::ProtocolMismatch { reason: "TTLV length overflow".into() })?;
        if buf.len() < value_end {
            return Err(Error::ProtocolMismatch {
                reason: "TTLV value shorter than declared length".into(),
            });
        }
        let value_bytes = &buf[value_start..value_end];

        let value = match item_type {
            ItemType::Structure => {
                let mut children = Vec::new();
                let mut off = 0;
                while off < value_bytes.len() {
                    let (child, used) = Item::decode(&value_bytes[off..])?;
                    children.push(child);
                    off += used;
                }
                Value::Structure(children)
            }
            ItemType::Integer => Value::Integer(decode_exact_i32(value_bytes)?),
            ItemType::LongInteger => Value::LongInteger(decode_exact_i64(value_bytes)?),
            ItemType::BigInteger => Value::BigInteger(value_bytes.to_vec()),
            ItemType::Enumeration => Value::Enumeration(decode_exact_u32(value_bytes)?),
            ItemType::Boolean => {
                let n = decode_exact_u64(value_bytes)?;
                match n {
                    0 => Value::Boolean(false),
                    1 => Value::Boolean(true),
                    other => {
                        return Err(Error::ProtocolMismatch {
                            reason: format!("boolean value out of range: {other}"),
                        })
                    }
                }
            }
            ItemType::TextString => {
                let s = String::from_utf8(value_bytes.to_vec()).map_err(|_| {
                    Error::ProtocolMismatch { reason: "text string not valid utf-8".into() }
                })?;
                Value::TextString(s)
            }
            ItemType::ByteString => Value::ByteString(value_bytes.to_vec()),
            ItemType::DateTime => Value::DateTime(decode_exact_i64(value_bytes)?),
            ItemType::Interval => Value::Interval(decode_exact_u32(value_bytes)?),
        };

        let pad = pad_len(len);
        let total = value_end + pad;
        if buf.len() < total {
            return Err(Error::ProtocolMismatch { reason: "TTLV missing padding bytes".into() });
        }
        Ok((Item { tag, value }, total))
    }

    /// First direct child under this item with the given tag, if this item
    /// is a Structure. Returns `None` rather than failing — callers decide
    /// whether absence is a `ProtocolMismatch`.
    pub fn child(&self, tag: Tag) -> Option<&Item> {
        match &self.value {
            Value::Structure(children) => children.iter().find(|c| c.tag == tag),
            _ => None,
        }
    }

    pub fn require_child(&self, tag: Tag) -> Result<&Item> {
        self.child(tag).ok_or_else(|| Error::ProtocolMismatch {
            reason: format!("missing required TTLV child tag {:?} under {:?}", tag, self.tag),
        })
    }

    pub fn as_text_string(&self) -> Result<&str> {
        match &self.value {
            Value::TextString(s) => Ok(s),
            _ => Err(Error::ProtocolMismatch { reason: "expected TextString".into() }),
        }
    }

    pub fn as_byte_string(&self) -> Result<&[u8]> {
        match &self.value {
            Value::ByteString(b) => Ok(b),
            _ => Err(Error::ProtocolMismatch { reason: "expected ByteString".into() }),
        }
    }

    pub fn as_enumeration(&self) -> Result<u32> {
        match &self.value {
            Value::Enumeration(v) => Ok(*v),
            _ => Err(Error::ProtocolMismatch { reason: "expected Enumeration".into() }),
        }
    }

    pub fn as_integer(&self) -> Result<i32> {
        match &self.value {
            Value::Integer(v) => Ok(*v),
            _ => Err(Error::ProtocolMismatch { reason: "expected Integer".into() }),
        }
    }
}

fn pad_len(unpadded: usize) -> usize {
    let rem = unpadded % 8;
    if rem == 0 { 0 } else { 8 - rem }
}

fn decode_exact_u32(buf: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = buf
        .try_into()
        .map_err(|_| Error::ProtocolMismatch { reason: "expected 4-byte integer".into() })?;
    Ok(u32::from_be_bytes(arr))
}

fn decode_exact_i32(buf: &[u8]) -> Result<i32> {
    let arr: [u8; 4] = buf
        .try_into()
        .map_err(|_| Error::ProtocolMismatch { reason: "expected 4-byte integer".into() })?;
    Ok(i32::from_be_bytes(arr))
}

fn decode_exact_i64(buf: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = buf
        .try_into()
        .map_err(|_| Error::ProtocolMismatch { reason: "expected 8-byte integer".into() })?;
    Ok(i64::from_be_bytes(arr))
}

fn decode_exact_u64(buf: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = buf
        .try_into()
        .map_err(|_| Error::ProtocolMismatch { reason: "expected 8-byte integer".into() })?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG_A: Tag = Tag::new(0x42, 0x00, 0x01);
    const TAG_B: Tag = Tag::new(0x42, 0x00, 0x02);

    #[test]
    fn text_string_padding_is_exact() {
        // A 3-byte TextString: 3-byte tag + 1-byte type + 4-byte length +
        // 3 value bytes + 5 pad bytes = 16 bytes total (§8 scenario 6).
        let item = Item::text_string(TAG_A, "abc");
        let mut buf = Vec::new();
        item.encode(&mut buf);
        assert_eq!(buf.len(), 16);

        let (decoded, used) = Item::decode(&buf).unwrap();
        assert_eq!(used, 16);
        assert_eq!(decoded.as_text_string().unwrap(), "abc");
    }

    #[test]
    fn encode_decode_roundtrip_all_types() {
        let items = vec![
            Item::integer(TAG_A, -7),
            Item::long_integer(TAG_A, -123456789012),
            Item::enumeration(TAG_A, 42),
            Item::boolean(TAG_A, true),
            Item::boolean(TAG_A, false),
            Item::text_string(TAG_A, "hello kmip"),
            Item::byte_string(TAG_A, vec![1, 2, 3, 4, 5]),
            Item::date_time(TAG_A, 1_700_000_000),
            Item::interval(TAG_A, 3600),
        ];
        for item in items {
            let mut buf = Vec::new();
            item.encode(&mut buf);
            let (decoded, used) = Item::decode(&buf).unwrap();
            assert_eq!(used, buf.len());
            assert_eq!(decoded.value, item.value);
        }
    }

    #[test]
    fn nested_structure_roundtrip() {
        let inner = Item::structure(
            TAG_B,
            vec![Item::integer(TAG_A, 1), Item::text_string(TAG_A, "leaf")],
        );
        let outer = Item::structure(TAG_A, vec![inner.clone(), Item::boolean(TAG_B, true)]);

        let mut buf = Vec::new();
        outer.encode(&mut buf);
        let (decoded, used) = Item::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, outer);

        let found_inner = decoded.child(TAG_B).unwrap();
        assert_eq!(found_inner.child(TAG_A).unwrap().as_integer().unwrap(), 1);
    }

    #[test]
    fn first_match_lookup_policy() {
        let s = Item::structure(
            TAG_A,
            vec![Item::integer(TAG_B, 1), Item::integer(TAG_B, 2)],
        );
        assert_eq!(s.child(TAG_B).unwrap().as_integer().unwrap(), 1);
    }

    #[test]
    fn missing_required_child_is_protocol_mismatch() {
        let s = Item::structure(TAG_A, vec![]);
        let err = s.require_child(TAG_B).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolMismatch);
    }

    #[test]
    fn strict_integer_parsing_rejects_excess_bytes() {
        // Hand-build a malformed Integer item with a 5-byte value.
        let mut buf = Vec::new();
        buf.extend_from_slice(&TAG_A.to_be_bytes3());
        buf.push(ItemType::Integer as u8);
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0, 1]);
        buf.extend(std::iter::repeat(0u8).take(pad_len(5)));

        let err = Item::decode(&buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolMismatch);
    }

    #[test]
    fn decode_then_encode_is_byte_identical() {
        let item = Item::structure(
            TAG_A,
            vec![Item::text_string(TAG_B, "round trip"), Item::integer(TAG_B, -99)],
        );
        let mut original = Vec::new();
        item.encode(&mut original);

        let (decoded, used) = Item::decode(&original).unwrap();
        assert_eq!(used, original.len());

        let mut re_encoded = Vec::new();
        decoded.encode(&mut re_encoded);
        assert_eq!(original, re_encoded);
    }
}
