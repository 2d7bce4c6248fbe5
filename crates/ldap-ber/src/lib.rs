//! A small BER (ITU-T X.690) element codec, covering the subset of BER that
//! LDAP (RFC 4511) puts on the wire: single-byte tags, definite lengths, and
//! nested constructed values.
//!
//! Decoding is incremental-friendly: [`decode`] reports how many bytes one
//! complete element consumed, and distinguishes "the buffer does not yet hold
//! a complete element" ([`Error::Incomplete`]) from malformed input, so a
//! caller can keep appending reads to its buffer until a full PDU arrives.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer ends before one complete element does. Read more bytes.
    #[error("incomplete BER element")]
    Incomplete,
    #[error("malformed BER element: {0}")]
    Invalid(&'static str),
}

/// Tag class from the identifier octet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Class {
    Universal,
    Application,
    Context,
    Private,
}

/// A decoded identifier octet. LDAP never uses the high-tag-number form, so
/// `number` is always below 31.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tag {
    pub class: Class,
    pub constructed: bool,
    pub number: u8,
}

// Universal tag numbers LDAP traffics in.
pub const TAG_BOOLEAN: u8 = 1;
pub const TAG_INTEGER: u8 = 2;
pub const TAG_OCTET_STRING: u8 = 4;
pub const TAG_NULL: u8 = 5;
pub const TAG_ENUMERATED: u8 = 10;
pub const TAG_SEQUENCE: u8 = 16;
pub const TAG_SET: u8 = 17;

impl Tag {
    pub fn universal(number: u8) -> Tag {
        Tag {
            class: Class::Universal,
            constructed: matches!(number, TAG_SEQUENCE | TAG_SET),
            number,
        }
    }

    pub fn application(number: u8, constructed: bool) -> Tag {
        Tag {
            class: Class::Application,
            constructed,
            number,
        }
    }

    pub fn context(number: u8, constructed: bool) -> Tag {
        Tag {
            class: Class::Context,
            constructed,
            number,
        }
    }

    fn identifier_octet(&self) -> u8 {
        let class = match self.class {
            Class::Universal => 0b0000_0000,
            Class::Application => 0b0100_0000,
            Class::Context => 0b1000_0000,
            Class::Private => 0b1100_0000,
        };
        class | if self.constructed { 0b0010_0000 } else { 0 } | self.number
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Primitive(Vec<u8>),
    Constructed(Vec<Element>),
}

/// One BER element: a tag and either raw contents or child elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: Tag,
    pub value: Value,
}

impl Element {
    pub fn primitive(tag: Tag, content: Vec<u8>) -> Element {
        Element {
            tag,
            value: Value::Primitive(content),
        }
    }

    pub fn constructed(tag: Tag, children: Vec<Element>) -> Element {
        Element {
            tag,
            value: Value::Constructed(children),
        }
    }

    /// A SEQUENCE of `children`.
    pub fn sequence(children: Vec<Element>) -> Element {
        Element::constructed(Tag::universal(TAG_SEQUENCE), children)
    }

    /// An INTEGER holding `v`, minimally encoded.
    pub fn integer(v: i64) -> Element {
        Element::primitive(Tag::universal(TAG_INTEGER), encode_i64(v))
    }

    /// An OCTET STRING holding `content`.
    pub fn octet_string(content: impl Into<Vec<u8>>) -> Element {
        Element::primitive(Tag::universal(TAG_OCTET_STRING), content.into())
    }

    /// An ENUMERATED holding `v`.
    pub fn enumerated(v: i64) -> Element {
        Element::primitive(Tag::universal(TAG_ENUMERATED), encode_i64(v))
    }

    /// Child elements of a constructed value, or an empty slice.
    pub fn children(&self) -> &[Element] {
        match &self.value {
            Value::Constructed(c) => c,
            Value::Primitive(_) => &[],
        }
    }

    /// Primitive contents, or None for constructed values.
    pub fn content(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Primitive(c) => Some(c),
            Value::Constructed(_) => None,
        }
    }

    /// Contents interpreted as a big-endian two's-complement integer.
    /// None for constructed, empty, or over-long (> 8 octet) contents.
    pub fn as_i64(&self) -> Option<i64> {
        let content = self.content()?;
        if content.is_empty() || content.len() > 8 {
            return None;
        }
        let mut v: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
        for b in content {
            v = (v << 8) | *b as i64;
        }
        Some(v)
    }

    /// Encoded size of this element, headers included.
    pub fn encoded_len(&self) -> usize {
        let content_len = self.content_len();
        1 + len_of_len(content_len) + content_len
    }

    fn content_len(&self) -> usize {
        match &self.value {
            Value::Primitive(c) => c.len(),
            Value::Constructed(children) => children.iter().map(Element::encoded_len).sum(),
        }
    }

    /// Append this element's encoding to `out`. Lengths are always the
    /// minimal definite form, so decode-then-encode reproduces input bytes
    /// whenever the peer also encoded minimally (all mainstream LDAP
    /// implementations do).
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag.identifier_octet());
        encode_len(self.content_len(), out);
        match &self.value {
            Value::Primitive(c) => out.extend_from_slice(c),
            Value::Constructed(children) => {
                for child in children {
                    child.encode(out);
                }
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }
}

/// Minimal two's-complement encoding of `v`, at least one octet.
pub fn encode_i64(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    // Strip redundant leading octets, keeping the sign bit intact.
    while start < 7 {
        let first = bytes[start];
        let next = bytes[start + 1];
        if (first == 0x00 && next & 0x80 == 0) || (first == 0xff && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

fn len_of_len(content_len: usize) -> usize {
    if content_len < 128 {
        1
    } else {
        let mut n = content_len;
        let mut octets = 0;
        while n > 0 {
            octets += 1;
            n >>= 8;
        }
        1 + octets
    }
}

fn encode_len(content_len: usize, out: &mut Vec<u8>) {
    if content_len < 128 {
        out.push(content_len as u8);
    } else {
        let octets = len_of_len(content_len) - 1;
        out.push(0x80 | octets as u8);
        for i in (0..octets).rev() {
            out.push((content_len >> (8 * i)) as u8);
        }
    }
}

const MAX_DEPTH: usize = 32;

/// Decode one complete element from the front of `buf`, returning it along
/// with the number of bytes it consumed. `Error::Incomplete` means more bytes
/// are needed; any other error means the buffer can never become valid.
pub fn decode(buf: &[u8]) -> Result<(Element, usize), Error> {
    decode_at(buf, 0)
}

fn decode_at(buf: &[u8], depth: usize) -> Result<(Element, usize), Error> {
    if depth > MAX_DEPTH {
        return Err(Error::Invalid("nesting too deep"));
    }
    if buf.is_empty() {
        return Err(Error::Incomplete);
    }

    let ident = buf[0];
    let number = ident & 0b0001_1111;
    if number == 0b0001_1111 {
        return Err(Error::Invalid("high-tag-number form is not used by LDAP"));
    }
    let tag = Tag {
        class: match ident >> 6 {
            0 => Class::Universal,
            1 => Class::Application,
            2 => Class::Context,
            _ => Class::Private,
        },
        constructed: ident & 0b0010_0000 != 0,
        number,
    };

    let (content_len, header_len) = decode_len(&buf[1..])?;
    let header_len = 1 + header_len;
    let total = header_len
        .checked_add(content_len)
        .ok_or(Error::Invalid("length overflow"))?;
    if buf.len() < total {
        return Err(Error::Incomplete);
    }
    let content = &buf[header_len..total];

    let value = if tag.constructed {
        let mut children = Vec::new();
        let mut rest = content;
        while !rest.is_empty() {
            match decode_at(rest, depth + 1) {
                Ok((child, used)) => {
                    children.push(child);
                    rest = &rest[used..];
                }
                // The outer length octets promised complete contents, so a
                // short child is corruption rather than a pending read.
                Err(Error::Incomplete) => {
                    return Err(Error::Invalid("constructed contents are truncated"))
                }
                Err(e) => return Err(e),
            }
        }
        Value::Constructed(children)
    } else {
        Value::Primitive(content.to_vec())
    };

    Ok((Element { tag, value }, total))
}

// Returns (content length, number of length octets).
fn decode_len(buf: &[u8]) -> Result<(usize, usize), Error> {
    let Some(&first) = buf.first() else {
        return Err(Error::Incomplete);
    };
    if first < 128 {
        return Ok((first as usize, 1));
    }
    if first == 0x80 {
        return Err(Error::Invalid("indefinite lengths are forbidden in LDAP"));
    }
    let octets = (first & 0x7f) as usize;
    if octets > std::mem::size_of::<usize>() {
        return Err(Error::Invalid("length is too large"));
    }
    if buf.len() < 1 + octets {
        return Err(Error::Incomplete);
    }
    let mut len: usize = 0;
    for &b in &buf[1..1 + octets] {
        len = (len << 8) | b as usize;
    }
    Ok((len, 1 + octets))
}

#[cfg(test)]
mod test {
    use super::*;

    fn bind_request() -> Element {
        Element::sequence(vec![
            Element::integer(1),
            Element::constructed(
                Tag::application(0, true),
                vec![
                    Element::integer(3),
                    Element::octet_string(&b"cn=admin,dc=example,dc=test"[..]),
                    Element::primitive(Tag::context(0, false), b"hunter2".to_vec()),
                ],
            ),
        ])
    }

    #[test]
    fn round_trip() {
        let msg = bind_request();
        let bytes = msg.to_vec();
        assert_eq!(bytes.len(), msg.encoded_len());

        let (decoded, used) = decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, msg);
        assert_eq!(decoded.to_vec(), bytes);
    }

    #[test]
    fn incomplete_then_complete() {
        let bytes = bind_request().to_vec();

        // Every proper prefix wants more data, never errors.
        for cut in 0..bytes.len() {
            match decode(&bytes[..cut]) {
                Err(Error::Incomplete) => (),
                other => panic!("prefix of {cut} bytes gave {other:?}"),
            }
        }

        // Trailing bytes are left unconsumed for the next message.
        let mut two = bytes.clone();
        two.extend_from_slice(&bytes);
        let (_, used) = decode(&two).unwrap();
        assert_eq!(used, bytes.len());
        let (_, used) = decode(&two[used..]).unwrap();
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn long_form_length() {
        let blob = vec![0xabu8; 300];
        let el = Element::octet_string(blob.clone());
        let bytes = el.to_vec();
        // 0x04, 0x82, 0x01, 0x2c, then contents.
        assert_eq!(&bytes[..4], &[0x04, 0x82, 0x01, 0x2c]);

        let (decoded, used) = decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.content(), Some(&blob[..]));
    }

    #[test]
    fn integer_encoding_is_minimal() {
        for (v, expect) in [
            (0i64, vec![0x00]),
            (127, vec![0x7f]),
            (128, vec![0x00, 0x80]),
            (255, vec![0x00, 0xff]),
            (256, vec![0x01, 0x00]),
            (-1, vec![0xff]),
            (-129, vec![0xff, 0x7f]),
        ] {
            assert_eq!(encode_i64(v), expect, "value {v}");
            let el = Element::integer(v);
            assert_eq!(el.as_i64(), Some(v));
        }
    }

    #[test]
    fn rejects_malformed_input() {
        // Indefinite length.
        assert!(matches!(
            decode(&[0x30, 0x80, 0x00, 0x00]),
            Err(Error::Invalid(_))
        ));
        // Constructed contents that end mid-child.
        assert!(matches!(
            decode(&[0x30, 0x03, 0x02, 0x05, 0x01]),
            Err(Error::Invalid(_))
        ));
        // High-tag-number form.
        assert!(matches!(decode(&[0x1f, 0x81, 0x00]), Err(Error::Invalid(_))));
    }
}
