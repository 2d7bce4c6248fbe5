//! Conversion between decoded LDAP elements and the JSON document the
//! operator edits. Every key carries the element's BER tag to the left of a
//! `~` and a field name to the right; every primitive value carries its
//! content type after a `#`. Both annotations are what lets an edited
//! document be re-encoded to the exact bytes the peer expects.

use std::collections::BTreeMap;

use ldap_ber::{Class, Element, Tag, Value as BerValue};
use ldap_ber::{TAG_BOOLEAN, TAG_ENUMERATED, TAG_INTEGER, TAG_NULL, TAG_OCTET_STRING, TAG_SEQUENCE,
    TAG_SET};
use serde_json::{Map, Value};

use crate::Error;

/// Raw bytes elided from the document, keyed by child-index path.
pub type ElidedValues = BTreeMap<Vec<usize>, Vec<u8>>;

/// Render a decoded LDAPMessage as the annotated JSON document. Values that
/// are not representable in JSON (non-UTF-8 octets) become `null` and their
/// bytes are returned separately, keyed by path.
pub fn element_to_document(message: &Element) -> (Value, ElidedValues) {
    let mut elided = ElidedValues::new();
    let doc = constructed_to_value(message, Parent::Root, &mut Vec::new(), &mut elided);
    (doc, elided)
}

/// Rebuild an LDAPMessage from a parsed document, restoring elided values
/// from `state`. The document's key annotations drive re-encoding; field
/// names are cosmetic and ignored.
pub fn document_to_element(doc: &Value, state: &ElidedValues) -> Result<Element, Error> {
    let Value::Object(map) = doc else {
        return Err(Error::Printable("the edited document is not an object".into()));
    };
    let children = object_to_children(map, &mut Vec::new(), state)?;
    Ok(Element::sequence(children))
}

#[derive(Copy, Clone)]
enum Parent {
    /// The LDAPMessage sequence itself.
    Root,
    /// A protocol op, by application tag number.
    Op(u8),
    Other,
}

fn constructed_to_value(
    el: &Element,
    parent: Parent,
    path: &mut Vec<usize>,
    elided: &mut ElidedValues,
) -> Value {
    let mut map = Map::new();
    for (index, child) in el.children().iter().enumerate() {
        path.push(index);
        let key = format!(
            "{}~{}",
            tag_descriptor(&child.tag),
            child_name(parent, index, child)
        );
        let value = match &child.value {
            BerValue::Constructed(_) => {
                let inner_parent = match child.tag.class {
                    Class::Application => Parent::Op(child.tag.number),
                    _ => Parent::Other,
                };
                constructed_to_value(child, inner_parent, path, elided)
            }
            BerValue::Primitive(content) => match render_primitive(&child.tag, content) {
                Rendered::Text(text, meta) => Value::String(format!("{text}#{meta}")),
                Rendered::Elided => {
                    elided.insert(path.clone(), content.clone());
                    Value::Null
                }
            },
        };
        map.insert(key, value);
        path.pop();
    }
    Value::Object(map)
}

fn object_to_children(
    map: &Map<String, Value>,
    path: &mut Vec<usize>,
    state: &ElidedValues,
) -> Result<Vec<Element>, Error> {
    let mut children = Vec::with_capacity(map.len());
    for (index, (key, value)) in map.iter().enumerate() {
        path.push(index);
        let descriptor = key.split_once('~').map(|(d, _)| d).unwrap_or(key);
        let element = match value {
            Value::Object(inner) => Element::constructed(
                parse_tag_descriptor(descriptor, true)?,
                object_to_children(inner, path, state)?,
            ),
            Value::Null => {
                // Either a value we elided (restore it) or one the operator
                // nulled out (encode as empty).
                let content = state.get(path).cloned().unwrap_or_default();
                Element::primitive(parse_tag_descriptor(descriptor, false)?, content)
            }
            Value::String(s) => {
                let (content, meta) = s.rsplit_once('#').ok_or_else(|| {
                    Error::Printable(format!("value {s:?} is missing its #type annotation"))
                })?;
                Element::primitive(
                    parse_tag_descriptor(descriptor, false)?,
                    parse_primitive(content, meta)?,
                )
            }
            other => {
                return Err(Error::Printable(format!(
                    "unsupported JSON value {other} in the edited document"
                )))
            }
        };
        children.push(element);
        path.pop();
    }
    Ok(children)
}

fn tag_descriptor(tag: &Tag) -> String {
    match tag.class {
        Class::Universal => match tag.number {
            TAG_BOOLEAN => "Boolean".into(),
            TAG_INTEGER => "Integer".into(),
            TAG_OCTET_STRING => "OctetString".into(),
            TAG_NULL => "Null".into(),
            TAG_ENUMERATED => "Enumerated".into(),
            TAG_SEQUENCE => "Sequence".into(),
            TAG_SET => "Set".into(),
            n => format!("Universal({n})"),
        },
        Class::Application => format!("Application({})", tag.number),
        Class::Context => format!("Context({})", tag.number),
        Class::Private => format!("Private({})", tag.number),
    }
}

fn parse_tag_descriptor(descriptor: &str, constructed: bool) -> Result<Tag, Error> {
    let mut tag = match descriptor {
        "Boolean" => Tag::universal(TAG_BOOLEAN),
        "Integer" => Tag::universal(TAG_INTEGER),
        "OctetString" => Tag::universal(TAG_OCTET_STRING),
        "Null" => Tag::universal(TAG_NULL),
        "Enumerated" => Tag::universal(TAG_ENUMERATED),
        "Sequence" => Tag::universal(TAG_SEQUENCE),
        "Set" => Tag::universal(TAG_SET),
        _ => {
            let (class, number) = descriptor
                .strip_suffix(')')
                .and_then(|d| d.split_once('('))
                .and_then(|(class, num)| num.parse::<u8>().ok().map(|n| (class, n)))
                .ok_or_else(|| {
                    Error::Printable(format!("unrecognized tag annotation {descriptor:?}"))
                })?;
            match class {
                "Universal" => Tag {
                    class: Class::Universal,
                    constructed,
                    number,
                },
                "Application" => Tag::application(number, constructed),
                "Context" => Tag::context(number, constructed),
                "Private" => Tag {
                    class: Class::Private,
                    constructed,
                    number,
                },
                _ => {
                    return Err(Error::Printable(format!(
                        "unrecognized tag annotation {descriptor:?}"
                    )))
                }
            }
        }
    };
    // The JSON shape decides constructed-ness for anything the name alone
    // does not pin down.
    tag.constructed = tag.constructed || constructed;
    Ok(tag)
}

enum Rendered {
    Text(String, &'static str),
    Elided,
}

fn render_primitive(tag: &Tag, content: &[u8]) -> Rendered {
    if tag.class == Class::Universal {
        match tag.number {
            TAG_BOOLEAN => return Rendered::Text(render_bool(content), "Boolean"),
            TAG_INTEGER => return Rendered::Text(render_int(content), "Integer"),
            TAG_ENUMERATED => return Rendered::Text(render_int(content), "Enumerated"),
            TAG_NULL if content.is_empty() => return Rendered::Text(String::new(), "Null"),
            _ => (),
        }
    }
    match std::str::from_utf8(content) {
        Ok(s) => Rendered::Text(s.to_string(), "OctetString"),
        Err(_) => Rendered::Elided,
    }
}

fn parse_primitive(content: &str, meta: &str) -> Result<Vec<u8>, Error> {
    match meta {
        "Boolean" => parse_bool(content),
        "Integer" | "Enumerated" => parse_int(content),
        "Null" => Ok(Vec::new()),
        "OctetString" => Ok(content.as_bytes().to_vec()),
        other => Err(Error::Printable(format!(
            "unrecognized type annotation {other:?}"
        ))),
    }
}

// Booleans render canonically where possible, but odd encodings (BER allows
// any nonzero octet for TRUE) fall back to decimal so bytes survive a
// round-trip untouched.
fn render_bool(content: &[u8]) -> String {
    match content {
        [0xff] => "true".into(),
        [0x00] => "false".into(),
        [b] => b.to_string(),
        other => render_hex(other),
    }
}

fn parse_bool(content: &str) -> Result<Vec<u8>, Error> {
    match content {
        "true" => Ok(vec![0xff]),
        "false" => Ok(vec![0x00]),
        hex if hex.starts_with("0x") => parse_hex(hex),
        dec => dec
            .parse::<u8>()
            .map(|b| vec![b])
            .map_err(|_| Error::Printable(format!("unparseable boolean {content:?}"))),
    }
}

fn render_int(content: &[u8]) -> String {
    if content.is_empty() || content.len() > 8 {
        return render_hex(content);
    }
    let mut v: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for b in content {
        v = (v << 8) | *b as i64;
    }
    v.to_string()
}

fn parse_int(content: &str) -> Result<Vec<u8>, Error> {
    if content.starts_with("0x") {
        return parse_hex(content);
    }
    content
        .parse::<i64>()
        .map(ldap_ber::encode_i64)
        .map_err(|_| Error::Printable(format!("unparseable integer {content:?}")))
}

fn render_hex(content: &[u8]) -> String {
    let mut out = String::with_capacity(2 + content.len() * 2);
    out.push_str("0x");
    for b in content {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn parse_hex(content: &str) -> Result<Vec<u8>, Error> {
    let digits = content.trim_start_matches("0x");
    if digits.len() % 2 != 0 {
        return Err(Error::Printable(format!("odd-length hex value {content:?}")));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| Error::Printable(format!("unparseable hex value {content:?}")))
        })
        .collect()
}

fn child_name(parent: Parent, index: usize, child: &Element) -> String {
    match parent {
        Parent::Root => match (index, child.tag.class) {
            (0, Class::Universal) => "messageID".into(),
            (_, Class::Application) => op_name(child.tag.number).into(),
            (_, Class::Context) if child.tag.number == 0 => "controls".into(),
            _ => format!("item{index}"),
        },
        Parent::Op(op) => {
            let fields = op_fields(op);
            if index < fields.len() {
                return fields[index].into();
            }
            if child.tag.class == Class::Context {
                if let Some(name) = op_context_name(op, child.tag.number) {
                    return name.into();
                }
            }
            format!("item{index}")
        }
        Parent::Other => format!("item{index}"),
    }
}

fn op_name(number: u8) -> &'static str {
    match number {
        0 => "bindRequest",
        1 => "bindResponse",
        2 => "unbindRequest",
        3 => "searchRequest",
        4 => "searchResEntry",
        5 => "searchResDone",
        6 => "modifyRequest",
        7 => "modifyResponse",
        8 => "addRequest",
        9 => "addResponse",
        10 => "delRequest",
        11 => "delResponse",
        12 => "modDNRequest",
        13 => "modDNResponse",
        14 => "compareRequest",
        15 => "compareResponse",
        16 => "abandonRequest",
        19 => "searchResRef",
        23 => "extendedReq",
        24 => "extendedResp",
        25 => "intermediateResponse",
        _ => "protocolOp",
    }
}

fn op_fields(number: u8) -> &'static [&'static str] {
    match number {
        0 => &["version", "name", "authentication"],
        1 | 5 | 7 | 9 | 11 | 13 | 15 | 24 => &["resultCode", "matchedDN", "diagnosticMessage"],
        3 => &[
            "baseObject",
            "scope",
            "derefAliases",
            "sizeLimit",
            "timeLimit",
            "typesOnly",
            "filter",
            "attributes",
        ],
        4 => &["objectName", "attributes"],
        6 => &["object", "changes"],
        8 => &["entry", "attributes"],
        12 => &["entry", "newrdn", "deleteoldrdn"],
        14 => &["entry", "ava"],
        _ => &[],
    }
}

fn op_context_name(op: u8, ctx: u8) -> Option<&'static str> {
    match (op, ctx) {
        (1, 7) => Some("serverSaslCreds"),
        (1 | 5 | 7 | 9 | 11 | 13 | 15 | 24, 3) => Some("referral"),
        (23, 0) => Some("requestName"),
        (23, 1) => Some("requestValue"),
        (24, 10) => Some("responseName"),
        (24, 11) => Some("responseValue"),
        (12, 0) => Some("newSuperior"),
        _ => None,
    }
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
    fn document_round_trip() {
        let msg = bind_request();
        let (doc, elided) = element_to_document(&msg);
        assert!(elided.is_empty());

        let rebuilt = document_to_element(&doc, &elided).unwrap();
        assert_eq!(rebuilt, msg);
        assert_eq!(rebuilt.to_vec(), msg.to_vec());
    }

    #[test]
    fn field_names_are_annotated() {
        let (doc, _) = element_to_document(&bind_request());
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["Integer~messageID", "Application(0)~bindRequest"]);

        let op = &doc["Application(0)~bindRequest"];
        let keys: Vec<&String> = op.as_object().unwrap().keys().collect();
        assert_eq!(
            keys,
            ["Integer~version", "OctetString~name", "Context(0)~authentication"]
        );
        assert_eq!(op["Integer~version"], "3#Integer");
        assert_eq!(op["Context(0)~authentication"], "hunter2#OctetString");
    }

    #[test]
    fn non_utf8_values_are_elided_and_restored() {
        let msg = Element::sequence(vec![
            Element::integer(7),
            Element::constructed(
                Tag::application(23, true),
                vec![Element::primitive(
                    Tag::context(1, false),
                    vec![0x80, 0x81, 0xff],
                )],
            ),
        ]);
        let (doc, elided) = element_to_document(&msg);
        assert_eq!(elided.len(), 1);
        assert_eq!(elided.get(&vec![1, 0]), Some(&vec![0x80, 0x81, 0xff]));
        assert!(doc["Application(23)~extendedReq"]["Context(1)~requestValue"].is_null());

        let rebuilt = document_to_element(&doc, &elided).unwrap();
        assert_eq!(rebuilt.to_vec(), msg.to_vec());
    }

    #[test]
    fn odd_boolean_encodings_survive() {
        for content in [vec![0xff], vec![0x00], vec![0x01]] {
            let msg = Element::sequence(vec![Element::primitive(
                Tag::universal(TAG_BOOLEAN),
                content.clone(),
            )]);
            let (doc, elided) = element_to_document(&msg);
            let rebuilt = document_to_element(&doc, &elided).unwrap();
            assert_eq!(rebuilt.children()[0].content(), Some(&content[..]));
        }
    }

    #[test]
    fn edited_integers_re_encode() {
        let msg = bind_request();
        let (mut doc, elided) = element_to_document(&msg);
        doc["Integer~messageID"] = Value::String("2#Integer".into());

        let rebuilt = document_to_element(&doc, &elided).unwrap();
        assert_eq!(rebuilt.children()[0].as_i64(), Some(2));
    }
}
