//! The simplest handler: no framing at all. One read off the wire is one
//! message, and the printable form is a byte-string literal.

use std::io::ErrorKind;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{
    BoxIo, ConnLocals, Handler, Layer, Message, MessagePair, MessageRecv, MessageSend, Printable,
    Unprintable,
};
use crate::Error;

pub struct RawBytes {
    read_size: usize,
}

impl RawBytes {
    pub fn new(read_size: usize) -> RawBytes {
        RawBytes { read_size }
    }

    fn wrap(&self, lower: Layer) -> Result<Layer, Error> {
        let (rd, wr) = tokio::io::split(lower.into_transport()?);
        Ok(Layer::Messages(MessagePair {
            recv: Box::new(RawRecv {
                rd,
                read_size: self.read_size,
            }),
            send: Box::new(RawSend { wr }),
        }))
    }
}

#[async_trait]
impl Handler for RawBytes {
    fn name(&self) -> &'static str {
        "rawbytes"
    }

    fn frames_messages(&self) -> bool {
        true
    }

    async fn setup_client_facing(&self, lower: Layer, _locals: &ConnLocals) -> Result<Layer, Error> {
        self.wrap(lower)
    }

    async fn setup_server_facing(&self, lower: Layer, _locals: &ConnLocals) -> Result<Layer, Error> {
        self.wrap(lower)
    }

    fn message_to_printable(&self, msg: &Message) -> Result<Printable, Error> {
        let Message::Raw(bytes) = msg else {
            return Err(Error::Printable(
                "rawbytes received a message from a different handler".into(),
            ));
        };
        Ok(Printable {
            text: to_byte_literal(bytes),
            state: Unprintable::None,
        })
    }

    fn printable_to_message(&self, text: &str, _state: &Unprintable) -> Result<Message, Error> {
        Ok(Message::Raw(parse_byte_literal(text)?))
    }
}

struct RawRecv {
    rd: ReadHalf<BoxIo>,
    read_size: usize,
}

#[async_trait]
impl MessageRecv for RawRecv {
    async fn recv(&mut self) -> Result<Option<Message>, Error> {
        let mut buf = vec![0u8; self.read_size];
        match self.rd.read(&mut buf).await {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(Message::Raw(buf)))
            }
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct RawSend {
    wr: WriteHalf<BoxIo>,
}

#[async_trait]
impl MessageSend for RawSend {
    async fn send(&mut self, msg: &Message) -> Result<(), Error> {
        let Message::Raw(bytes) = msg else {
            return Err(Error::Printable(
                "rawbytes asked to send a message from a different handler".into(),
            ));
        };
        self.wr.write_all(bytes).await?;
        self.wr.flush().await?;
        Ok(())
    }
}

/// Render bytes as a `b"..."` literal with standard escapes.
pub fn to_byte_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 3);
    out.push_str("b\"");
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('"');
    out
}

/// Parse a `b"..."` literal back into bytes. Inverse of [`to_byte_literal`]
/// on anything it produced, and tolerant of the escapes a human might add.
pub fn parse_byte_literal(text: &str) -> Result<Vec<u8>, Error> {
    let text = text.trim();
    let inner = text
        .strip_prefix("b\"")
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| Error::Printable("expected a b\"...\" byte literal".into()))?;

    let mut out = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            if !c.is_ascii() {
                return Err(Error::Printable(format!(
                    "non-ASCII character {c:?} in byte literal; use \\x escapes"
                )));
            }
            out.push(c as u8);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('\'') => out.push(b'\''),
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('x') => {
                let hi = chars.next();
                let lo = chars.next();
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(Error::Printable("truncated \\x escape".into()));
                };
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                    .map_err(|_| Error::Printable(format!("bad \\x escape \\x{hi}{lo}")))?;
                out.push(byte);
            }
            other => {
                return Err(Error::Printable(format!(
                    "unsupported escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literal_round_trip() {
        let cases: &[&[u8]] = &[
            b"",
            b"ping\n",
            b"\x00\x01\xfe\xff",
            b"quote \" backslash \\ tab\t",
            b"mixed \x1b[0m ansi",
        ];
        for bytes in cases {
            let lit = to_byte_literal(bytes);
            assert_eq!(parse_byte_literal(&lit).unwrap(), *bytes, "{lit}");
        }
    }

    #[test]
    fn literal_is_readable() {
        assert_eq!(to_byte_literal(b"ping\n"), "b\"ping\\n\"");
        assert_eq!(to_byte_literal(b"\x01hi"), "b\"\\x01hi\"");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_byte_literal("ping").is_err());
        assert!(parse_byte_literal("b\"\\q\"").is_err());
        assert!(parse_byte_literal("b\"\\x0").is_err());
        // Surrounding whitespace from an editor is fine.
        assert_eq!(parse_byte_literal("  b\"ok\"\n").unwrap(), b"ok");
    }
}
