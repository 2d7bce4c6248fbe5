//! Formatting of the annotated JSON document into the three-column layout
//! the operator edits, and back. The type annotations embedded in keys and
//! values (`Tag~name`, `content#Type`) are pulled out to the left and right
//! columns, pipe-separated, with padding so the columns line up between the
//! configured minimum and maximum widths.
//!
//! Un-mangling assumes the editor preserved the column structure: the `|`
//! separators must survive, and string contents must not grow their own
//! pipes.

use crate::Error;

/// Byte index of the first `:` that sits outside any quoted token. This
/// does not handle JSON escaping in general, only enough to track whether
/// we are inside a string while scanning for the key/value separator.
pub fn find_separator(line: &str) -> Option<usize> {
    let mut in_token = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if (c == '"' || c == '\'') && !escaped {
            in_token = !in_token;
            continue;
        }
        if c == '\\' && !escaped && in_token {
            escaped = true;
            continue;
        }
        if c == ':' && !in_token {
            return Some(i);
        }
        if escaped {
            escaped = false;
        }
    }
    None
}

enum Pre<'a> {
    /// No top-level `:` on this line.
    Plain(&'a str),
    /// Key part and value part, with the `: ` between them dropped.
    KeyVal(&'a str, &'a str),
}

/// Rework an indent-2 JSON document whose annotations are embedded in its
/// strings into the aligned three-column editing layout.
pub fn raw_to_editable(json_doc: &str, min_width: usize, max_width: usize) -> String {
    let pre: Vec<Pre> = json_doc
        .lines()
        .map(|line| match find_separator(line) {
            Some(i) => match line.get(i + 2..) {
                Some(val) => Pre::KeyVal(&line[..i], val),
                None => Pre::Plain(line),
            },
            None => Pre::Plain(line),
        })
        .collect();

    // Left column width: the widest key annotation.
    let mut left_padding = 0;
    for p in &pre {
        if let Pre::KeyVal(key, _) = p {
            let meta_part = key.split('~').next().unwrap_or("");
            if let Some((_, meta)) = meta_part.split_once('"') {
                left_padding = left_padding.max(meta.chars().count());
            }
        }
    }

    // Emit everything but the right column, remembering each line's value
    // annotation for after the right padding is known.
    let mut formatted: Vec<String> = Vec::with_capacity(pre.len());
    let mut right_metadata: Vec<Option<String>> = Vec::with_capacity(pre.len());
    for p in &pre {
        match p {
            Pre::KeyVal(key, val) => {
                let (key_meta_part, key_content) = key.split_once('~').unwrap_or((key, ""));
                let (leading, key_meta) =
                    key_meta_part.split_once('"').unwrap_or(("", key_meta_part));

                let (val_main, val_meta) = split_value_annotation(val);
                let pad = " ".repeat(left_padding.saturating_sub(key_meta.chars().count()));
                formatted.push(format!(
                    "{pad}{key_meta} | {leading}\"{key_content}: {val_main}"
                ));
                right_metadata.push(val_meta);
            }
            Pre::Plain(line) => {
                let (val_main, val_meta) = split_value_annotation(line);
                let pad = " ".repeat(left_padding);
                formatted.push(format!("{pad} | {val_main}"));
                right_metadata.push(val_meta);
            }
        }
    }

    // Right column position: at least min_width, stretched by any line
    // under max_width. Longer lines keep their annotation unaligned rather
    // than padding everything else out to match.
    let mut right_padding = min_width;
    for line in &formatted {
        let len = line.chars().count();
        if len > right_padding && len < max_width {
            right_padding = len;
        }
    }

    let mut out = Vec::with_capacity(formatted.len());
    for (line, meta) in formatted.iter().zip(&right_metadata) {
        let pad = " ".repeat(right_padding.saturating_sub(line.chars().count()));
        out.push(format!("{line}{pad} | {}", meta.as_deref().unwrap_or("")));
    }
    out.join("\n")
}

// Pull the `#Type` annotation out of a value, reattaching the closing
// quote. Structural lines ({, }, null, ...) carry no annotation.
fn split_value_annotation(val: &str) -> (String, Option<String>) {
    if let Some((content, rest)) = val.rsplit_once('#') {
        if let Some((meta, trailing)) = rest.rsplit_once('"') {
            return (format!("{content}\"{trailing}"), Some(meta.to_string()));
        }
    }
    (val.to_string(), None)
}

/// Recover the annotated JSON lines from an edited document. Inverse of
/// [`raw_to_editable`] up to insignificant whitespace.
pub fn editable_to_raw(doc: &str) -> Result<Vec<String>, Error> {
    let mut raw = Vec::with_capacity(doc.lines().count());
    for line in doc.lines() {
        let Some((key_meta, remain)) = line.split_once('|') else {
            return Err(Error::Printable(format!(
                "line {line:?} lost its column separators"
            )));
        };
        let Some((content, val_meta)) = remain.rsplit_once('|') else {
            return Err(Error::Printable(format!(
                "line {line:?} lost its column separators"
            )));
        };

        let rebuilt = match find_separator(content) {
            Some(sep) => {
                let key = content[..sep].trim_start();
                let val = content.get(sep + 2..).unwrap_or("").trim_end();
                let Some((leading, key_rest)) = key.split_once('"') else {
                    return Err(Error::Printable(format!("line {line:?} lost its key")));
                };
                let key = format!("{leading}\"{}~{key_rest}", key_meta.trim());
                let val = match val.rsplit_once('"') {
                    Some((main, trailing)) => {
                        format!("{main}#{}\"{trailing}", val_meta.trim())
                    }
                    None => val.to_string(),
                };
                format!("{key}: {val}")
            }
            None => match content.rsplit_once('"') {
                Some((elem, trailing)) => {
                    format!("{elem}#{}\"{trailing}", val_meta.trim())
                }
                None => content.to_string(),
            },
        };
        raw.push(rebuilt);
    }
    Ok(raw)
}
