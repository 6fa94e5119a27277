//! Top-level declaration scanner.
//!
//! Line-oriented, brace-depth aware. Only loose `in`/`out`/`uniform`
//! declarations become table entries; block declarations, functions,
//! preprocessor lines and anything unrecognized stay verbatim, so the
//! serialized output reproduces them exactly.

use super::{DeclQualifier, Declaration, Item, LayoutQualifiers};

/// Split a source into the `#version` line and the item list.
pub(super) fn scan(source: &str) -> (Option<String>, Vec<Item>) {
    let mut version: Option<String> = None;
    let mut items: Vec<Item> = Vec::new();
    let mut depth: i32 = 0;
    let mut in_block_comment = false;
    // Raw text and comment-stripped view of a statement in progress.
    let mut pending_raw = String::new();
    let mut pending_code = String::new();

    for line in source.lines() {
        let code = strip_comments(line, &mut in_block_comment);

        if depth > 0 {
            items.push(Item::Verbatim(line.to_string()));
            depth += brace_delta(&code);
            continue;
        }

        let trimmed = code.trim();
        if pending_raw.is_empty() {
            if trimmed.starts_with('#') {
                if version.is_none() && trimmed.starts_with("#version") {
                    version = Some(line.to_string());
                } else {
                    items.push(Item::Verbatim(line.to_string()));
                }
                continue;
            }
            if trimmed.is_empty() {
                items.push(Item::Verbatim(line.to_string()));
                continue;
            }
        }

        if !pending_raw.is_empty() {
            pending_raw.push('\n');
            pending_code.push(' ');
        }
        pending_raw.push_str(line);
        pending_code.push_str(&code);

        if pending_code.contains('{') {
            // Start of a function or block declaration; keep verbatim.
            depth += brace_delta(&pending_code);
            items.push(Item::Verbatim(std::mem::take(&mut pending_raw)));
            pending_code.clear();
        } else if pending_code.trim_end().ends_with(';') {
            match parse_declaration(&pending_code) {
                Some(decl) => items.push(Item::Decl(decl)),
                None => items.push(Item::Verbatim(pending_raw.clone())),
            }
            pending_raw.clear();
            pending_code.clear();
        }
    }

    if !pending_raw.is_empty() {
        items.push(Item::Verbatim(pending_raw));
    }

    (version, items)
}

/// Remove `//` and `/* */` comment text from one line, tracking multi-line
/// block comments through `in_block`.
fn strip_comments(line: &str, in_block: &mut bool) -> String {
    let mut out = String::with_capacity(line.len());
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if *in_block {
            if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                *in_block = false;
                i += 2;
            } else {
                i += 1;
            }
        } else if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            break;
        } else if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            *in_block = true;
            i += 2;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

fn brace_delta(code: &str) -> i32 {
    let mut delta = 0;
    for ch in code.chars() {
        match ch {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Try to parse one statement as a loose declaration. Returns `None` for
/// anything the table does not model; the caller keeps those verbatim.
fn parse_declaration(statement: &str) -> Option<Declaration> {
    let mut s = statement.trim();
    s = s.strip_suffix(';')?.trim_end();

    let mut layout = LayoutQualifiers::default();
    if let Some(rest) = s.strip_prefix("layout") {
        let rest = rest.trim_start();
        let inner_end = rest.find(')')?;
        if inner_end == 0 {
            return None;
        }
        let inner = rest.strip_prefix('(')?.get(..inner_end - 1)?;
        for qual in inner.split(',') {
            let qual = qual.trim();
            let (key, value) = match qual.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => return None,
            };
            let value: u32 = value.parse().ok()?;
            match key {
                "location" => layout.location = Some(value),
                "binding" => layout.binding = Some(value),
                "set" => layout.set = Some(value),
                "component" => layout.component = Some(value),
                _ => return None,
            }
        }
        s = rest[inner_end + 1..].trim_start();
    }

    let (decl_part, initializer) = match s.split_once('=') {
        Some((d, init)) => (d.trim_end(), Some(init.trim().to_string())),
        None => (s, None),
    };

    let tokens: Vec<&str> = decl_part.split_whitespace().collect();
    let mut flat = false;
    let mut idx = 0;
    while idx < tokens.len() && tokens[idx] == "flat" {
        flat = true;
        idx += 1;
    }

    let qualifier = match tokens.get(idx)? {
        &"in" => DeclQualifier::In,
        &"out" => DeclQualifier::Out,
        &"uniform" => DeclQualifier::Uniform,
        _ => return None,
    };
    idx += 1;

    let type_name = *tokens.get(idx)?;
    idx += 1;
    let declarator = *tokens.get(idx)?;
    idx += 1;
    if idx != tokens.len() {
        return None;
    }

    let (name, array) = match declarator.find('[') {
        Some(pos) => {
            if !declarator.ends_with(']') {
                return None;
            }
            (&declarator[..pos], Some(declarator[pos..].to_string()))
        }
        None => (declarator, None),
    };

    if !is_identifier(type_name) || !is_identifier(name) {
        return None;
    }

    Some(Declaration {
        qualifier,
        type_name: type_name.to_string(),
        name: name.to_string(),
        array,
        layout,
        flat,
        initializer,
    })
}
