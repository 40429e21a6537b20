//! Shift-reduce parser for IMAP server responses
//!
//! Consumes the chunked reply shape the session layer produces (one byte
//! chunk per response line, with `{N}` literal blobs delivered as their
//! own chunks) and emits a tree of lists and strings. Quoted strings lose
//! their quotes, parenthesized groups nest, `{N}` length markers splice
//! the next N bytes in as a single value, and bare atoms pass through.

use std::collections::HashMap;

/// One node of a parsed IMAP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImapValue {
    Atom(String),
    List(Vec<ImapValue>),
}

impl ImapValue {
    pub fn atom(s: impl Into<String>) -> Self {
        Self::Atom(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Atom(s) => Some(s),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ImapValue]> {
        match self {
            Self::List(items) => Some(items),
            Self::Atom(_) => None,
        }
    }
}

/// Parse a chunked IMAP reply into `(ok, values)`
///
/// `status` is the tagged completion result (`OK` / `NO` / `BAD`); the
/// boolean is true only for `OK`. Unbalanced groups are closed at end of
/// input rather than rejected, mirroring how servers stream partial
/// responses.
pub fn parse_imap(status: &str, chunks: &[&[u8]]) -> (bool, Vec<ImapValue>) {
    let ok = status.eq_ignore_ascii_case("ok");
    let mut stack: Vec<Vec<ImapValue>> = vec![Vec::new()];
    let mut next_is_blob: Option<usize> = None;

    for chunk in chunks {
        let mut rest: &[u8] = chunk;

        if let Some(len) = next_is_blob.take() {
            let take = len.min(rest.len());
            let (blob, tail) = rest.split_at(take);
            push_atom(&mut stack, blob);
            rest = tail;
        }

        while !rest.is_empty() {
            match rest[0] {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    rest = &rest[1..];
                }
                b'"' => {
                    let close = rest[1..]
                        .iter()
                        .position(|b| *b == b'"')
                        .map(|p| p + 1);
                    match close {
                        Some(close) => {
                            push_atom(&mut stack, &rest[1..close]);
                            rest = &rest[close + 1..];
                        }
                        None => {
                            // Unterminated quote: take the rest as-is
                            push_atom(&mut stack, &rest[1..]);
                            rest = &[];
                        }
                    }
                }
                b'(' => {
                    stack.push(Vec::new());
                    rest = &rest[1..];
                }
                b')' => {
                    reduce(&mut stack);
                    rest = &rest[1..];
                }
                _ => {
                    let end = rest
                        .iter()
                        .position(|b| matches!(b, b'(' | b')' | b'"' | b' ' | b'\t' | b'\r' | b'\n'))
                        .unwrap_or(rest.len());
                    let token = &rest[..end];
                    rest = &rest[end..];
                    if token.first() == Some(&b'{') && token.last() == Some(&b'}') {
                        if let Ok(len) = std::str::from_utf8(&token[1..token.len() - 1])
                            .unwrap_or("")
                            .parse::<usize>()
                        {
                            // Literal marker: the next chunk starts with
                            // the blob, anything left on this line is noise
                            next_is_blob = Some(len);
                            break;
                        }
                        push_atom(&mut stack, token);
                    } else {
                        push_atom(&mut stack, token);
                    }
                }
            }
        }
    }

    while stack.len() > 1 {
        reduce(&mut stack);
    }
    (ok, stack.pop().unwrap_or_default())
}

fn push_atom(stack: &mut [Vec<ImapValue>], bytes: &[u8]) {
    if let Some(top) = stack.last_mut() {
        top.push(ImapValue::Atom(
            String::from_utf8_lossy(bytes).into_owned(),
        ));
    }
}

fn reduce(stack: &mut Vec<Vec<ImapValue>>) {
    if stack.len() > 1 {
        let done = stack.pop().unwrap_or_default();
        if let Some(parent) = stack.last_mut() {
            parent.push(ImapValue::List(done));
        }
    }
}

/// Pair up a flat `key value key value` response list into a map
///
/// FETCH responses arrive this way (`RFC822.SIZE 420 FLAGS (\Seen) ...`).
pub fn imap_dict(values: &[ImapValue]) -> HashMap<String, ImapValue> {
    let mut map = HashMap::new();
    let mut iter = values.iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        if let Some(key) = key.as_str() {
            map.insert(key.to_ascii_uppercase(), value.clone());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::{ImapValue, imap_dict, parse_imap};
    use ImapValue::{Atom, List};

    fn atoms(items: &[&str]) -> Vec<ImapValue> {
        items.iter().map(|s| ImapValue::atom(*s)).collect()
    }

    #[test]
    fn literal_inside_group() {
        let (ok, parsed) = parse_imap("OK", &[b"1 (F (X Y) U {2}", b"12", b")"]);
        assert!(ok);
        assert_eq!(
            parsed,
            vec![
                Atom("1".into()),
                List(vec![
                    Atom("F".into()),
                    List(atoms(&["X", "Y"])),
                    Atom("U".into()),
                    Atom("12".into()),
                ]),
            ]
        );
    }

    #[test]
    fn unclosed_group_is_closed_at_end_of_input() {
        let (ok, parsed) = parse_imap("OK", &[b"1 (F (X Y) U {2}", b"12"]);
        assert!(ok);
        assert_eq!(
            parsed,
            vec![
                Atom("1".into()),
                List(vec![
                    Atom("F".into()),
                    List(atoms(&["X", "Y"])),
                    Atom("U".into()),
                    Atom("12".into()),
                ]),
            ]
        );
    }

    #[test]
    fn literal_blob_between_atoms() {
        let (ok, parsed) = parse_imap("OK", &[b"Two {10}", b"0123456789", b"Three"]);
        assert!(ok);
        assert_eq!(parsed, atoms(&["Two", "0123456789", "Three"]));
    }

    #[test]
    fn nested_groups_and_quoted_strings() {
        let (ok, parsed) = parse_imap("OK", &[b"One (Two (Th ree)) \"Four Five\""]);
        assert!(ok);
        assert_eq!(
            parsed,
            vec![
                Atom("One".into()),
                List(vec![Atom("Two".into()), List(atoms(&["Th", "ree"]))]),
                Atom("Four Five".into()),
            ]
        );
    }

    #[test]
    fn non_ok_status_is_false() {
        let (ok, parsed) = parse_imap("BAD", &[b"Sorry"]);
        assert!(!ok);
        assert_eq!(parsed, atoms(&["Sorry"]));
        assert!(parse_imap("ok", &[b"fine"]).0, "status match is case-insensitive");
        assert!(!parse_imap("NO", &[b"nope"]).0);
    }

    #[test]
    fn blob_longer_than_declared_keeps_the_tail_as_tokens() {
        let (ok, parsed) = parse_imap("OK", &[b"A {3}", b"abcdef"]);
        assert!(ok);
        assert_eq!(parsed, atoms(&["A", "abc", "def"]));
    }

    #[test]
    fn dict_pairing_of_fetch_attributes() {
        let (_, parsed) = parse_imap(
            "OK",
            &[b"RFC822.SIZE 420 FLAGS (\\Seen \\Answered) UID 7"],
        );
        let dict = imap_dict(&parsed);
        assert_eq!(dict["RFC822.SIZE"].as_str(), Some("420"));
        assert_eq!(dict["UID"].as_str(), Some("7"));
        assert_eq!(
            dict["FLAGS"].as_list().map(<[ImapValue]>::len),
            Some(2)
        );
    }
}
