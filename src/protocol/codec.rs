//! Text-line wire codec.
//!
//! Each inbound protocol message is one line of text. The first
//! comma-delimited token selects the variant; a catalog of fixed-grammar
//! patterns extracts typed fields. Decoding never panics past its boundary:
//! any mismatch yields [`Error::MalformedMessage`] carrying the original
//! line, and numeric fields are parsed with explicit range checking rather
//! than defaulting to zero.
//!
//! # Field quoting
//!
//! Literal text is quoted with two-character backslash escapes for the bytes
//! that collide with framing:
//!
//! | Escape | Byte |
//! |--------|------|
//! | `\\` | backslash |
//! | `\r` | carriage return |
//! | `\n` | line feed |
//! | `\p` | `\|` (field separator) |
//! | `\c` | `,` (token separator) |
//!
//! [`quote`] and [`unquote`] are exact inverses; a dangling or unknown
//! escape makes the whole line malformed.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::protocol::message::{FieldValue, Message, UNORDERED_MESSAGES};

// ============================================================================
// Pattern Catalog
// ============================================================================

/// Compile-once catalog of fixed-grammar message patterns.
///
/// Initialized lazily and never mutated afterwards; patterns are anchored so
/// trailing junk is rejected.
struct PatternCatalog {
    conok: Regex,
    conerr: Regex,
    reqok: Regex,
    reqerr: Regex,
    error: Regex,
    subok: Regex,
    subcmd: Regex,
    unsub: Regex,
    constrain: Regex,
    conf: Regex,
    sync: Regex,
    clear_snapshot: Regex,
    end_of_snapshot: Regex,
    overflow: Regex,
    r#loop: Regex,
    end: Regex,
    prog: Regex,
    servname: Regex,
    clientip: Regex,
}

static PATTERNS: LazyLock<PatternCatalog> = LazyLock::new(|| PatternCatalog {
    conok: compile(r"^CONOK,([^,]+),(\d+),(\d+),([^,]+)$"),
    conerr: compile(r"^CONERR,(-?\d+),(.*)$"),
    reqok: compile(r"^REQOK(?:,(\d+))?$"),
    reqerr: compile(r"^REQERR,(\d+),(-?\d+),(.*)$"),
    error: compile(r"^ERROR,(-?\d+),(.*)$"),
    subok: compile(r"^SUBOK,(\d+),(\d+),(\d+)$"),
    subcmd: compile(r"^SUBCMD,(\d+),(\d+),(\d+),(\d+),(\d+)$"),
    unsub: compile(r"^UNSUB,(\d+)$"),
    constrain: compile(r"^CONS,(unmanaged|unlimited|\d+(?:\.\d+)?)$"),
    conf: compile(r"^CONF,(\d+),(unlimited|\d+(?:\.\d+)?),(filtered|unfiltered)$"),
    sync: compile(r"^SYNC,(\d+)$"),
    clear_snapshot: compile(r"^CS,(\d+),(\d+)$"),
    end_of_snapshot: compile(r"^EOS,(\d+),(\d+)$"),
    overflow: compile(r"^OV,(\d+),(\d+),(\d+)$"),
    r#loop: compile(r"^LOOP,(\d+)$"),
    end: compile(r"^END,(-?\d+),(.*)$"),
    prog: compile(r"^PROG,(\d+)$"),
    servname: compile(r"^SERVNAME,(.+)$"),
    clientip: compile(r"^CLIENTIP,(.+)$"),
});

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    // The catalog is fixed at compile time; a bad pattern is a programming
    // error caught by the codec tests.
    Regex::new(pattern).expect("invalid wire pattern")
}

/// Matches a line against its grammar, reporting any mismatch as a
/// malformed message carrying the original text.
fn must_match<'t>(re: &Regex, line: &'t str) -> Result<regex::Captures<'t>> {
    re.captures(line).ok_or_else(|| Error::malformed(line))
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes one protocol line into a typed [`Message`].
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] with the original text when the line
/// matches no known grammar, a numeric field is out of range, or quoting is
/// invalid.
pub fn decode(line: &str) -> Result<Message> {
    let head = line.split(',').next().unwrap_or(line);
    match head {
        "CONOK" => decode_conok(line),
        "CONERR" => {
            let caps = must_match(&PATTERNS.conerr, line)?;
            Ok(Message::Conerr {
                code: parse_i32(&caps[1], line)?,
                message: unquote_field(&caps[2], line)?,
            })
        }
        "REQOK" => {
            let caps = must_match(&PATTERNS.reqok, line)?;
            let request_id = match caps.get(1) {
                Some(m) => Some(parse_u64(m.as_str(), line)?),
                None => None,
            };
            Ok(Message::Reqok { request_id })
        }
        "REQERR" => {
            let caps = must_match(&PATTERNS.reqerr, line)?;
            Ok(Message::Reqerr {
                request_id: parse_u64(&caps[1], line)?,
                code: parse_i32(&caps[2], line)?,
                message: unquote_field(&caps[3], line)?,
            })
        }
        "ERROR" => {
            let caps = must_match(&PATTERNS.error, line)?;
            Ok(Message::Error {
                code: parse_i32(&caps[1], line)?,
                message: unquote_field(&caps[2], line)?,
            })
        }
        "SUBOK" => {
            let caps = must_match(&PATTERNS.subok, line)?;
            Ok(Message::Subok {
                table: parse_u32(&caps[1], line)?,
                items: parse_u32(&caps[2], line)?,
                fields: parse_u32(&caps[3], line)?,
            })
        }
        "SUBCMD" => {
            let caps = must_match(&PATTERNS.subcmd, line)?;
            Ok(Message::Subcmd {
                table: parse_u32(&caps[1], line)?,
                items: parse_u32(&caps[2], line)?,
                fields: parse_u32(&caps[3], line)?,
                key_position: parse_u32(&caps[4], line)?,
                command_position: parse_u32(&caps[5], line)?,
            })
        }
        "UNSUB" => {
            let caps = must_match(&PATTERNS.unsub, line)?;
            Ok(Message::Unsub {
                table: parse_u32(&caps[1], line)?,
            })
        }
        "CONS" => {
            let caps = must_match(&PATTERNS.constrain, line)?;
            Ok(Message::Constrain {
                bandwidth: caps[1].to_string(),
            })
        }
        "CONF" => {
            let caps = must_match(&PATTERNS.conf, line)?;
            Ok(Message::Conf {
                table: parse_u32(&caps[1], line)?,
                frequency: caps[2].to_string(),
                filtered: &caps[3] == "filtered",
            })
        }
        "SYNC" => {
            let caps = must_match(&PATTERNS.sync, line)?;
            Ok(Message::Sync {
                seconds: parse_u64(&caps[1], line)?,
            })
        }
        "CS" => {
            let caps = must_match(&PATTERNS.clear_snapshot, line)?;
            Ok(Message::ClearSnapshot {
                table: parse_u32(&caps[1], line)?,
                item: parse_u32(&caps[2], line)?,
            })
        }
        "EOS" => {
            let caps = must_match(&PATTERNS.end_of_snapshot, line)?;
            Ok(Message::EndOfSnapshot {
                table: parse_u32(&caps[1], line)?,
                item: parse_u32(&caps[2], line)?,
            })
        }
        "OV" => {
            let caps = must_match(&PATTERNS.overflow, line)?;
            Ok(Message::Overflow {
                table: parse_u32(&caps[1], line)?,
                item: parse_u32(&caps[2], line)?,
                lost: parse_u32(&caps[3], line)?,
            })
        }
        "LOOP" => {
            let caps = must_match(&PATTERNS.r#loop, line)?;
            Ok(Message::Loop {
                expected_delay_ms: parse_u64(&caps[1], line)?,
            })
        }
        "END" => {
            let caps = must_match(&PATTERNS.end, line)?;
            Ok(Message::End {
                code: parse_i32(&caps[1], line)?,
                message: unquote_field(&caps[2], line)?,
            })
        }
        "PROG" => {
            let caps = must_match(&PATTERNS.prog, line)?;
            Ok(Message::Prog {
                prog: parse_u64(&caps[1], line)?,
            })
        }
        "SERVNAME" => {
            let caps = must_match(&PATTERNS.servname, line)?;
            Ok(Message::ServerName(unquote_field(&caps[1], line)?))
        }
        "CLIENTIP" => {
            let caps = must_match(&PATTERNS.clientip, line)?;
            Ok(Message::ClientIp(caps[1].to_string()))
        }
        "U" => decode_update(line),
        "MSGDONE" | "MSGFAIL" => decode_user_message(line),
        "PROBE" if line == "PROBE" => Ok(Message::Probe),
        "NOOP" => Ok(Message::Noop),
        _ => Err(Error::malformed(line)),
    }
}

fn decode_conok(line: &str) -> Result<Message> {
    let caps = must_match(&PATTERNS.conok, line)?;
    let control_link = match &caps[4] {
        "*" => None,
        link => Some(unquote_field(link, line)?),
    };
    Ok(Message::Conok {
        session_id: caps[1].to_string(),
        request_limit: parse_u64(&caps[2], line)?,
        keepalive_ms: parse_u64(&caps[3], line)?,
        control_link,
    })
}

/// Decodes `U,<table>,<item>,<f1>|<f2>|...`.
///
/// Field rules: empty token → `Unchanged`; `#` → `Null`; `$` → `Empty`;
/// `^<n>` → `n` consecutive `Unchanged` markers; anything else is unquoted
/// literal text. A `#` or `$` followed by more characters is a quoting error.
fn decode_update(line: &str) -> Result<Message> {
    let rest = line
        .strip_prefix("U,")
        .ok_or_else(|| Error::malformed(line))?;
    let (table_token, rest) = rest
        .split_once(',')
        .ok_or_else(|| Error::malformed(line))?;
    let (item_token, field_list) = rest
        .split_once(',')
        .ok_or_else(|| Error::malformed(line))?;

    let table = parse_u32(table_token, line)?;
    let item = parse_u32(item_token, line)?;

    let mut fields = Vec::new();
    for token in field_list.split('|') {
        match token {
            "" => fields.push(FieldValue::Unchanged),
            "#" => fields.push(FieldValue::Null),
            "$" => fields.push(FieldValue::Empty),
            _ if token.starts_with('#') || token.starts_with('$') => {
                return Err(Error::malformed(line));
            }
            _ => {
                if let Some(count) = token.strip_prefix('^') {
                    let count = parse_u32(count, line)?;
                    if count == 0 {
                        return Err(Error::malformed(line));
                    }
                    for _ in 0..count {
                        fields.push(FieldValue::Unchanged);
                    }
                } else {
                    fields.push(FieldValue::Literal(unquote_field(token, line)?));
                }
            }
        }
    }

    Ok(Message::Update { table, item, fields })
}

/// Decodes `MSGDONE,<seq>,<prog>` and `MSGFAIL,<seq>,<prog>,<code>,<msg>`.
fn decode_user_message(line: &str) -> Result<Message> {
    let tokens: Vec<&str> = line.split(',').collect();
    match tokens.as_slice() {
        ["MSGDONE", sequence, prog] => Ok(Message::MsgDone {
            sequence: decode_sequence(sequence),
            prog: parse_u32(prog, line)?,
        }),
        ["MSGFAIL", sequence, prog, code, message] => Ok(Message::MsgFail {
            sequence: decode_sequence(sequence),
            prog: parse_u32(prog, line)?,
            code: parse_i32(code, line)?,
            message: unquote_field(message, line)?,
        }),
        _ => Err(Error::malformed(line)),
    }
}

fn decode_sequence(token: &str) -> String {
    if token == "*" {
        UNORDERED_MESSAGES.to_string()
    } else {
        token.to_string()
    }
}

// ============================================================================
// Numeric Parsing
// ============================================================================

fn parse_u32(field: &str, line: &str) -> Result<u32> {
    field.parse().map_err(|_| Error::malformed(line))
}

fn parse_u64(field: &str, line: &str) -> Result<u64> {
    field.parse().map_err(|_| Error::malformed(line))
}

fn parse_i32(field: &str, line: &str) -> Result<i32> {
    field.parse().map_err(|_| Error::malformed(line))
}

// ============================================================================
// Quoting
// ============================================================================

/// Quotes literal text for inclusion in a protocol line.
///
/// Exact inverse of [`unquote`].
#[must_use]
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str(r"\\"),
            '\r' => out.push_str(r"\r"),
            '\n' => out.push_str(r"\n"),
            '|' => out.push_str(r"\p"),
            ',' => out.push_str(r"\c"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reverses the two-character escapes produced by [`quote`].
///
/// Returns `None` on a dangling backslash or unknown escape.
#[must_use]
pub fn unquote(token: &str) -> Option<String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            'r' => out.push('\r'),
            'n' => out.push('\n'),
            'p' => out.push('|'),
            'c' => out.push(','),
            _ => return None,
        }
    }
    Some(out)
}

fn unquote_field(token: &str, line: &str) -> Result<String> {
    unquote(token).ok_or_else(|| Error::malformed(line))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_conok() {
        let msg = decode("CONOK,S1,50000,5000,*").expect("decode");
        assert_eq!(
            msg,
            Message::Conok {
                session_id: "S1".into(),
                request_limit: 50000,
                keepalive_ms: 5000,
                control_link: None,
            }
        );
    }

    #[test]
    fn test_decode_conok_control_link() {
        let msg = decode("CONOK,S7af,1000,3000,node2.example.com").expect("decode");
        assert_eq!(
            msg,
            Message::Conok {
                session_id: "S7af".into(),
                request_limit: 1000,
                keepalive_ms: 3000,
                control_link: Some("node2.example.com".into()),
            }
        );
    }

    #[test]
    fn test_decode_conerr_negative_code() {
        let msg = decode("CONERR,-5,client too old").expect("decode");
        assert_eq!(
            msg,
            Message::Conerr { code: -5, message: "client too old".into() }
        );
    }

    #[test]
    fn test_decode_update_field_kinds() {
        // 5-field schema with a ^2 unchanged run in the middle
        let msg = decode("U,3,7,alpha|#|^2|beta").expect("decode");
        assert_eq!(
            msg,
            Message::Update {
                table: 3,
                item: 7,
                fields: vec![
                    FieldValue::Literal("alpha".into()),
                    FieldValue::Null,
                    FieldValue::Unchanged,
                    FieldValue::Unchanged,
                    FieldValue::Literal("beta".into()),
                ],
            }
        );
    }

    #[test]
    fn test_decode_update_empty_and_dollar() {
        let msg = decode("U,1,1,|$|x").expect("decode");
        assert_eq!(
            msg,
            Message::Update {
                table: 1,
                item: 1,
                fields: vec![
                    FieldValue::Unchanged,
                    FieldValue::Empty,
                    FieldValue::Literal("x".into()),
                ],
            }
        );
    }

    #[test]
    fn test_decode_update_quoted_literal() {
        let msg = decode(r"U,1,1,a\cb\p\n").expect("decode");
        assert_eq!(
            msg,
            Message::Update {
                table: 1,
                item: 1,
                fields: vec![FieldValue::Literal("a,b|\n".into())],
            }
        );
    }

    #[test]
    fn test_decode_update_malformed() {
        // non-numeric item
        assert!(matches!(
            decode("U,3,seven,alpha"),
            Err(Error::MalformedMessage { .. })
        ));
        // bad quoting: payload after #
        assert!(decode("U,1,1,#x").is_err());
        // zero-length unchanged run
        assert!(decode("U,1,1,^0").is_err());
        // missing field list
        assert!(decode("U,3,7").is_err());
    }

    #[test]
    fn test_numeric_overflow_is_malformed() {
        assert!(decode("SUBOK,99999999999999999999,2,3").is_err());
        assert!(decode("SYNC,18446744073709551616").is_err());
    }

    #[test]
    fn test_decode_subok_unsub() {
        assert_eq!(
            decode("SUBOK,1,2,3").expect("decode"),
            Message::Subok { table: 1, items: 2, fields: 3 }
        );
        assert_eq!(decode("UNSUB,4").expect("decode"), Message::Unsub { table: 4 });
        assert!(decode("SUBOK,1,2").is_err());
    }

    #[test]
    fn test_decode_subcmd() {
        assert_eq!(
            decode("SUBCMD,2,10,4,1,2").expect("decode"),
            Message::Subcmd {
                table: 2,
                items: 10,
                fields: 4,
                key_position: 1,
                command_position: 2,
            }
        );
    }

    #[test]
    fn test_decode_reqok_variants() {
        assert_eq!(
            decode("REQOK,12").expect("decode"),
            Message::Reqok { request_id: Some(12) }
        );
        assert_eq!(decode("REQOK").expect("decode"), Message::Reqok { request_id: None });
    }

    #[test]
    fn test_decode_reqerr() {
        assert_eq!(
            decode("REQERR,7,20,Session not found").expect("decode"),
            Message::Reqerr {
                request_id: 7,
                code: 20,
                message: "Session not found".into(),
            }
        );
    }

    #[test]
    fn test_decode_end_and_loop() {
        assert_eq!(
            decode("END,-1,forced closure").expect("decode"),
            Message::End { code: -1, message: "forced closure".into() }
        );
        assert_eq!(
            decode("LOOP,0").expect("decode"),
            Message::Loop { expected_delay_ms: 0 }
        );
    }

    #[test]
    fn test_decode_conf() {
        assert_eq!(
            decode("CONF,3,unlimited,filtered").expect("decode"),
            Message::Conf { table: 3, frequency: "unlimited".into(), filtered: true }
        );
        assert_eq!(
            decode("CONF,3,4.5,unfiltered").expect("decode"),
            Message::Conf { table: 3, frequency: "4.5".into(), filtered: false }
        );
        assert!(decode("CONF,3,sometimes,filtered").is_err());
    }

    #[test]
    fn test_decode_cons() {
        assert_eq!(
            decode("CONS,unmanaged").expect("decode"),
            Message::Constrain { bandwidth: "unmanaged".into() }
        );
        assert_eq!(
            decode("CONS,40.0").expect("decode"),
            Message::Constrain { bandwidth: "40.0".into() }
        );
    }

    #[test]
    fn test_decode_snapshot_and_overflow() {
        assert_eq!(
            decode("CS,1,2").expect("decode"),
            Message::ClearSnapshot { table: 1, item: 2 }
        );
        assert_eq!(
            decode("EOS,1,2").expect("decode"),
            Message::EndOfSnapshot { table: 1, item: 2 }
        );
        assert_eq!(
            decode("OV,1,2,5").expect("decode"),
            Message::Overflow { table: 1, item: 2, lost: 5 }
        );
    }

    #[test]
    fn test_decode_user_messages() {
        assert_eq!(
            decode("MSGDONE,seq1,5").expect("decode"),
            Message::MsgDone { sequence: "seq1".into(), prog: 5 }
        );
        assert_eq!(
            decode("MSGDONE,*,5").expect("decode"),
            Message::MsgDone { sequence: UNORDERED_MESSAGES.into(), prog: 5 }
        );
        assert_eq!(
            decode("MSGFAIL,seq1,5,39,3").expect("decode"),
            Message::MsgFail {
                sequence: "seq1".into(),
                prog: 5,
                code: 39,
                message: "3".into(),
            }
        );
        assert!(decode("MSGDONE,seq1").is_err());
        assert!(decode("MSGFAIL,seq1,5,39").is_err());
    }

    #[test]
    fn test_decode_misc() {
        assert_eq!(decode("PROBE").expect("decode"), Message::Probe);
        assert_eq!(decode("PROG,42").expect("decode"), Message::Prog { prog: 42 });
        assert_eq!(decode("SYNC,120").expect("decode"), Message::Sync { seconds: 120 });
        assert_eq!(
            decode("SERVNAME,node A").expect("decode"),
            Message::ServerName("node A".into())
        );
        assert_eq!(
            decode("CLIENTIP,10.0.0.7").expect("decode"),
            Message::ClientIp("10.0.0.7".into())
        );
    }

    #[test]
    fn test_pattern_mismatch_is_malformed() {
        // known prefix, wrong arity or junk fields
        assert!(matches!(
            decode("CONOK,S1,50000"),
            Err(Error::MalformedMessage { .. })
        ));
        assert!(decode("CONERR,abc,reason").is_err());
        assert!(decode("LOOP,").is_err());
    }

    #[test]
    fn test_decode_unknown_prefix() {
        assert!(decode("WHAT,1,2").is_err());
        assert!(decode("").is_err());
        assert!(decode("PROBE,extra").is_err());
    }

    #[test]
    fn test_quote_unquote_inverse() {
        let raw = "a,b|c\\d\r\ne";
        let quoted = quote(raw);
        assert!(!quoted.contains(','));
        assert!(!quoted.contains('|'));
        assert_eq!(unquote(&quoted).expect("unquote"), raw);
    }

    #[test]
    fn test_unquote_rejects_bad_escapes() {
        assert!(unquote(r"dangling\").is_none());
        assert!(unquote(r"\z").is_none());
    }

    proptest! {
        // Decoding is total: arbitrary input must never panic, only
        // return Ok or MalformedMessage.
        #[test]
        fn decode_never_panics(line in ".{0,200}") {
            let _ = decode(&line);
        }

        #[test]
        fn quote_roundtrips(text in ".{0,80}") {
            prop_assert_eq!(unquote(&quote(&text)), Some(text));
        }
    }
}
