//! NATS subject syntax: tokens separated by `.`, the single-token wildcard
//! `*`, and the trailing multi-token wildcard `>`.

use crate::error::{err, ErrorKind, Result};

/// A single-pass token validity check. Literal subjects (used on publish,
/// and as a Message's `subject`) must not contain `*` or `>`.
pub fn is_valid_literal_subject(subject: &str) -> bool {
    is_valid_subject_tokens(subject) && !subject.split('.').any(|t| t == "*" || t == ">")
}

/// A pattern subject may contain `*` and a trailing `>`.
pub fn is_valid_subject(subject: &str) -> bool {
    is_valid_subject_tokens(subject)
}

fn is_valid_subject_tokens(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        if token.is_empty() {
            return false;
        }
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return false;
        }
        if token == ">" && tokens.peek().is_some() {
            return false;
        }
    }
    true
}

/// Validates a subject pattern intended to be bound to a Stream or used as
/// a Consumer filter, returning a typed error on failure.
pub fn validate_pattern(subject: &str) -> Result<()> {
    if !is_valid_subject(subject) {
        return Err(err!(SubjectInvalid, "invalid subject '{}'", subject));
    }
    Ok(())
}

/// Does `subject` (a literal, published subject) match `pattern` (which
/// may contain `*`/`>`)?
pub fn subject_matches_pattern(subject: &str, pattern: &str) -> bool {
    let sub_tokens: Vec<&str> = subject.split('.').collect();
    let pat_tokens: Vec<&str> = pattern.split('.').collect();

    let mut si = 0;
    let mut pi = 0;
    while pi < pat_tokens.len() {
        match pat_tokens[pi] {
            ">" => return true,
            "*" => {
                if si >= sub_tokens.len() {
                    return false;
                }
                si += 1;
                pi += 1;
            }
            lit => {
                if si >= sub_tokens.len() || sub_tokens[si] != lit {
                    return false;
                }
                si += 1;
                pi += 1;
            }
        }
    }
    si == sub_tokens.len()
}

/// Does `subject` match any of `patterns`?
pub fn matches_any<'a, I: IntoIterator<Item = &'a String>>(subject: &str, patterns: I) -> bool {
    patterns
        .into_iter()
        .any(|p| subject_matches_pattern(subject, p))
}

/// Token-wise overlap check between two subject patterns: true if there
/// exists a literal subject that both patterns would match. Used both for
/// Stream subject-set collision detection and WorkQueue filter
/// disjointness checks.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let at: Vec<&str> = a.split('.').collect();
    let bt: Vec<&str> = b.split('.').collect();

    let mut ai = 0;
    let mut bi = 0;
    loop {
        let a_done = ai >= at.len();
        let b_done = bi >= bt.len();
        if a_done && b_done {
            return true;
        }
        if a_done {
            return bt[bi..].contains(&">") || (b_done);
        }
        if b_done {
            return at[ai..].contains(&">");
        }
        let at_tok = at[ai];
        let bt_tok = bt[bi];
        if at_tok == ">" || bt_tok == ">" {
            return true;
        }
        if at_tok == "*" || bt_tok == "*" || at_tok == bt_tok {
            ai += 1;
            bi += 1;
            continue;
        }
        return false;
    }
}

/// Does the reserved management namespace (`mgmt.>` in this crate's
/// convention) overlap a candidate subject set member?
pub fn overlaps_management_namespace(subject: &str) -> bool {
    patterns_overlap(subject, "mgmt.>")
}
