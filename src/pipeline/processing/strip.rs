//! Terminal noise removal.
//!
//! Device output is littered with control sequences of the form `ESC [ params letter`
//! (cursor moves, screen clears, colors). Only the firmware's highlight and reset codes carry
//! meaning for display; they are translated into span markers and every other sequence is
//! deleted.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::{ANSI_HIGHLIGHT, ANSI_RESET, SPAN_END, SPAN_START};
use crate::types::CleanedLine;

static CONTROL_SEQUENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("control sequence pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Start,
    End,
}

/// Strip control sequences from `line` and balance highlight spans.
///
/// Span markers already present in the input are treated the same as translated ones, so
/// cleaning an already-clean line leaves it untouched. An end marker with no open span is
/// dropped and every span still open at the end of the line is closed.
pub fn clean(line: &str) -> CleanedLine {
    let mut translated = String::with_capacity(line.len());
    let mut modified = false;
    let mut last = 0;

    for m in CONTROL_SEQUENCE.find_iter(line) {
        translated.push_str(&line[last..m.start()]);
        match m.as_str() {
            ANSI_HIGHLIGHT => translated.push_str(SPAN_START),
            ANSI_RESET => translated.push_str(SPAN_END),
            _ => {}
        }
        modified = true;
        last = m.end();
    }
    translated.push_str(&line[last..]);

    let (text, dropped, closed_spans) = balance_spans(&translated);

    CleanedLine {
        text,
        modified: modified || dropped > 0 || closed_spans > 0,
        closed_spans,
    }
}

/// Count of span start markers in `text`
pub fn count_span_starts(text: &str) -> usize {
    text.matches(SPAN_START).count()
}

/// Count of span end markers in `text`
pub fn count_span_ends(text: &str) -> usize {
    text.matches(SPAN_END).count()
}

fn balance_spans(text: &str) -> (String, usize, usize) {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut dropped = 0usize;
    let mut rest = text;

    while let Some((idx, token)) = next_marker(rest) {
        out.push_str(&rest[..idx]);
        match token {
            Token::Start => {
                depth += 1;
                out.push_str(SPAN_START);
                rest = &rest[idx + SPAN_START.len()..];
            }
            Token::End => {
                if depth > 0 {
                    depth -= 1;
                    out.push_str(SPAN_END);
                } else {
                    dropped += 1;
                }
                rest = &rest[idx + SPAN_END.len()..];
            }
        }
    }
    out.push_str(rest);

    for _ in 0..depth {
        out.push_str(SPAN_END);
    }

    (out, dropped, depth)
}

fn next_marker(text: &str) -> Option<(usize, Token)> {
    let start = text.find(SPAN_START).map(|i| (i, Token::Start));
    let end = text.find(SPAN_END).map(|i| (i, Token::End));
    match (start, end) {
        (Some(s), Some(e)) => Some(if s.0 < e.0 { s } else { e }),
        (s, e) => s.or(e),
    }
}
