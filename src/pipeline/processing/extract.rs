//! Recovery of JSON records embedded in free-form log lines.
//!
//! The firmware prints status records with arbitrary prefixes (log timestamps, module tags,
//! highlight markers) and suffixes. Fragments are located with an explicit bracket matcher that
//! understands JSON strings, then parsed strictly. The first fragment that parses wins.

use serde_json::Value;
use tracing::debug;

use crate::metrics::ingest::IngestMetrics;
use crate::types::CandidateRecord;

/// Upper bound on balanced fragments tried per line
const MAX_FRAGMENT_ATTEMPTS: usize = 8;

/// Extract the first well-formed JSON object or array from `text`.
///
/// Returns `None` without parsing anything when the line has no `{` or `[`. A balanced fragment
/// that fails to parse is rejected whole: nothing nested inside it is tried.
pub fn extract(text: &str) -> Option<CandidateRecord> {
    let bytes = text.as_bytes();
    find_opener(bytes)?;

    let mut tried_until = 0;
    let mut attempts = 0;

    for (start, end) in balanced_fragments(bytes) {
        if start < tried_until {
            continue;
        }
        attempts += 1;
        let fragment = &text[start..=end];
        match serde_json::from_str::<Value>(fragment) {
            Ok(Value::Object(map)) => return Some(CandidateRecord::Object(map)),
            Ok(Value::Array(items)) => return Some(CandidateRecord::Array(items)),
            Ok(_) => {}
            Err(e) => {
                IngestMetrics::record_malformed_fragment();
                debug!(fragment = %fragment, error = %e, "Could not decode JSON fragment");
            }
        }
        if attempts >= MAX_FRAGMENT_ATTEMPTS {
            debug!(attempts, "Giving up on line after repeated malformed fragments");
            return None;
        }
        tried_until = end + 1;
    }

    None
}

fn find_opener(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|&b| b == b'{' || b == b'[')
}

/// Every balanced bracket pair in `bytes` as `(open, close)`, ordered by opening position.
///
/// One pass with a stack of open positions. Both bracket kinds nest, brackets inside string
/// literals are ignored, and a mismatched closer discards every pair still open.
fn balanced_fragments(bytes: &[u8]) -> Vec<(usize, usize)> {
    let mut open: Vec<(usize, u8)> = Vec::new();
    let mut pairs = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            // Quotes only matter inside a fragment
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push((i, b'}')),
            b'[' => open.push((i, b']')),
            b'}' | b']' => match open.pop() {
                Some((start, close)) if close == b => pairs.push((start, i)),
                Some(_) => open.clear(),
                None => {}
            },
            _ => {}
        }
    }

    pairs.sort_unstable_by_key(|&(start, _)| start);
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> CandidateRecord {
        match value {
            Value::Object(map) => CandidateRecord::Object(map),
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_line_without_brackets_yields_none() {
        assert_eq!(extract("garbage text no json"), None);
        assert_eq!(extract(""), None);
    }

    #[test]
    fn test_whole_line_object_round_trips_exactly() {
        let line = r#"{"event":"TAMPERING","ultra_meas":"0.54","mag_meas":"N/A","prev_hash":"abc"}"#;
        let expected = object(serde_json::from_str(line).unwrap());
        assert_eq!(extract(line), Some(expected));
    }

    #[test]
    fn test_object_with_prefix_and_suffix_noise() {
        let line = r#"<span style="color:green; font-weight:bold">{"event":"PRESENCE","ultra_meas":"0.31"}</span>"#;
        let record = extract(line).unwrap();
        assert_eq!(
            record,
            object(json!({"event": "PRESENCE", "ultra_meas": "0.31"}))
        );
    }

    #[test]
    fn test_log_timestamp_fragment_is_skipped() {
        let line = r#"[00:00:12.345,678] <inf> event: {"event":"FAIL","user":"bob"}"#;
        assert_eq!(
            extract(line),
            Some(object(json!({"event": "FAIL", "user": "bob"})))
        );
    }

    #[test]
    fn test_array_is_returned_as_array() {
        let line = r#"sensors: [1, 2, {"x": 3}] done"#;
        assert_eq!(
            extract(line),
            Some(CandidateRecord::Array(vec![json!(1), json!(2), json!({"x": 3})]))
        );
    }

    #[test]
    fn test_brackets_inside_strings_do_not_close() {
        let line = r#"{"msg":"a } inside [ text","event":"SUCCESS"}"#;
        assert_eq!(
            extract(line),
            Some(object(json!({"msg": "a } inside [ text", "event": "SUCCESS"})))
        );
    }

    #[test]
    fn test_first_of_two_fragments_wins() {
        let line = r#"["a","b"] {"event":"SUCCESS"}"#;
        assert_eq!(
            extract(line),
            Some(CandidateRecord::Array(vec![json!("a"), json!("b")]))
        );
    }

    #[test]
    fn test_malformed_json_yields_none() {
        assert_eq!(extract(r#"{"event": TAMPERING}"#), None);
        assert_eq!(extract(r#"{"event":"TAMPERING""#), None);
        assert_eq!(extract("{ mismatched ]"), None);
    }

    #[test]
    fn test_nested_object_is_kept_whole() {
        let line = r#"blk {"block":{"prev_hash":"GENESIS","event":"SUCCESS"},"n":[1,[2]]} end"#;
        assert_eq!(
            extract(line),
            Some(object(json!({
                "block": {"prev_hash": "GENESIS", "event": "SUCCESS"},
                "n": [1, [2]]
            })))
        );
    }

    #[test]
    fn test_malformed_record_does_not_yield_nested_object() {
        let line = r#"{"block":{"event":"TAMPERING","ultra_meas":"1.0"}, oops}"#;
        assert_eq!(extract(line), None);
    }

    #[test]
    fn test_record_after_malformed_record_is_found() {
        let line = r#"{"a":[1,2] oops} {"event":"SUCCESS"}"#;
        assert_eq!(extract(line), Some(object(json!({"event": "SUCCESS"}))));
    }

    #[test]
    fn test_unclosed_prefix_bracket_does_not_hide_record() {
        let line = r#"[boot {"event":"SUCCESS"}"#;
        assert_eq!(extract(line), Some(object(json!({"event": "SUCCESS"}))));
    }

    #[test]
    fn test_bracket_floods_are_bounded() {
        let started = std::time::Instant::now();
        assert_eq!(extract(&"[".repeat(16 * 1024)), None);
        assert_eq!(extract(&"{".repeat(16 * 1024)), None);
        let noisy = format!("{}{}", "[x]".repeat(4000), r#"{"event":"SUCCESS"}"#);
        assert_eq!(extract(&noisy), None);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_fragments_are_paired_in_opening_order() {
        assert_eq!(
            balanced_fragments(br#"{"a":[1]} x [2]"#),
            vec![(0, 8), (5, 7), (12, 14)]
        );
        assert_eq!(balanced_fragments(b"{ mismatched ] [ok]"), vec![(15, 18)]);
    }
}
