//! Prometheus text exposition parser with instance-identity enforcement
//!
//! Decodes a pushed exposition stream into a [`FamilyMap`], enforcing that
//! every sample is attributable to the target instance, deriving the `buid`
//! label for player samples, and deduplicating samples inside each family
//! with a last-write-wins policy.

use std::collections::HashMap;
use std::io::BufRead;

use crate::error::IngestError;
use crate::types::{
    FamilyMap, MetricFamily, MetricKind, Sample, INSTANCE_ID_LABEL, PLAYER_LOADED_FAMILY,
};

mod buid;

pub use buid::battleye_derive;

/// Parse an exposition stream, validate instance identity, and deduplicate.
///
/// Every sample leaves this function with a non-empty `instance_id` label
/// equal to `target` and with its labels sorted by name. When `overwrite`
/// is false, a conflicting `instance_id` in the stream fails the whole
/// commit; no partial state is returned.
pub fn parse_and_validate<R: BufRead>(
    mut input: R,
    target: &str,
    overwrite: bool,
) -> Result<FamilyMap, IngestError> {
    let mut families: FamilyMap = HashMap::new();
    let mut line = String::new();

    loop {
        line.clear();
        let n = input.read_line(&mut line)?;
        if n == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(comment) = trimmed.strip_prefix('#') {
            apply_comment_line(&mut families, comment.trim_start());
            continue;
        }

        let (name, mut sample) = parse_sample_line(trimmed)?;

        if name == PLAYER_LOADED_FAMILY {
            enrich_player_sample(&mut sample);
        }
        enforce_instance_id(&name, &mut sample, target, overwrite)?;
        sample.sort_labels();

        families
            .entry(name.clone())
            .or_insert_with(|| MetricFamily::new(name, "", MetricKind::Untyped))
            .push(sample);
    }

    for family in families.values_mut() {
        dedupe_last_write_wins(family);
    }

    Ok(families)
}

/// Translate a `format=json` body (JSON array of strings) into exposition
/// text, one line per element with a newline appended.
pub fn json_array_to_text(body: &[u8]) -> Result<Vec<u8>, IngestError> {
    let lines: Vec<String> = serde_json::from_slice(body)
        .map_err(|e| IngestError::Parse(format!("json stream error: {e}")))?;

    let mut out = Vec::with_capacity(body.len());
    for l in &lines {
        out.extend_from_slice(l.as_bytes());
        out.push(b'\n');
    }

    Ok(out)
}

/// Handle a `HELP`/`TYPE` comment. A declaration for a family that already
/// holds samples starts a fresh family: the later declaration wins.
fn apply_comment_line(families: &mut FamilyMap, comment: &str) {
    let mut parts = comment.splitn(3, char::is_whitespace);
    let keyword = parts.next().unwrap_or("");
    let name = match parts.next() {
        Some(n) if !n.is_empty() => n,
        _ => return,
    };
    let rest = parts.next().unwrap_or("").trim();

    match keyword {
        "HELP" => {
            let help = unescape_help(rest);
            redeclare(families, name).help = help;
        }
        "TYPE" => {
            let kind = MetricKind::from_type_token(rest);
            redeclare(families, name).kind = kind;
        }
        // Any other comment is ignored
        _ => {}
    }
}

/// Fetch the family being declared, resetting it if it already has samples.
fn redeclare<'a>(families: &'a mut FamilyMap, name: &str) -> &'a mut MetricFamily {
    let entry = families
        .entry(name.to_string())
        .or_insert_with(|| MetricFamily::new(name, "", MetricKind::Untyped));
    if !entry.samples.is_empty() {
        *entry = MetricFamily::new(name, "", MetricKind::Untyped);
    }
    entry
}

/// Append a derived `buid` label when the sample has a numeric `steam_id`
/// but no `buid` yet. Invalid steam ids are skipped without error.
fn enrich_player_sample(sample: &mut Sample) {
    if sample.label("buid").is_some() {
        return;
    }
    let steam_id = match sample.label("steam_id") {
        Some(s) => s,
        None => return,
    };
    if let Ok(sid) = steam_id.parse::<i64>() {
        let derived = battleye_derive(sid);
        sample.labels.push(("buid".to_string(), derived));
    }
}

fn enforce_instance_id(
    family: &str,
    sample: &mut Sample,
    target: &str,
    overwrite: bool,
) -> Result<(), IngestError> {
    for (name, value) in sample.labels.iter_mut() {
        if name.as_str() == INSTANCE_ID_LABEL {
            if value.as_str() == target {
                return Ok(());
            }
            if overwrite {
                *value = target.to_string();
                return Ok(());
            }
            return Err(IngestError::IdentityMismatch {
                family: family.to_string(),
                expected: target.to_string(),
                got: value.clone(),
            });
        }
    }

    sample
        .labels
        .push((INSTANCE_ID_LABEL.to_string(), target.to_string()));

    Ok(())
}

/// Collapse samples sharing a sorted-label fingerprint, keeping the last.
fn dedupe_last_write_wins(family: &mut MetricFamily) {
    let mut unique: HashMap<u64, Sample> = HashMap::with_capacity(family.samples.len());
    for sample in family.samples.drain(..) {
        unique.insert(sample.fingerprint(), sample);
    }
    family.samples = unique.into_values().collect();
}

fn is_name_char(c: char, first: bool) -> bool {
    if first {
        c.is_ascii_alphabetic() || c == '_' || c == ':'
    } else {
        c.is_ascii_alphanumeric() || c == '_' || c == ':'
    }
}

/// Parse one sample line: `name[{labels}] value [timestamp]`.
fn parse_sample_line(line: &str) -> Result<(String, Sample), IngestError> {
    let mut name_end = 0;
    let mut first = true;

    for (i, c) in line.char_indices() {
        if is_name_char(c, first) {
            name_end = i + c.len_utf8();
            first = false;
        } else {
            break;
        }
    }

    if name_end == 0 {
        return Err(IngestError::Parse(format!("invalid metric line: {line:?}")));
    }

    let name = &line[..name_end];
    let mut rest = line[name_end..].trim_start();

    let labels = if let Some(stripped) = rest.strip_prefix('{') {
        let (labels, after) = parse_label_block(stripped)
            .map_err(|e| IngestError::Parse(format!("metric '{name}': {e}")))?;
        rest = after.trim_start();
        labels
    } else {
        Vec::new()
    };

    let mut tokens = rest.split_whitespace();
    let value_token = tokens
        .next()
        .ok_or_else(|| IngestError::Parse(format!("metric '{name}': missing value")))?;
    let value: f64 = value_token
        .parse()
        .map_err(|_| IngestError::Parse(format!("metric '{name}': invalid value {value_token:?}")))?;

    if let Some(ts) = tokens.next() {
        // Timestamps are accepted on the wire but not stored
        ts.parse::<i64>()
            .map_err(|_| IngestError::Parse(format!("metric '{name}': invalid timestamp {ts:?}")))?;
    }
    if tokens.next().is_some() {
        return Err(IngestError::Parse(format!(
            "metric '{name}': trailing garbage"
        )));
    }

    Ok((name.to_string(), Sample { labels, value }))
}

/// Parse the inside of a `{...}` label block. Returns the pairs and the
/// remainder of the line after the closing brace.
fn parse_label_block(s: &str) -> Result<(Vec<(String, String)>, &str), String> {
    let mut labels = Vec::new();
    let mut rest = s;

    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('}') {
            return Ok((labels, after));
        }
        if rest.is_empty() {
            return Err("unterminated label block".to_string());
        }

        let eq = rest
            .find('=')
            .ok_or_else(|| "label without '='".to_string())?;
        let label_name = rest[..eq].trim();
        if label_name.is_empty() {
            return Err("empty label name".to_string());
        }

        rest = rest[eq + 1..].trim_start();
        rest = rest
            .strip_prefix('"')
            .ok_or_else(|| format!("label '{label_name}': value must be quoted"))?;

        let (value, after) = take_quoted(rest)
            .ok_or_else(|| format!("label '{label_name}': unterminated value"))?;
        labels.push((label_name.to_string(), value));

        rest = after.trim_start();
        if let Some(after_comma) = rest.strip_prefix(',') {
            rest = after_comma;
        }
    }
}

/// Consume an already-opened quoted string, handling `\"`, `\\` and `\n`.
/// Returns the unescaped value and the remainder after the closing quote.
fn take_quoted(s: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut chars = s.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((value, &s[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return None,
            },
            _ => value.push(c),
        }
    }

    None
}

fn unescape_help(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;

    fn parse(text: &str, target: &str, overwrite: bool) -> Result<FamilyMap, IngestError> {
        parse_and_validate(text.as_bytes(), target, overwrite)
    }

    #[test]
    fn test_instance_id_injection() {
        let families = parse("foo{} 1\n", "srv-a", false).unwrap();
        let foo = &families["foo"];
        assert_eq!(foo.samples.len(), 1);
        assert_eq!(
            foo.samples[0].labels,
            vec![("instance_id".to_string(), "srv-a".to_string())]
        );
        assert_eq!(foo.samples[0].value, 1.0);
    }

    #[test]
    fn test_instance_id_mismatch_fails_commit() {
        let err = parse("foo{instance_id=\"srv-b\"} 1\n", "srv-a", false).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("foo"));
        assert!(msg.contains("srv-a"));
        assert!(msg.contains("srv-b"));
    }

    #[test]
    fn test_instance_id_overwrite() {
        let families = parse("foo{instance_id=\"srv-b\"} 1\n", "srv-a", true).unwrap();
        assert_eq!(families["foo"].samples[0].label("instance_id"), Some("srv-a"));
    }

    #[test]
    fn test_dedup_last_write_wins() {
        let text = "foo{a=\"1\",b=\"2\"} 1\nfoo{b=\"2\",a=\"1\"} 2\n";
        let families = parse(text, "srv-a", false).unwrap();
        let foo = &families["foo"];
        assert_eq!(foo.samples.len(), 1);
        assert_eq!(foo.samples[0].value, 2.0);
    }

    #[test]
    fn test_no_duplicate_fingerprints_emitted() {
        let text = "foo{x=\"1\"} 1\nfoo{x=\"1\"} 2\nfoo{x=\"2\"} 3\n";
        let families = parse(text, "srv-a", false).unwrap();
        let foo = &families["foo"];
        let mut prints: Vec<u64> = foo.samples.iter().map(|s| s.fingerprint()).collect();
        prints.sort_unstable();
        prints.dedup();
        assert_eq!(prints.len(), foo.samples.len());
        assert_eq!(foo.samples.len(), 2);
    }

    #[test]
    fn test_help_and_type_lines() {
        let text = "# HELP foo Players online.\n# TYPE foo gauge\nfoo 3\n";
        let families = parse(text, "srv-a", false).unwrap();
        let foo = &families["foo"];
        assert_eq!(foo.kind, MetricKind::Gauge);
        assert_eq!(foo.help, "Players online.");
        assert_eq!(foo.samples.len(), 1);
    }

    #[test]
    fn test_repeated_declaration_replaces_family() {
        let text = "# TYPE foo gauge\nfoo 1\n# TYPE foo counter\nfoo 2\n";
        let families = parse(text, "srv-a", false).unwrap();
        let foo = &families["foo"];
        assert_eq!(foo.kind, MetricKind::Counter);
        assert_eq!(foo.samples.len(), 1);
        assert_eq!(foo.samples[0].value, 2.0);
    }

    #[test]
    fn test_buid_enrichment_for_player_loaded() {
        let text = "dayz_metricz_player_loaded{steam_id=\"76561198000000000\"} 1\n";
        let families = parse(text, "srv-a", false).unwrap();
        let sample = &families["dayz_metricz_player_loaded"].samples[0];
        let buid = sample.label("buid").expect("buid label derived");
        assert_eq!(buid, &battleye_derive(76561198000000000));
    }

    #[test]
    fn test_buid_skipped_on_invalid_steam_id() {
        let text = "dayz_metricz_player_loaded{steam_id=\"not-a-number\"} 1\n";
        let families = parse(text, "srv-a", false).unwrap();
        let sample = &families["dayz_metricz_player_loaded"].samples[0];
        assert!(sample.label("buid").is_none());
    }

    #[test]
    fn test_buid_not_overwritten() {
        let text =
            "dayz_metricz_player_loaded{steam_id=\"76561198000000000\",buid=\"keepme\"} 1\n";
        let families = parse(text, "srv-a", false).unwrap();
        let sample = &families["dayz_metricz_player_loaded"].samples[0];
        assert_eq!(sample.label("buid"), Some("keepme"));
    }

    #[test]
    fn test_buid_untouched_outside_player_family() {
        let text = "foo{steam_id=\"76561198000000000\"} 1\n";
        let families = parse(text, "srv-a", false).unwrap();
        assert!(families["foo"].samples[0].label("buid").is_none());
    }

    #[test]
    fn test_labels_are_sorted() {
        let text = "foo{zz=\"1\",aa=\"2\"} 1\n";
        let families = parse(text, "srv-a", false).unwrap();
        let labels = &families["foo"].samples[0].labels;
        let names: Vec<&str> = labels.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["aa", "instance_id", "zz"]);
    }

    #[test]
    fn test_escaped_label_values() {
        let text = "foo{name=\"a \\\"b\\\" \\\\ c\\nd\"} 1\n";
        let families = parse(text, "srv-a", false).unwrap();
        let sample = &families["foo"].samples[0];
        assert_eq!(sample.label("name"), Some("a \"b\" \\ c\nd"));
    }

    #[test]
    fn test_special_values_and_timestamps() {
        let text = "foo 1.5 1700000000\nbar +Inf\nbaz NaN\n";
        let families = parse(text, "srv-a", false).unwrap();
        assert_eq!(families["foo"].samples[0].value, 1.5);
        assert!(families["bar"].samples[0].value.is_infinite());
        assert!(families["baz"].samples[0].value.is_nan());
    }

    #[test]
    fn test_malformed_lines_fail() {
        assert!(parse("foo\n", "srv-a", false).is_err());
        assert!(parse("foo{a=\"1\"\n", "srv-a", false).is_err());
        assert!(parse("foo{a=1} 1\n", "srv-a", false).is_err());
        assert!(parse("foo one\n", "srv-a", false).is_err());
        assert!(parse("{} 1\n", "srv-a", false).is_err());
    }

    #[test]
    fn test_failed_parse_returns_no_partial_state() {
        let text = "ok 1\nbroken{ 2\n";
        assert!(parse(text, "srv-a", false).is_err());
    }

    #[test]
    fn test_json_array_translation() {
        let body = br#"["foo 1", "bar 2"]"#;
        let text = json_array_to_text(body).unwrap();
        assert_eq!(text, b"foo 1\nbar 2\n");

        let families =
            parse_and_validate(text.as_slice(), "srv-a", false).unwrap();
        assert_eq!(families.len(), 2);
    }

    #[test]
    fn test_json_translation_rejects_bad_shapes() {
        assert!(json_array_to_text(br#"{"not": "array"}"#).is_err());
        assert!(json_array_to_text(br#"["ok", 42]"#).is_err());
        assert!(json_array_to_text(b"not json").is_err());
    }
}
