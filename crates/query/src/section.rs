//! Section directives
//!
//! A script may be preceded by `@<type> <name> key=value …` lines, e.g.
//!
//! ```text
//! @segment high_spenders ttl=1_hours refresh=5_minutes use_cached=true
//! ```
//!
//! Recognized flags: `ttl`, `refresh` (time shorthand or ms),
//! `use_cached`, `on_insert` (bool), `z_index` (int). Anything else
//! lands in the free-form parameter map surfaced to the caller.

use crate::program::Section;
use cohort_core::error::{Error, ErrorCode, Result, SourceLoc};
use cohort_core::time;

/// Split leading `@section` directives off a script. Returns the source
/// with directive lines blanked (line numbers preserved) and the first
/// directive, if any.
pub fn strip_sections(source: &str) -> Result<(String, Option<Section>)> {
    let mut section: Option<Section> = None;
    let mut out_lines: Vec<&str> = Vec::new();

    for line in source.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('@') {
            out_lines.push(line);
            continue;
        }
        out_lines.push("");
        let parsed = parse_directive(trimmed, line)?;
        if section.is_none() {
            section = Some(parsed);
        }
    }
    Ok((out_lines.join("\n"), section))
}

fn parse_directive(trimmed: &str, raw: &str) -> Result<Section> {
    let mut words = trimmed[1..].split_whitespace();
    let kind = words
        .next()
        .ok_or_else(|| bad_directive(raw, "missing section type"))?;
    let name = words
        .next()
        .ok_or_else(|| bad_directive(raw, "missing section name"))?;

    let mut section = Section {
        kind: kind.to_string(),
        name: name.to_string(),
        ..Section::default()
    };

    for pair in words {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| bad_directive(raw, "flags take the form key=value"))?;
        match key {
            "ttl" => section.ttl_ms = Some(parse_duration(value, raw)?),
            "refresh" => section.refresh_ms = Some(parse_duration(value, raw)?),
            "use_cached" => section.use_cached = parse_bool(value, raw)?,
            "on_insert" => section.on_insert = parse_bool(value, raw)?,
            "z_index" => {
                section.z_index = Some(value.parse::<i32>().map_err(|_| {
                    bad_directive(raw, "z_index takes an integer")
                })?);
            }
            other => {
                section.params.insert(other.to_string(), value.to_string());
            }
        }
    }
    Ok(section)
}

fn parse_duration(value: &str, raw: &str) -> Result<i64> {
    if time::is_shorthand(value) {
        return time::expand_shorthand(value);
    }
    value
        .parse::<i64>()
        .map_err(|_| bad_directive(raw, "expected a duration"))
}

fn parse_bool(value: &str, raw: &str) -> Result<bool> {
    match value {
        "true" | "True" | "1" => Ok(true),
        "false" | "False" | "0" => Ok(false),
        _ => Err(bad_directive(raw, "expected true or false")),
    }
}

fn bad_directive(raw: &str, why: &str) -> Error {
    Error::parse(
        ErrorCode::SyntaxError,
        format!("bad section directive: {}", why),
    )
    .with_loc(SourceLoc::new(raw, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_directive() {
        let src = "@segment heavy_buyers ttl=1_hours refresh=5_minutes use_cached=true tag=vip\nx = 1";
        let (rest, section) = strip_sections(src).unwrap();
        let section = section.unwrap();
        assert_eq!(section.kind, "segment");
        assert_eq!(section.name, "heavy_buyers");
        assert_eq!(section.ttl_ms, Some(60 * 60 * 1000));
        assert_eq!(section.refresh_ms, Some(5 * 60 * 1000));
        assert!(section.use_cached);
        assert!(!section.on_insert);
        assert_eq!(section.params.get("tag").map(String::as_str), Some("vip"));
        // line numbering preserved
        assert_eq!(rest.lines().count(), 2);
        assert_eq!(rest.lines().nth(1), Some("x = 1"));
    }

    #[test]
    fn test_no_directive() {
        let (rest, section) = strip_sections("x = 1").unwrap();
        assert!(section.is_none());
        assert_eq!(rest, "x = 1");
    }

    #[test]
    fn test_bad_flag_rejected() {
        assert!(strip_sections("@segment s ttl=soon").is_err());
        assert!(strip_sections("@segment").is_err());
    }
}
