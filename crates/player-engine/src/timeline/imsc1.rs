//! Minimal IMSC1 (TTML text profile) cue extraction.
//!
//! Full TTML layout and styling are out of scope; this reads `<p>` elements
//! with `begin`/`end` (or `dur`) attributes, which is what segmented IMSC1
//! subtitle payloads carry in practice.

use crate::error::EngineError;
use crate::events::Cue;

/// Codec string assigned to a subtitle track once IMSC1 payloads are
/// detected.
pub const IMSC1_CODEC: &str = "stpp.ttml.im1t";

const TTML_NS: &str = "http://www.w3.org/ns/ttml";

/// Cheap detection: an XML document with a `tt` root in the TTML namespace.
pub fn looks_like_ttml(payload: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else {
        return false;
    };
    let Some(root) = text.find("<tt") else {
        return false;
    };
    text[root..].contains(TTML_NS)
}

/// Parse an IMSC1 payload into cues.
pub fn parse_imsc1(payload: &[u8]) -> Result<Vec<Cue>, EngineError> {
    let text = std::str::from_utf8(payload).map_err(|e| EngineError::SubtitleParse {
        reason: format!("payload is not UTF-8: {e}"),
    })?;
    if !looks_like_ttml(payload) {
        return Err(EngineError::SubtitleParse {
            reason: "not a TTML document".to_string(),
        });
    }

    let tick_rate = root_attribute(text, "ttp:tickRate")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(10_000_000.0);

    let mut cues = Vec::new();
    let mut search = 0;
    while let Some(rel) = text[search..].find("<p") {
        let open_start = search + rel;
        let after = &text[open_start + 2..];
        // Require a real <p> element, not <profile> etc.
        if !after.starts_with(|c: char| c.is_whitespace() || c == '>' || c == '/') {
            search = open_start + 2;
            continue;
        }
        let Some(open_end_rel) = after.find('>') else {
            break;
        };
        let open_tag = &after[..open_end_rel];
        let body_start = open_start + 2 + open_end_rel + 1;

        if open_tag.ends_with('/') {
            search = body_start;
            continue;
        }
        let Some(close_rel) = text[body_start..].find("</p>") else {
            break;
        };
        let body = &text[body_start..body_start + close_rel];
        search = body_start + close_rel + 4;

        let Some(begin) = attribute(open_tag, "begin").and_then(|v| parse_ttml_time(v, tick_rate))
        else {
            continue;
        };
        let end = attribute(open_tag, "end")
            .and_then(|v| parse_ttml_time(v, tick_rate))
            .or_else(|| {
                attribute(open_tag, "dur")
                    .and_then(|v| parse_ttml_time(v, tick_rate))
                    .map(|d| begin + d)
            });
        let Some(end) = end else {
            continue;
        };
        if end < begin {
            continue;
        }

        cues.push(Cue {
            id: attribute(open_tag, "xml:id").map(str::to_string),
            start: begin,
            end,
            text: flatten_text(body),
        });
    }
    Ok(cues)
}

fn root_attribute<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let root = text.find("<tt")?;
    let tag_end = text[root..].find('>')?;
    attribute(&text[root..root + tag_end], name)
}

/// Pull a quoted attribute value out of a tag body.
fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let mut search = 0;
    loop {
        let idx = tag[search..].find(name)? + search;
        let after = &tag[idx + name.len()..];
        let after = after.trim_start();
        if let Some(rest) = after.strip_prefix('=') {
            let rest = rest.trim_start();
            let quote = rest.chars().next()?;
            if quote == '"' || quote == '\'' {
                let value = &rest[1..];
                let end = value.find(quote)?;
                return Some(&value[..end]);
            }
        }
        search = idx + name.len();
    }
}

/// Strip markup from a `<p>` body, keeping `<br/>` as newlines.
fn flatten_text(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(idx) = rest.find('<') {
        out.push_str(&rest[..idx]);
        let tag_rest = &rest[idx..];
        let Some(end) = tag_rest.find('>') else {
            break;
        };
        if tag_rest[..end].trim_start_matches('<').starts_with("br") {
            out.push('\n');
        }
        rest = &tag_rest[end + 1..];
    }
    out.push_str(rest);
    decode_entities(out.trim())
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

/// TTML time expressions: clock times `hh:mm:ss(.fff)` and offset times
/// with `h`, `m`, `s`, `ms` or `t` metrics.
fn parse_ttml_time(s: &str, tick_rate: f64) -> Option<f64> {
    let s = s.trim();
    if s.contains(':') {
        return crate::timeline::webvtt::parse_timestamp(s);
    }
    for (suffix, scale) in [
        ("ms", 0.001),
        ("h", 3600.0),
        ("m", 60.0),
        ("s", 1.0),
    ] {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.trim().parse::<f64>().ok().map(|v| v * scale);
        }
    }
    if let Some(num) = s.strip_suffix('t') {
        return num
            .trim()
            .parse::<f64>()
            .ok()
            .map(|ticks| ticks / tick_rate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tt xmlns="http://www.w3.org/ns/ttml" xmlns:ttp="http://www.w3.org/ns/ttml#parameter" ttp:tickRate="90000">
  <body><div>
    <p xml:id="c1" begin="00:00:01.000" end="00:00:02.000">Hello &amp; welcome</p>
    <p begin="2.5s" dur="1.5s">Two<br/>lines</p>
    <p begin="360000t" end="450000t">Ticks</p>
  </div></body>
</tt>"#;

    #[test]
    fn detects_ttml_documents() {
        assert!(looks_like_ttml(TTML.as_bytes()));
        assert!(!looks_like_ttml(b"WEBVTT\n\n"));
        assert!(!looks_like_ttml(b"<html><tt>nope</tt></html>"));
    }

    #[test]
    fn parses_clock_offset_and_tick_times() {
        let cues = parse_imsc1(TTML.as_bytes()).unwrap();
        assert_eq!(cues.len(), 3);

        assert_eq!(cues[0].id.as_deref(), Some("c1"));
        assert_eq!(cues[0].start, 1.0);
        assert_eq!(cues[0].end, 2.0);
        assert_eq!(cues[0].text, "Hello & welcome");

        assert_eq!(cues[1].start, 2.5);
        assert_eq!(cues[1].end, 4.0);
        assert_eq!(cues[1].text, "Two\nlines");

        assert_eq!(cues[2].start, 4.0);
        assert_eq!(cues[2].end, 5.0);
    }

    #[test]
    fn non_ttml_payload_is_an_error() {
        assert!(parse_imsc1(b"WEBVTT\n\n00:00.000 --> 00:01.000\nhi").is_err());
    }

    #[test]
    fn paragraphs_without_timing_are_skipped() {
        let doc = r#"<tt xmlns="http://www.w3.org/ns/ttml"><body>
<p>untimed</p>
<p begin="1s" end="2s">timed</p>
</body></tt>"#;
        let cues = parse_imsc1(doc.as_bytes()).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "timed");
    }

    #[test]
    fn time_metrics_parse() {
        assert_eq!(parse_ttml_time("1500ms", 1.0), Some(1.5));
        assert_eq!(parse_ttml_time("2m", 1.0), Some(120.0));
        assert_eq!(parse_ttml_time("1h", 1.0), Some(3600.0));
        assert_eq!(parse_ttml_time("90000t", 90000.0), Some(1.0));
        assert_eq!(parse_ttml_time("bogus", 1.0), None);
    }
}
