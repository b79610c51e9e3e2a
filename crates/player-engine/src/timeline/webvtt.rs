//! WebVTT parsing: header validation, `X-TIMESTAMP-MAP` extraction and cue
//! blocks. Cue timestamps are left file-local; the timeline controller maps
//! them onto the presentation timeline using the timestamp map, the initial
//! PTS and the discontinuity chain.

use crate::error::EngineError;
use crate::events::Cue;
use tracing::trace;

/// `X-TIMESTAMP-MAP=MPEGTS:<ticks>,LOCAL:<timestamp>` header values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VttTimestampMap {
    /// 90 kHz ticks on the media timeline.
    pub mpegts: i64,
    /// The local cue time those ticks correspond to, in seconds.
    pub local: f64,
}

#[derive(Debug, Clone, Default)]
pub struct VttFile {
    pub timestamp_map: Option<VttTimestampMap>,
    pub cues: Vec<Cue>,
}

/// Parse a WebVTT payload into file-local cues.
pub fn parse_webvtt(payload: &[u8]) -> Result<VttFile, EngineError> {
    let text = std::str::from_utf8(payload).map_err(|e| EngineError::SubtitleParse {
        reason: format!("payload is not UTF-8: {e}"),
    })?;
    let text = text.trim_start_matches('\u{feff}');

    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    if !header.starts_with("WEBVTT") {
        return Err(EngineError::SubtitleParse {
            reason: "missing WEBVTT header".to_string(),
        });
    }

    let mut file = VttFile::default();

    // Remaining header lines until the first blank line.
    for line in lines.by_ref() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix("X-TIMESTAMP-MAP=") {
            file.timestamp_map = parse_timestamp_map(rest);
        }
    }

    let mut block: Vec<&str> = Vec::new();
    for line in lines.chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if !block.is_empty() {
                if let Some(cue) = parse_cue_block(&block) {
                    file.cues.push(cue);
                }
                block.clear();
            }
        } else {
            block.push(line);
        }
    }

    trace!(cues = file.cues.len(), "parsed WebVTT payload");
    Ok(file)
}

fn parse_timestamp_map(rest: &str) -> Option<VttTimestampMap> {
    let mut mpegts: Option<i64> = None;
    let mut local: Option<f64> = None;
    for part in rest.split(',') {
        let (key, val) = part.split_once(':')?;
        match key.trim() {
            "MPEGTS" => mpegts = val.trim().parse().ok(),
            "LOCAL" => local = parse_timestamp(val.trim()),
            _ => {}
        }
    }
    Some(VttTimestampMap {
        mpegts: mpegts?,
        local: local?,
    })
}

fn parse_cue_block(block: &[&str]) -> Option<Cue> {
    let first = block.first()?;
    if first.starts_with("NOTE") || first.starts_with("STYLE") || first.starts_with("REGION") {
        return None;
    }

    let (id, timing_idx) = if first.contains("-->") {
        (None, 0)
    } else if block.len() > 1 && block[1].contains("-->") {
        (Some(first.trim().to_string()), 1)
    } else {
        return None;
    };

    let timing = block[timing_idx];
    let (start_str, rest) = timing.split_once("-->")?;
    // Cue settings after the end timestamp are ignored.
    let end_str = rest.trim().split_whitespace().next()?;
    let start = parse_timestamp(start_str.trim())?;
    let end = parse_timestamp(end_str)?;
    if end < start {
        return None;
    }

    let text = block[timing_idx + 1..].join("\n");
    Some(Cue {
        id,
        start,
        end,
        text,
    })
}

/// Parse `[hh:]mm:ss.mmm` into seconds.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, *s),
        [m, s] => (0, m.parse::<u64>().ok()?, *s),
        _ => return None,
    };
    let seconds = sec.parse::<f64>().ok()?;
    if seconds < 0.0 || seconds >= 60.0 {
        return None;
    }
    Some(h as f64 * 3600.0 + m as f64 * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_payload_without_header() {
        assert!(parse_webvtt(b"1\n00:00.000 --> 00:01.000\nhi\n").is_err());
    }

    #[test]
    fn parses_cues_with_and_without_ids() {
        let vtt = b"WEBVTT\n\n\
first\n00:00:01.000 --> 00:00:02.500\nHello\n\n\
00:03.000 --> 00:04.000 align:middle\nWorld\nline two\n";
        let file = parse_webvtt(vtt).unwrap();
        assert_eq!(file.cues.len(), 2);

        assert_eq!(file.cues[0].id.as_deref(), Some("first"));
        assert_eq!(file.cues[0].start, 1.0);
        assert_eq!(file.cues[0].end, 2.5);
        assert_eq!(file.cues[0].text, "Hello");

        assert_eq!(file.cues[1].id, None);
        assert_eq!(file.cues[1].start, 3.0);
        assert_eq!(file.cues[1].text, "World\nline two");
    }

    #[test]
    fn parses_timestamp_map() {
        let vtt = b"WEBVTT\nX-TIMESTAMP-MAP=MPEGTS:900000,LOCAL:00:00:00.000\n\n\
00:00.000 --> 00:01.000\nhi\n";
        let file = parse_webvtt(vtt).unwrap();
        assert_eq!(
            file.timestamp_map,
            Some(VttTimestampMap {
                mpegts: 900_000,
                local: 0.0
            })
        );
    }

    #[test]
    fn timestamp_map_accepts_either_order() {
        let vtt = b"WEBVTT\nX-TIMESTAMP-MAP=LOCAL:00:00:02.000,MPEGTS:180000\n\n\
00:00.000 --> 00:01.000\nhi\n";
        let file = parse_webvtt(vtt).unwrap();
        let map = file.timestamp_map.unwrap();
        assert_eq!(map.mpegts, 180_000);
        assert_eq!(map.local, 2.0);
    }

    #[test]
    fn note_blocks_are_skipped() {
        let vtt = b"WEBVTT\n\nNOTE this is a comment\nacross lines\n\n\
00:00.000 --> 00:01.000\nhi\n";
        let file = parse_webvtt(vtt).unwrap();
        assert_eq!(file.cues.len(), 1);
    }

    #[test]
    fn malformed_timing_lines_are_dropped() {
        let vtt = b"WEBVTT\n\n00:00.000 -> 00:01.000\nbad arrow\n\n\
00:02.000 --> 00:01.000\nbackwards\n\n00:05.000 --> 00:06.000\ngood\n";
        let file = parse_webvtt(vtt).unwrap();
        assert_eq!(file.cues.len(), 1);
        assert_eq!(file.cues[0].text, "good");
    }

    #[test]
    fn timestamps_require_sane_seconds() {
        assert_eq!(parse_timestamp("00:00:61.000"), None);
        assert_eq!(parse_timestamp("01:02:03.500"), Some(3723.5));
        assert_eq!(parse_timestamp("02:03.500"), Some(123.5));
        assert_eq!(parse_timestamp("garbage"), None);
    }

    #[test]
    fn bom_is_tolerated() {
        let vtt = "\u{feff}WEBVTT\n\n00:00.000 --> 00:01.000\nhi\n";
        assert!(parse_webvtt(vtt.as_bytes()).is_ok());
    }
}
