//! Minimal ISO-BMFF (fMP4/CMAF) parsing for pass-through remuxing.
//!
//! Just enough of the box tree is understood to pull codec and timescale
//! information out of an init segment (`moov`), read fragment timing out of
//! `moof` boxes (`tfdt`/`trun`), and rewrite `tfdt` base decode times in
//! place when the presentation timeline is re-anchored.

use tracing::debug;

/// Substituted when an audio sample entry carries no usable codec config.
pub const DEFAULT_AUDIO_CODEC: &str = "mp4a.40.5";
/// Substituted when a video sample entry carries no `avcC` record.
pub const DEFAULT_VIDEO_CODEC: &str = "avc1.42e01e";

/// Bytes between a visual sample entry's box header and its child boxes
/// (ISO 14496-12 VisualSampleEntry fixed fields).
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Per-track description extracted from an init segment.
#[derive(Debug, Clone)]
pub struct TrackInit {
    pub id: u32,
    pub kind: TrackKind,
    pub timescale: u32,
    pub codec: String,
}

/// The audio/video tracks declared by a `moov` box.
#[derive(Debug, Clone, Default)]
pub struct InitData {
    pub audio: Option<TrackInit>,
    pub video: Option<TrackInit>,
}

impl InitData {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn track_for_id(&self, id: u32) -> Option<&TrackInit> {
        [self.audio.as_ref(), self.video.as_ref()]
            .into_iter()
            .flatten()
            .find(|t| t.id == id)
    }
}

/// Read a box header: `(total_box_size, fourcc, header_size)`.
///
/// Handles 32-bit sizes, 64-bit extended sizes (`size == 1`) and
/// box-extends-to-EOF (`size == 0`).
fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];
    if size == 1 {
        if data.len() < 16 {
            return None;
        }
        let ext = u64::from_be_bytes(data[8..16].try_into().ok()?);
        Some((ext as usize, fourcc, 16))
    } else if size == 0 {
        Some((data.len(), fourcc, 8))
    } else {
        Some((size as usize, fourcc, 8))
    }
}

/// Collect `(absolute_body_offset, body_len)` of every box matching `path`
/// under `data[base..base + len]`.
fn collect_boxes(
    data: &[u8],
    base: usize,
    len: usize,
    path: &[[u8; 4]],
    out: &mut Vec<(usize, usize)>,
) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    let end = (base + len).min(data.len());
    let mut offset = base;
    while offset < end {
        let Some((box_size, fourcc, header_size)) = read_box_header(&data[offset..end]) else {
            break;
        };
        if box_size < header_size || offset + box_size > end {
            break;
        }
        if fourcc == *first {
            let body = offset + header_size;
            let body_len = box_size - header_size;
            if rest.is_empty() {
                out.push((body, body_len));
            } else {
                collect_boxes(data, body, body_len, rest, out);
            }
        }
        offset += box_size;
    }
}

fn find_boxes(data: &[u8], path: &[[u8; 4]]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    collect_boxes(data, 0, data.len(), path, &mut out);
    out
}

/// Find the first direct child box with the given fourcc, returning its body.
fn find_child<'a>(data: &'a [u8], target: &[u8; 4]) -> Option<&'a [u8]> {
    let mut offset = 0;
    while offset < data.len() {
        let (box_size, fourcc, header_size) = read_box_header(&data[offset..])?;
        if box_size < header_size || offset + box_size > data.len() {
            break;
        }
        if fourcc == *target {
            return Some(&data[offset + header_size..offset + box_size]);
        }
        offset += box_size;
    }
    None
}

fn fullbox_version(body: &[u8]) -> Option<u8> {
    body.first().copied()
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_be_bytes(b.try_into().unwrap()))
}

/// Parse a `moov` (or a buffer containing one) into per-track init data.
///
/// The first `vide` and `soun` handler tracks win; further tracks of the
/// same kind are ignored.
pub fn parse_init_segment(data: &[u8]) -> InitData {
    let mut init = InitData::default();
    for (trak_off, trak_len) in find_boxes(data, &[*b"moov", *b"trak"]) {
        let trak = &data[trak_off..trak_off + trak_len];
        let Some(track) = parse_trak(trak) else {
            continue;
        };
        match track.kind {
            TrackKind::Video if init.video.is_none() => init.video = Some(track),
            TrackKind::Audio if init.audio.is_none() => init.audio = Some(track),
            _ => {}
        }
    }
    init
}

fn parse_trak(trak: &[u8]) -> Option<TrackInit> {
    let tkhd = find_child(trak, b"tkhd")?;
    let id = match fullbox_version(tkhd)? {
        0 => read_u32(tkhd, 12)?,
        _ => read_u32(tkhd, 20)?,
    };

    let mdia = find_child(trak, b"mdia")?;
    let mdhd = find_child(mdia, b"mdhd")?;
    let timescale = match fullbox_version(mdhd)? {
        0 => read_u32(mdhd, 12)?,
        _ => read_u32(mdhd, 20)?,
    };
    if timescale == 0 {
        return None;
    }

    let hdlr = find_child(mdia, b"hdlr")?;
    let handler = hdlr.get(8..12)?;
    let kind = match handler {
        b"vide" => TrackKind::Video,
        b"soun" => TrackKind::Audio,
        _ => return None,
    };

    let codec = find_child(mdia, b"minf")
        .and_then(|minf| find_child(minf, b"stbl"))
        .and_then(|stbl| find_child(stbl, b"stsd"))
        .and_then(sample_entry_codec)
        .unwrap_or_else(|| {
            match kind {
                TrackKind::Audio => DEFAULT_AUDIO_CODEC,
                TrackKind::Video => DEFAULT_VIDEO_CODEC,
            }
            .to_string()
        });

    Some(TrackInit {
        id,
        kind,
        timescale,
        codec,
    })
}

/// Derive a codec string from the first `stsd` sample entry.
fn sample_entry_codec(stsd: &[u8]) -> Option<String> {
    // stsd is a FullBox: version/flags then entry_count, then entries.
    let entry_count = read_u32(stsd, 4)? as usize;
    if entry_count == 0 || stsd.len() < 16 {
        return None;
    }
    let entry = &stsd[8..];
    let (entry_size, fourcc, header_size) = read_box_header(entry)?;
    if entry_size < header_size || entry_size > entry.len() {
        return None;
    }
    match &fourcc {
        b"avc1" | b"avc3" => {
            let inner_offset = header_size + VISUAL_SAMPLE_ENTRY_HEADER;
            let codec = entry
                .get(inner_offset..entry_size)
                .and_then(|children| find_child(children, b"avcC"))
                .and_then(|avcc| avcc.get(1..4))
                .map(|plc| format!("avc1.{:02x}{:02x}{:02x}", plc[0], plc[1], plc[2]))
                .unwrap_or_else(|| DEFAULT_VIDEO_CODEC.to_string());
            Some(codec)
        }
        b"hvc1" | b"hev1" => Some(String::from_utf8_lossy(&fourcc).into_owned()),
        b"mp4a" => Some(DEFAULT_AUDIO_CODEC.to_string()),
        b"ac-3" | b"ec-3" => Some(String::from_utf8_lossy(&fourcc).into_owned()),
        other => {
            debug!(
                fourcc = %String::from_utf8_lossy(other),
                "Unrecognised sample entry, using handler default codec"
            );
            None
        }
    }
}

struct TrackFragment {
    track_id: u32,
    tfdt: Option<(usize, u8)>,
    default_duration: Option<u32>,
    traf_off: usize,
    traf_len: usize,
}

fn parse_traf(data: &[u8], traf_off: usize, traf_len: usize) -> Option<TrackFragment> {
    let traf = &data[traf_off..traf_off + traf_len];
    let tfhd = find_child(traf, b"tfhd")?;
    let flags = read_u32(tfhd, 0)? & 0x00ff_ffff;
    let track_id = read_u32(tfhd, 4)?;

    // Optional tfhd fields appear in flag order.
    let mut offset = 8;
    if flags & 0x01 != 0 {
        offset += 8; // base-data-offset
    }
    if flags & 0x02 != 0 {
        offset += 4; // sample-description-index
    }
    let default_duration = if flags & 0x08 != 0 {
        read_u32(tfhd, offset)
    } else {
        None
    };

    // Locate tfdt by absolute offset so it can be patched in place.
    let mut tfdts = Vec::new();
    collect_boxes(data, traf_off, traf_len, &[*b"tfdt"], &mut tfdts);
    let tfdt = tfdts
        .first()
        .and_then(|&(off, _)| data.get(off).copied().map(|version| (off, version)));

    Some(TrackFragment {
        track_id,
        tfdt,
        default_duration,
        traf_off,
        traf_len,
    })
}

fn track_fragments(data: &[u8]) -> Vec<TrackFragment> {
    find_boxes(data, &[*b"moof", *b"traf"])
        .into_iter()
        .filter_map(|(off, len)| parse_traf(data, off, len))
        .collect()
}

fn tfdt_base_time(data: &[u8], tfdt: (usize, u8)) -> Option<u64> {
    let (off, version) = tfdt;
    match version {
        0 => read_u32(data, off + 4).map(u64::from),
        _ => read_u64(data, off + 4),
    }
}

/// Earliest decode time of the fragment in seconds, across all tracks.
pub fn start_dts(init: &InitData, data: &[u8]) -> Option<f64> {
    track_fragments(data)
        .into_iter()
        .filter_map(|tf| {
            let timescale = init.track_for_id(tf.track_id).map(|t| t.timescale)?;
            let base = tfdt_base_time(data, tf.tfdt?)?;
            Some(base as f64 / timescale as f64)
        })
        .min_by(|a, b| a.total_cmp(b))
}

/// Duration of the fragment in seconds: the longest per-track sum of `trun`
/// sample durations (falling back to the `tfhd` default duration).
pub fn segment_duration(init: &InitData, data: &[u8]) -> Option<f64> {
    let mut longest: Option<f64> = None;
    for tf in track_fragments(data) {
        let Some(track) = init.track_for_id(tf.track_id) else {
            continue;
        };
        let traf = &data[tf.traf_off..tf.traf_off + tf.traf_len];
        let mut ticks = 0u64;
        let mut known = false;
        let mut offset = 0;
        while offset < traf.len() {
            let Some((box_size, fourcc, header_size)) = read_box_header(&traf[offset..]) else {
                break;
            };
            if box_size < header_size || offset + box_size > traf.len() {
                break;
            }
            if fourcc == *b"trun" {
                let trun = &traf[offset + header_size..offset + box_size];
                if let Some(d) = trun_duration(trun, tf.default_duration) {
                    ticks += d;
                    known = true;
                }
            }
            offset += box_size;
        }
        if known {
            let secs = ticks as f64 / track.timescale as f64;
            longest = Some(longest.map_or(secs, |l: f64| l.max(secs)));
        }
    }
    longest
}

fn trun_duration(trun: &[u8], default_duration: Option<u32>) -> Option<u64> {
    let flags = read_u32(trun, 0)? & 0x00ff_ffff;
    let sample_count = read_u32(trun, 4)? as u64;

    let duration_present = flags & 0x100 != 0;
    if !duration_present {
        return default_duration.map(|d| d as u64 * sample_count);
    }

    let mut offset = 8;
    if flags & 0x01 != 0 {
        offset += 4; // data-offset
    }
    if flags & 0x04 != 0 {
        offset += 4; // first-sample-flags
    }
    let mut entry = 0;
    if flags & 0x200 != 0 {
        entry += 4; // sample-size
    }
    if flags & 0x400 != 0 {
        entry += 4; // sample-flags
    }
    if flags & 0x800 != 0 {
        entry += 4; // sample-composition-time-offset
    }

    let mut total = 0u64;
    for _ in 0..sample_count {
        total += read_u32(trun, offset)? as u64;
        offset += 4 + entry;
    }
    Some(total)
}

/// Rewrite every `tfdt` base decode time, shifting each track's start by
/// `offset_seconds` in its own timescale. Underflow clamps to zero.
pub fn offset_track_start(init: &InitData, data: &mut [u8], offset_seconds: f64) {
    let fragments = track_fragments(data);
    for tf in fragments {
        let Some(track) = init.track_for_id(tf.track_id) else {
            continue;
        };
        let Some((off, version)) = tf.tfdt else {
            continue;
        };
        let delta = (offset_seconds * track.timescale as f64).round() as i64;
        match version {
            0 => {
                if let Some(base) = read_u32(data, off + 4) {
                    let shifted = (base as i64 - delta).max(0) as u32;
                    data[off + 4..off + 8].copy_from_slice(&shifted.to_be_bytes());
                }
            }
            _ => {
                if let Some(base) = read_u64(data, off + 4) {
                    let shifted = (base as i64 - delta).max(0) as u64;
                    data[off + 4..off + 12].copy_from_slice(&shifted.to_be_bytes());
                }
            }
        }
    }
}
