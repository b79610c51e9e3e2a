use crate::fragment::{Fragment, FragmentKind};
use crate::llhls::PushInfo;
use m3u8_rs::MediaPlaylist;

/// Floor for the live reload timer so a zero target duration can never spin
/// the reload loop.
pub const MIN_RELOAD_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Vod,
    Event,
}

/// `EXT-X-SERVER-CONTROL` attributes relevant to blocking reloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerControl {
    pub can_block_reload: bool,
    /// Skip boundary in seconds; `> 0` enables `_HLS_skip=YES` delta requests.
    pub can_skip_until: f64,
    pub hold_back: f64,
    pub part_hold_back: f64,
}

/// Parsed state of one media playlist for a rendition.
///
/// Replaced wholesale on every successful reload; never mutated in place
/// apart from `updated`, which the reload logic stamps by comparison with
/// the prior details.
#[derive(Debug, Clone)]
pub struct LevelDetails {
    pub live: bool,
    pub start_sn: u64,
    pub end_sn: u64,
    pub start_cc: u64,
    pub end_cc: u64,
    /// Latest partial-segment index, −1 when the playlist carries no parts.
    pub end_part: i64,
    pub target_duration: f64,
    pub total_duration: f64,
    pub fragments: Vec<Fragment>,
    /// `EXT-X-MAP` init segment, when the playlist declares one.
    pub init_segment: Option<Fragment>,
    pub playlist_type: Option<PlaylistType>,
    pub server_control: Option<ServerControl>,
    /// `EXT-X-PART-INF:PART-TARGET` in seconds.
    pub part_target: Option<f64>,
    /// True iff `end_sn` or the URL changed versus the prior details.
    pub updated: bool,
    /// Seconds a client should assume the playlist lags the live edge.
    pub availability_delay: f64,
    /// Blocking-reload hints embedded in the playlist's own URL.
    pub push: Option<PushInfo>,
    pub url: String,
}

impl LevelDetails {
    /// Build details from an externally parsed media playlist.
    ///
    /// Server-control and part-inf tags are not modelled by `m3u8_rs` and
    /// are read out of `unknown_tags`, the same way segment-level maps that
    /// land at playlist scope are.
    pub fn from_media_playlist(pl: &MediaPlaylist, level: usize, url: &str) -> Self {
        let start_sn = pl.media_sequence;
        let start_cc = pl.discontinuity_sequence;

        let mut fragments = Vec::with_capacity(pl.segments.len());
        let mut start = 0.0f64;
        let mut cc = start_cc;
        for (idx, seg) in pl.segments.iter().enumerate() {
            if seg.discontinuity {
                cc += 1;
            }
            let duration = seg.duration as f64;
            fragments.push(Fragment {
                sn: start_sn + idx as u64,
                cc,
                level,
                kind: FragmentKind::Main,
                start,
                duration,
                url: seg.uri.clone(),
                decryptdata: seg.key.clone(),
                program_date_time: seg
                    .program_date_time
                    .map(|dt| dt.timestamp_millis() as f64 / 1000.0),
            });
            start += duration;
        }

        let init_segment = pl
            .segments
            .iter()
            .find_map(|seg| seg.map.as_ref())
            .map(|map| Fragment {
                sn: start_sn,
                cc: start_cc,
                level,
                kind: FragmentKind::Main,
                start: 0.0,
                duration: 0.0,
                url: map.uri.clone(),
                decryptdata: None,
                program_date_time: None,
            });

        let end_sn = if pl.segments.is_empty() {
            start_sn
        } else {
            start_sn + pl.segments.len() as u64 - 1
        };

        let server_control = find_tag(pl, "X-SERVER-CONTROL").map(|rest| {
            let mut sc = ServerControl::default();
            for (key, val) in split_attributes(rest) {
                match key {
                    "CAN-BLOCK-RELOAD" => sc.can_block_reload = val == "YES",
                    "CAN-SKIP-UNTIL" => sc.can_skip_until = val.parse().unwrap_or(0.0),
                    "HOLD-BACK" => sc.hold_back = val.parse().unwrap_or(0.0),
                    "PART-HOLD-BACK" => sc.part_hold_back = val.parse().unwrap_or(0.0),
                    _ => {}
                }
            }
            sc
        });

        let part_target = find_tag(pl, "X-PART-INF").and_then(|rest| {
            split_attributes(rest)
                .into_iter()
                .find(|(k, _)| *k == "PART-TARGET")
                .and_then(|(_, v)| v.parse::<f64>().ok())
        });

        let part_count = pl
            .unknown_tags
            .iter()
            .filter(|tag| tag.tag == "X-PART")
            .count() as i64;

        let playlist_type = match pl.playlist_type {
            Some(m3u8_rs::MediaPlaylistType::Vod) => Some(PlaylistType::Vod),
            Some(m3u8_rs::MediaPlaylistType::Event) => Some(PlaylistType::Event),
            _ => None,
        };

        let target_duration = pl.target_duration as f64;
        // A playlist is assumed to lag the live edge by the server's hold
        // back when advertised, else by three target durations.
        let availability_delay = server_control
            .as_ref()
            .filter(|sc| sc.hold_back > 0.0)
            .map(|sc| sc.hold_back)
            .unwrap_or(target_duration * 3.0);

        LevelDetails {
            live: !pl.end_list,
            start_sn,
            end_sn,
            start_cc,
            end_cc: cc,
            end_part: part_count - 1,
            target_duration,
            total_duration: start,
            fragments,
            init_segment,
            playlist_type,
            server_control,
            part_target,
            updated: true,
            availability_delay,
            push: None,
            url: url.to_string(),
        }
    }

    /// Whether the server advertises blocking playlist reloads and partial
    /// segments, i.e. the low-latency reload path applies.
    pub fn low_latency(&self) -> bool {
        self.server_control
            .as_ref()
            .map(|sc| sc.can_block_reload)
            .unwrap_or(false)
            && self.part_target.is_some()
    }

    /// Stamp `updated` by comparison with the previously installed details.
    ///
    /// `end_sn` advancing always counts as an update; a URL change only
    /// counts when the low-latency reload path is not in effect (a blocking
    /// reload rewrites the query on every request).
    pub fn mark_updated(&mut self, prior: Option<&LevelDetails>) {
        self.updated = match prior {
            None => true,
            Some(prev) => {
                prev.end_sn != self.end_sn || (!self.low_latency() && prev.url != self.url)
            }
        };
    }

    /// Delay in milliseconds before the next live reload.
    ///
    /// Base interval is the target duration; a reload that brought nothing
    /// new halves it so the edge is caught quickly. Time already spent
    /// fetching the playlist is deducted.
    pub fn compute_reload_interval(&self, load_duration_ms: u64) -> u64 {
        let mut interval = (self.target_duration * 1000.0) as u64;
        if !self.updated {
            interval /= 2;
        }
        interval
            .saturating_sub(load_duration_ms)
            .max(MIN_RELOAD_INTERVAL_MS)
    }
}

fn find_tag<'a>(pl: &'a MediaPlaylist, tag: &str) -> Option<&'a str> {
    pl.unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == tag)
        .and_then(|t| t.rest.as_deref())
}

/// Split a `KEY=VALUE,KEY="VAL,UE"` attribute list, honouring quotes.
fn split_attributes(rest: &str) -> Vec<(&str, &str)> {
    let mut parts: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }

    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .filter_map(|part| {
            let (k, v) = part.split_once('=')?;
            let mut val = v.trim();
            if let Some(stripped) = val.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                val = stripped;
            }
            Some((k.trim(), val))
        })
        .collect()
}
