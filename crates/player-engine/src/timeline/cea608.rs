//! CEA-608 byte-pair extraction (ATSC A/53) and a pop-on caption decoder.
//!
//! Extraction walks the `cc_data` structure carried in H.264 SEI user data:
//! a count in the low five bits of the first byte, then triples of
//! `(flags, byte1, byte2)` starting at offset 2. Only valid 608 pairs
//! (cc_type 0 or 1) are kept; field 0 feeds channels 1/2, field 1 feeds
//! channels 3/4.

use tracing::trace;

/// Extract CEA-608 byte pairs per field from one user-data sample.
///
/// Pairs have their parity bit stripped; pairs that are all zero after
/// stripping are padding and dropped.
pub fn extract_cea608_pairs(bytes: &[u8]) -> [Vec<[u8; 2]>; 2] {
    let mut fields: [Vec<[u8; 2]>; 2] = [Vec::new(), Vec::new()];
    let Some(&first) = bytes.first() else {
        return fields;
    };
    let count = (first & 0x1f) as usize;
    let mut pos = 2;
    for _ in 0..count {
        if pos + 3 > bytes.len() {
            break;
        }
        let tmp = bytes[pos];
        let cc_valid = tmp & 0x04 != 0;
        let cc_type = tmp & 0x03;
        let pair = [bytes[pos + 1] & 0x7f, bytes[pos + 2] & 0x7f];
        pos += 3;
        if cc_valid && cc_type <= 1 && (pair[0] != 0 || pair[1] != 0) {
            fields[cc_type as usize].push(pair);
        }
    }
    fields
}

/// One decoded caption with its target CEA channel (1..=4).
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCue {
    pub channel: u8,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Decodes the byte-pair stream of one field into timed captions.
pub trait Cea608Decoder: Send {
    fn push_pairs(&mut self, pts: f64, pairs: &[[u8; 2]]);
    /// Drain captions completed since the last call.
    fn take_cues(&mut self) -> Vec<ChannelCue>;
    /// Drop all decoder state (used across sequence discontinuities).
    fn reset(&mut self);
}

// Standard-set replacements where 608 diverges from ASCII.
fn basic_char(byte: u8) -> Option<char> {
    match byte {
        0x2a => Some('á'),
        0x5c => Some('é'),
        0x5e => Some('í'),
        0x5f => Some('ó'),
        0x60 => Some('ú'),
        0x7b => Some('ç'),
        0x7c => Some('÷'),
        0x7d => Some('Ñ'),
        0x7e => Some('ñ'),
        0x7f => Some('█'),
        0x20..=0x7a => Some(byte as char),
        _ => None,
    }
}

// Special characters, 0x11 0x30-0x3f.
const SPECIAL_CHARS: [char; 16] = [
    '®', '°', '½', '¿', '™', '¢', '£', '♪', 'à', ' ', 'è', 'â', 'ê', 'î', 'ô', 'û',
];

#[derive(Default)]
struct ChannelState {
    displayed: String,
    non_displayed: String,
    display_start: Option<f64>,
}

/// Pop-on mode decoder for one field (two data channels).
///
/// Roll-up and paint-on modes are not decoded; their control codes clear
/// state but produce no cues.
pub struct PopOnDecoder {
    /// CEA channel number of this field's first data channel (1 or 3).
    base_channel: u8,
    channels: [ChannelState; 2],
    current: usize,
    last_control: Option<[u8; 2]>,
    cues: Vec<ChannelCue>,
}

impl PopOnDecoder {
    pub fn new(base_channel: u8) -> Self {
        PopOnDecoder {
            base_channel,
            channels: [ChannelState::default(), ChannelState::default()],
            current: 0,
            last_control: None,
            cues: Vec::new(),
        }
    }

    fn emit_displayed(&mut self, channel: usize, end: f64) {
        let state = &mut self.channels[channel];
        if let Some(start) = state.display_start.take()
            && !state.displayed.is_empty()
            && end > start
        {
            let text = std::mem::take(&mut state.displayed);
            trace!(channel = self.base_channel + channel as u8, %text, "caption completed");
            self.cues.push(ChannelCue {
                channel: self.base_channel + channel as u8,
                start,
                end,
                text,
            });
        } else {
            state.displayed.clear();
            state.display_start = None;
        }
    }

    fn control(&mut self, pts: f64, b1: u8, b2: u8) {
        let channel = usize::from(b1 & 0x08 != 0);
        self.current = channel;
        let b1 = b1 & 0xf7;

        match (b1, b2) {
            (0x14, 0x20) => {
                // Resume caption loading: pop-on composition begins.
            }
            (0x14, 0x2c) => {
                // Erase displayed memory ends the visible caption.
                self.emit_displayed(channel, pts);
            }
            (0x14, 0x2e) => {
                self.channels[channel].non_displayed.clear();
            }
            (0x14, 0x2f) => {
                // End of caption: flip memories, the composed text becomes
                // visible from this timestamp.
                self.emit_displayed(channel, pts);
                let state = &mut self.channels[channel];
                std::mem::swap(&mut state.displayed, &mut state.non_displayed);
                state.non_displayed.clear();
                state.display_start = Some(pts);
            }
            (0x11, 0x30..=0x3f) => {
                self.channels[channel]
                    .non_displayed
                    .push(SPECIAL_CHARS[(b2 - 0x30) as usize]);
            }
            (0x11, 0x20..=0x2f) => {
                // Mid-row style codes carry no text.
            }
            (0x10..=0x17, 0x40..=0x7f) => {
                // Preamble address code: row change.
                let buf = &mut self.channels[channel].non_displayed;
                if !buf.is_empty() && !buf.ends_with('\n') {
                    buf.push('\n');
                }
            }
            _ => {}
        }
    }

    fn printable(&mut self, b1: u8, b2: u8) {
        let buf = &mut self.channels[self.current].non_displayed;
        if let Some(c) = basic_char(b1) {
            buf.push(c);
        }
        if let Some(c) = basic_char(b2) {
            buf.push(c);
        }
    }
}

impl Cea608Decoder for PopOnDecoder {
    fn push_pairs(&mut self, pts: f64, pairs: &[[u8; 2]]) {
        for &[b1, b2] in pairs {
            if (0x10..=0x1f).contains(&b1) {
                // Control codes are transmitted twice; consume the double.
                if self.last_control == Some([b1, b2]) {
                    self.last_control = None;
                    continue;
                }
                self.last_control = Some([b1, b2]);
                self.control(pts, b1, b2);
            } else {
                self.last_control = None;
                if b1 >= 0x20 {
                    self.printable(b1, b2);
                }
            }
        }
    }

    fn take_cues(&mut self) -> Vec<ChannelCue> {
        std::mem::take(&mut self.cues)
    }

    fn reset(&mut self) {
        self.channels = [ChannelState::default(), ChannelState::default()];
        self.current = 0;
        self.last_control = None;
        self.cues.clear();
    }
}
