//! Exposure/gain bracketing
//!
//! Ranges come in two shapes:
//! - EV compensation steps: `"-30,-10,0,10,30"`
//! - exposure/gain pairs: `"(100,300),(200,300)"`
//!
//! A leading sign makes a value relative to the AE estimate, a trailing
//! `F`/`f` forces it past flicker and other safety limits.

use crate::error::{AdapterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketMode {
    Absolute,
    Relative,
    AbsoluteForced,
    RelativeForced,
}

impl BracketMode {
    pub fn forced(self) -> Self {
        match self {
            BracketMode::Absolute | BracketMode::AbsoluteForced => BracketMode::AbsoluteForced,
            BracketMode::Relative | BracketMode::RelativeForced => BracketMode::RelativeForced,
        }
    }
}

/// One bracketing step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketEntry {
    /// EV step, or exposure value for pairs
    pub exposure: i32,
    /// Gain for exposure/gain pairs
    pub gain: Option<i32>,
    pub mode: BracketMode,
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_force_marker(&mut self) -> bool {
        if matches!(self.peek(), Some(b'F' | b'f')) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Signed integer; the flag reports whether an explicit sign was present
    fn number(&mut self) -> Result<(i32, bool)> {
        self.skip_ws();
        let start = self.pos;
        let signed = matches!(self.peek(), Some(b'+' | b'-'));
        if signed {
            self.pos += 1;
        }
        let digits = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == digits {
            return Err(self.error("expected a number"));
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("not utf-8"))?;
        let value = text
            .trim_start_matches('+')
            .parse::<i32>()
            .map_err(|_| self.error("value out of range"))?;
        Ok((value, signed))
    }

    fn error(&self, what: &str) -> AdapterError {
        AdapterError::BadValue(format!(
            "bracketing range at offset {}: {}",
            self.pos, what
        ))
    }
}

/// Parse a bracketing range; an empty string means bracketing is off
pub fn parse_bracketing_range(input: &str) -> Result<Vec<BracketEntry>> {
    let mut cur = Cursor::new(input);
    let mut entries = Vec::new();

    loop {
        cur.skip_ws();
        if cur.peek().is_none() {
            break;
        }

        let mut entry = if cur.eat(b'(') {
            let (exposure, exp_signed) = cur.number()?;
            if !cur.eat(b',') {
                return Err(cur.error("expected ',' inside pair"));
            }
            let (gain, gain_signed) = cur.number()?;
            if !cur.eat(b')') {
                return Err(cur.error("unterminated pair"));
            }
            BracketEntry {
                exposure,
                gain: Some(gain),
                mode: if exp_signed || gain_signed {
                    BracketMode::Relative
                } else {
                    BracketMode::Absolute
                },
            }
        } else {
            let (exposure, _) = cur.number()?;
            BracketEntry {
                exposure,
                gain: None,
                mode: BracketMode::Relative,
            }
        };

        if cur.eat_force_marker() {
            entry.mode = entry.mode.forced();
        }
        entries.push(entry);

        cur.skip_ws();
        match cur.peek() {
            None => break,
            Some(b',') => cur.pos += 1,
            Some(_) => return Err(cur.error("expected ','")),
        }
    }

    Ok(entries)
}

/// One entry of the hardware shot queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotRecord {
    pub config_id: u32,
    /// Repeat count
    pub frames: u32,
    pub ev: i32,
    pub exposure: i32,
    pub gain: i32,
    pub mode: BracketMode,
}

/// Frames a capture produces for `burst` and the given entries
pub fn shot_count(entries: &[BracketEntry], burst: u32) -> u32 {
    burst.max(entries.len() as u32)
}

/// Build the shot queue for a capture of `frames` frames.
///
/// One record per entry; when frames outnumber entries the last entry is
/// repeated as an extra record carrying the remainder. No entries means a
/// single plain burst record.
pub fn build_shot_queue(entries: &[BracketEntry], frames: u32) -> Vec<ShotRecord> {
    if entries.is_empty() {
        if frames == 0 {
            return Vec::new();
        }
        return vec![ShotRecord {
            config_id: 0,
            frames,
            ev: 0,
            exposure: 0,
            gain: 0,
            mode: BracketMode::Relative,
        }];
    }

    let mut records: Vec<ShotRecord> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let (ev, exposure, gain) = match e.gain {
                Some(gain) => (0, e.exposure, gain),
                None => (e.exposure, 0, 0),
            };
            ShotRecord {
                config_id: i as u32,
                frames: 1,
                ev,
                exposure,
                gain,
                mode: e.mode,
            }
        })
        .collect();

    let n = records.len() as u32;
    if frames > n {
        if let Some(last) = records.last().copied() {
            records.push(ShotRecord {
                config_id: n,
                frames: frames - n,
                ..last
            });
        }
    }
    records
}

/// Remaining frames when a plain capture interrupts bracketing after
/// `sent` retained frames were forwarded
pub fn remaining_after_interrupt(range: usize, sent: usize) -> usize {
    let lookahead = range.saturating_sub(1);
    if lookahead > sent {
        range + (lookahead - sent)
    } else {
        range
    }
}

/// Temporal bracketing lookahead over the image port pool.
///
/// Completed buffers are retained (not delivered) in a circular window so a
/// later capture can forward frames that were exposed before the request.
#[derive(Debug, Default)]
pub struct BracketingState {
    enabled: bool,
    range: usize,
    retained: Vec<bool>,
    in_flight: usize,
    last_index: Option<usize>,
}

impl BracketingState {
    pub fn start(&mut self, range: usize, slots: usize) {
        self.enabled = true;
        self.range = range;
        self.retained = vec![false; slots];
        self.in_flight = 0;
        self.last_index = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn range(&self) -> usize {
        self.range
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn mark_queued(&mut self, slot: usize) {
        if let Some(r) = self.retained.get_mut(slot) {
            *r = false;
        }
        self.in_flight += 1;
    }

    /// Record a completion; returns the oldest retained slot to recycle
    pub fn on_complete(&mut self, slot: usize) -> Option<usize> {
        if !self.enabled || slot >= self.retained.len() {
            return None;
        }
        self.retained[slot] = true;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.last_index = Some(slot);

        let next = (slot + 1) % self.retained.len();
        if next != slot && self.retained[next] {
            self.retained[next] = false;
            Some(next)
        } else {
            None
        }
    }

    /// Retained slots in circular order, oldest first; clears them
    pub fn take_retained(&mut self) -> Vec<usize> {
        let n = self.retained.len();
        let Some(last) = self.last_index else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut idx = last;
        loop {
            idx = (idx + 1) % n;
            if self.retained[idx] {
                self.retained[idx] = false;
                out.push(idx);
            }
            if idx == last {
                break;
            }
        }
        out
    }

    /// Disable and return the retained slots so they can be released
    pub fn stop(&mut self) -> Vec<usize> {
        let retained = self.take_retained();
        self.enabled = false;
        self.in_flight = 0;
        self.last_index = None;
        retained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ev_steps_are_relative() {
        let entries = parse_bracketing_range("-30,-10,0,10,30").unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(
            entries.iter().map(|e| e.exposure).collect::<Vec<_>>(),
            vec![-30, -10, 0, 10, 30]
        );
        assert!(entries
            .iter()
            .all(|e| e.mode == BracketMode::Relative && e.gain.is_none()));
    }

    #[test]
    fn unsigned_pairs_are_absolute() {
        let entries = parse_bracketing_range("(100,300),(200,300)").unwrap();
        assert_eq!(
            entries,
            vec![
                BracketEntry {
                    exposure: 100,
                    gain: Some(300),
                    mode: BracketMode::Absolute
                },
                BracketEntry {
                    exposure: 200,
                    gain: Some(300),
                    mode: BracketMode::Absolute
                },
            ]
        );
    }

    #[test]
    fn signed_member_makes_pair_relative() {
        let entries = parse_bracketing_range("(100,+50), (-20,300)F").unwrap();
        assert_eq!(entries[0].mode, BracketMode::Relative);
        assert_eq!(entries[1].mode, BracketMode::RelativeForced);
        assert_eq!(entries[1].exposure, -20);
    }

    #[test]
    fn force_marker_upgrades_mode() {
        let entries = parse_bracketing_range("-30F,0F").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.mode == BracketMode::RelativeForced));
        assert_eq!(entries[1].exposure, 0);

        let entries = parse_bracketing_range("(100,300)f").unwrap();
        assert_eq!(entries[0].mode, BracketMode::AbsoluteForced);
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert!(parse_bracketing_range("").unwrap().is_empty());
        assert!(parse_bracketing_range("  ").unwrap().is_empty());
        for bad in ["-", "(1,2", "(1)", "1;2", "1,,x", "99999999999"] {
            assert!(
                matches!(parse_bracketing_range(bad), Err(AdapterError::BadValue(_))),
                "accepted {bad:?}"
            );
        }
    }

    fn total(records: &[ShotRecord]) -> u32 {
        records.iter().map(|r| r.frames).sum()
    }

    #[test]
    fn shot_queue_frames_match_request() {
        let entries = parse_bracketing_range("-2,0,2").unwrap();
        for (entries, burst) in [(&entries[..0], 4), (&entries[..1], 1), (&entries[..], 3), (&entries[..], 7)] {
            let frames = shot_count(entries, burst);
            assert_eq!(total(&build_shot_queue(entries, frames)), frames);
        }
        assert!(build_shot_queue(&[], 0).is_empty());
    }

    #[test]
    fn remainder_goes_to_copy_of_last_entry() {
        let entries = parse_bracketing_range("-10,0,10").unwrap();
        let records = build_shot_queue(&entries, 5);
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].frames, 2);
        assert_eq!(records[3].ev, records[2].ev);
        assert_eq!(records[3].mode, records[2].mode);
        assert_eq!(records[3].config_id, 3);
    }

    #[test]
    fn burst_only_is_single_record() {
        let records = build_shot_queue(&[], 6);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frames, 6);
        assert_eq!(records[0].ev, 0);
    }

    #[test]
    fn pairs_fill_exposure_and_gain() {
        let entries = parse_bracketing_range("(100,300)").unwrap();
        let records = build_shot_queue(&entries, 1);
        assert_eq!((records[0].ev, records[0].exposure, records[0].gain), (0, 100, 300));
    }

    #[test]
    fn interrupt_recomputes_remaining() {
        assert_eq!(remaining_after_interrupt(4, 1), 6);
        assert_eq!(remaining_after_interrupt(4, 3), 4);
        assert_eq!(remaining_after_interrupt(4, 5), 4);
        assert_eq!(remaining_after_interrupt(1, 0), 1);
    }

    #[test]
    fn lookahead_recycles_oldest_and_drains_in_order() {
        let mut st = BracketingState::default();
        st.start(3, 3);
        for slot in 0..3 {
            st.mark_queued(slot);
        }
        assert_eq!(st.on_complete(0), None);
        assert_eq!(st.on_complete(1), None);
        // slot 0 is next after 2 and retained, so it gets recycled
        assert_eq!(st.on_complete(2), Some(0));
        st.mark_queued(0);
        assert_eq!(st.take_retained(), vec![1, 2]);
        assert!(st.take_retained().is_empty());
        assert!(st.is_enabled());
        st.stop();
        assert!(!st.is_enabled());
        assert_eq!(st.on_complete(1), None);
    }
}
