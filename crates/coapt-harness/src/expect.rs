//! Incremental expectation engine.
//!
//! [`ExpectBuffer`] accumulates decoded process output and tracks how much
//! of it earlier expectations have consumed. Every search runs over the
//! unconsumed suffix only, so a pattern can never match bytes that an
//! earlier expectation already claimed. [`Expectation`] is one pending
//! wait: a set of patterns plus a deadline, resolved exactly once.

use std::time::{Duration, Instant};

use coapt_pilot::AnsiFilter;

use crate::pattern::Pattern;

/// The outcome of a successful expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// The matched text.
    pub text: String,
    /// Unconsumed output that preceded the match.
    pub before: String,
    /// Capture groups of a regex pattern (empty for literals).
    pub captures: Vec<Option<String>>,
}

impl Match {
    /// Capture group `i` (1-based, like regex group numbers).
    pub fn group(&self, i: usize) -> Option<&str> {
        i.checked_sub(1)
            .and_then(|idx| self.captures.get(idx))
            .and_then(|c| c.as_deref())
    }
}

/// Consumed output kept for diagnostics once an expectation moves past it.
/// Older consumed text is dropped so long sessions stay bounded.
pub const RETAINED_CONSUMED: usize = 64 * 1024;

/// Decoded output with a monotonically advancing consumption point.
#[derive(Debug, Default)]
pub struct ExpectBuffer {
    text: String,
    consumed: usize,
    /// Consumed bytes already dropped from the front of `text`.
    discarded: usize,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
    filter: Option<AnsiFilter>,
}

impl ExpectBuffer {
    pub fn new(strip_ansi: bool) -> Self {
        Self {
            filter: strip_ansi.then(AnsiFilter::new),
            ..Self::default()
        }
    }

    /// Append a raw output chunk.
    ///
    /// Chunks may split UTF-8 sequences and escape sequences anywhere; both
    /// are reassembled across calls. Invalid UTF-8 becomes U+FFFD.
    pub fn feed(&mut self, chunk: &[u8]) {
        let filtered;
        let bytes = match self.filter.as_mut() {
            Some(filter) => {
                filtered = filter.feed(chunk);
                filtered.as_slice()
            }
            None => chunk,
        };
        self.partial.extend_from_slice(bytes);
        self.decode(false);
    }

    /// Flush anything held back waiting for more bytes. Called once the
    /// output stream has closed.
    pub fn finish(&mut self) {
        if let Some(filter) = self.filter.as_mut() {
            let rest = filter.finish();
            self.partial.extend_from_slice(&rest);
        }
        self.decode(true);
    }

    fn decode(&mut self, flush: bool) {
        let mut input = std::mem::take(&mut self.partial);
        let mut start = 0;
        loop {
            match std::str::from_utf8(&input[start..]) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    return;
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&input[start..valid_end]));
                    match err.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None if flush => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            return;
                        }
                        None => {
                            input.drain(..valid_end);
                            self.partial = input;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Search the unconsumed output for the earliest match among `patterns`.
    ///
    /// On success the consumption point moves to the end of the match and
    /// the index of the winning pattern is returned with it. When two
    /// patterns match at the same position the lower index wins.
    pub fn take_first(&mut self, patterns: &[Pattern]) -> Option<(usize, Match)> {
        let haystack = &self.text[self.consumed..];
        let (index, found) = patterns
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.find_in(haystack).map(|f| (i, f)))
            .min_by_key(|(i, f)| (f.start, *i))?;

        let matched = Match {
            text: haystack[found.start..found.end].to_string(),
            before: haystack[..found.start].to_string(),
            captures: found.captures,
        };
        self.consumed += found.end;
        self.compact();
        Some((index, matched))
    }

    /// Drop consumed text beyond [`RETAINED_CONSUMED`], in one step once
    /// twice that much has piled up.
    fn compact(&mut self) {
        if self.consumed <= 2 * RETAINED_CONSUMED {
            return;
        }
        let mut cut = self.consumed - RETAINED_CONSUMED;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.consumed -= cut;
        self.discarded += cut;
    }

    /// Search for a single pattern, consuming through the match.
    pub fn take(&mut self, pattern: &Pattern) -> Option<Match> {
        self.take_first(std::slice::from_ref(pattern))
            .map(|(_, m)| m)
    }

    /// Output not yet claimed by an expectation.
    pub fn unconsumed(&self) -> &str {
        &self.text[self.consumed..]
    }

    /// Output received so far, consumed or not. Consumed text older than
    /// [`RETAINED_CONSUMED`] bytes may already have been dropped.
    pub fn transcript(&self) -> &str {
        &self.text
    }

    /// Total decoded bytes received, including dropped ones.
    pub fn received(&self) -> usize {
        self.discarded + self.text.len()
    }

    /// Mark all buffered output as consumed. Nothing is dropped, so the
    /// transcript of a one-shot run stays complete.
    pub fn consume_all(&mut self) {
        self.consumed = self.text.len();
    }
}

/// Where an [`Expectation`] stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Matched { index: usize, found: Match },
    TimedOut { elapsed: Duration },
}

/// One pending wait for any of a set of patterns.
#[derive(Debug)]
pub struct Expectation<'p> {
    patterns: &'p [Pattern],
    started: Instant,
    deadline: Instant,
    outcome: Outcome,
}

impl<'p> Expectation<'p> {
    /// Start waiting now; the deadline is `timeout` from this call.
    pub fn new(patterns: &'p [Pattern], timeout: Duration) -> Self {
        Self::starting_at(patterns, timeout, Instant::now())
    }

    pub fn starting_at(patterns: &'p [Pattern], timeout: Duration, started: Instant) -> Self {
        Self {
            patterns,
            started,
            deadline: started + timeout,
            outcome: Outcome::Pending,
        }
    }

    /// Check the buffer against the patterns and the clock.
    ///
    /// The buffer is consulted before the deadline, so output that arrived
    /// in time still matches even if the check itself runs late. Once
    /// resolved the outcome never changes.
    pub fn poll(&mut self, buffer: &mut ExpectBuffer, now: Instant) -> &Outcome {
        if self.outcome == Outcome::Pending {
            if let Some((index, found)) = buffer.take_first(self.patterns) {
                self.outcome = Outcome::Matched { index, found };
            } else if now >= self.deadline {
                self.outcome = Outcome::TimedOut {
                    elapsed: now.saturating_duration_since(self.started),
                };
            }
        }
        &self.outcome
    }

    /// Time left before the deadline.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> Outcome {
        self.outcome
    }

    /// Human-readable description of the awaited patterns.
    pub fn describe(&self) -> String {
        self.patterns
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re(src: &str) -> Pattern {
        Pattern::regex(src).unwrap()
    }

    #[test]
    fn consumed_output_is_never_rematched() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(b"2.05 Content\r\n");
        assert!(buf.take(&Pattern::literal("2.05 Content")).is_some());
        assert!(buf.take(&Pattern::literal("2.05 Content")).is_none());

        buf.feed(b"2.05 Content\r\n");
        assert!(buf.take(&Pattern::literal("2.05 Content")).is_some());
    }

    #[test]
    fn match_spans_chunk_boundaries() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(b"registration succ");
        assert!(buf.take(&Pattern::literal("registration successful")).is_none());
        buf.feed(b"essful\r\n");
        let m = buf.take(&Pattern::literal("registration successful")).unwrap();
        assert_eq!(m.before, "");
    }

    #[test]
    fn before_holds_skipped_output() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(b"noise line\r\nFirst response: 2.05, 2 option\r\n");
        let m = buf.take(&re(r"First response:.*2\.05.*2 option")).unwrap();
        assert_eq!(m.before, "noise line\r\n");
        assert_eq!(buf.unconsumed(), "\r\n");
    }

    #[test]
    fn earliest_pattern_wins() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(b"warning: x\r\nsuccess: y\r\n");
        let patterns = [Pattern::literal("success:"), Pattern::literal("warning:")];
        let (index, m) = buf.take_first(&patterns).unwrap();
        assert_eq!(index, 1);
        assert_eq!(m.text, "warning:");
        let (index, _) = buf.take_first(&patterns).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn consumed_output_is_bounded() {
        let mut buf = ExpectBuffer::new(false);
        let line = "RD endpoint: successfully updated client registration\r\n";
        let mut fed = 0;
        while fed < 4 * RETAINED_CONSUMED {
            buf.feed(line.as_bytes());
            fed += line.len();
            assert!(buf.take(&Pattern::literal("updated client registration")).is_some());
        }
        assert!(buf.transcript().len() <= 2 * RETAINED_CONSUMED + line.len());
        assert_eq!(buf.received(), fed);
        assert_eq!(buf.unconsumed(), "\r\n");

        buf.feed(b"dropped client registration\r\n");
        let m = buf.take(&Pattern::literal("dropped client registration")).unwrap();
        assert_eq!(m.before, "\r\n");
    }

    #[test]
    fn split_utf8_sequences_are_reassembled() {
        let mut buf = ExpectBuffer::new(false);
        let text = "temp 21°C".as_bytes();
        let split = text.len() - 2; // inside the two-byte degree sign
        buf.feed(&text[..split]);
        assert_eq!(buf.transcript(), "temp 21");
        buf.feed(&text[split..]);
        assert_eq!(buf.transcript(), "temp 21°C");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(b"ok\xffok");
        assert_eq!(buf.transcript(), "ok\u{FFFD}ok");
    }

    #[test]
    fn finish_flushes_truncated_sequence() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(&[b'a', 0xC2]);
        assert_eq!(buf.transcript(), "a");
        buf.finish();
        assert_eq!(buf.transcript(), "a\u{FFFD}");
    }

    #[test]
    fn ansi_stripping_applies_across_chunks() {
        let mut buf = ExpectBuffer::new(true);
        buf.feed(b"\x1b[32msucc");
        buf.feed(b"ess:\x1b[");
        buf.feed(b"0m added\r\n");
        assert!(buf.take(&Pattern::literal("success: added")).is_some());
    }

    #[test]
    fn expectation_matches_buffered_output() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(b"Success\r\n");
        let patterns = [Pattern::literal("Success")];
        let mut exp = Expectation::new(&patterns, Duration::from_secs(1));
        match exp.poll(&mut buf, Instant::now()) {
            Outcome::Matched { index, found } => {
                assert_eq!(*index, 0);
                assert_eq!(found.text, "Success");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn timed_out_expectation_never_matches_later() {
        let mut buf = ExpectBuffer::new(false);
        let patterns = [Pattern::literal("late")];
        let start = Instant::now();
        let mut exp = Expectation::starting_at(&patterns, Duration::from_millis(100), start);

        assert_eq!(exp.poll(&mut buf, start), &Outcome::Pending);
        let after = start + Duration::from_millis(150);
        assert!(matches!(exp.poll(&mut buf, after), Outcome::TimedOut { .. }));

        buf.feed(b"late\r\n");
        assert!(matches!(exp.poll(&mut buf, after), Outcome::TimedOut { .. }));
        // Output is left for the next expectation
        assert_eq!(buf.unconsumed(), "late\r\n");
    }

    #[test]
    fn timeout_is_measured_from_the_expectation_start() {
        let patterns = [Pattern::literal("x")];
        let start = Instant::now();
        let exp = Expectation::starting_at(&patterns, Duration::from_secs(2), start);
        assert_eq!(exp.remaining(start + Duration::from_millis(500)), Duration::from_millis(1500));
        assert_eq!(exp.remaining(start + Duration::from_secs(3)), Duration::ZERO);
        assert_eq!(exp.describe(), "x");
    }

    #[test]
    fn group_numbers_are_one_based() {
        let mut buf = ExpectBuffer::new(false);
        buf.feed(b"lt: 60s\r\n");
        let m = buf.take(&re(r"lt: (\d+)s")).unwrap();
        assert_eq!(m.group(1), Some("60"));
        assert_eq!(m.group(0), None);
        assert_eq!(m.group(2), None);
    }
}
