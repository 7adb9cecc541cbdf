//! ANSI escape sequence filtering for clean pattern matching.
//!
//! Device shells and peer tools sometimes colour their output. Patterns are
//! written against the visible text, so sessions can opt into removing
//! escape sequences before the output reaches the expectation buffer.
//!
//! Output arrives in arbitrary chunks, so an escape sequence may be split
//! across two reads. [`AnsiFilter`] holds back an unfinished trailing
//! sequence until the next chunk completes it.

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

/// Upper bound on a held-back unfinished sequence. Anything longer is not a
/// real escape sequence: its introducer is dropped and the rest is passed
/// through as visible text.
const MAX_PENDING: usize = 4096;

/// Outcome of scanning one escape sequence starting at an ESC byte.
enum Escape {
    /// The sequence ends before this index.
    Complete(usize),
    /// Input ended inside the sequence.
    Incomplete,
}

fn scan_escape(input: &[u8], start: usize) -> Escape {
    let mut i = start + 1;
    let Some(&kind) = input.get(i) else {
        return Escape::Incomplete;
    };
    match kind {
        // CSI: parameter and intermediate bytes, then one final byte
        b'[' => {
            i += 1;
            while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
                i += 1;
            }
            match input.get(i) {
                Some(b) if (0x40..=0x7E).contains(b) => Escape::Complete(i + 1),
                Some(_) => Escape::Complete(i),
                None => Escape::Incomplete,
            }
        }
        // OSC: terminated by BEL or ESC backslash
        b']' => {
            i += 1;
            while i < input.len() {
                if input[i] == BEL {
                    return Escape::Complete(i + 1);
                }
                if input[i] == ESC {
                    return match input.get(i + 1) {
                        Some(b'\\') => Escape::Complete(i + 2),
                        Some(_) => Escape::Complete(i + 1),
                        None => Escape::Incomplete,
                    };
                }
                i += 1;
            }
            Escape::Incomplete
        }
        _ => Escape::Complete(i + 1),
    }
}

/// Strip every complete escape sequence from `input`.
///
/// An unfinished sequence at the end of the input is dropped. Carriage
/// returns are kept: terminal line endings are `\r\n` and patterns may rely
/// on them.
pub fn strip_ansi(input: &[u8]) -> Vec<u8> {
    let mut filter = AnsiFilter::new();
    let mut out = filter.feed(input);
    out.extend(filter.finish());
    out
}

/// Streaming escape-sequence filter.
#[derive(Debug, Default)]
pub struct AnsiFilter {
    pending: Vec<u8>,
}

impl AnsiFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk, returning the visible bytes that are final.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            if input[i] != ESC {
                out.push(input[i]);
                i += 1;
                continue;
            }
            match scan_escape(&input, i) {
                Escape::Complete(end) => i = end,
                Escape::Incomplete if input.len() - i <= MAX_PENDING => {
                    self.pending = input[i..].to_vec();
                    break;
                }
                // A stray introducer; what follows is device output
                Escape::Incomplete => i += 2,
            }
        }
        out
    }

    /// Flush at end of stream. An unfinished sequence is discarded.
    pub fn finish(&mut self) -> Vec<u8> {
        self.pending.clear();
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(input: &[u8]) -> String {
        String::from_utf8(strip_ansi(input)).unwrap()
    }

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(strip(b"2.05 Content"), "2.05 Content");
    }

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip(b"\x1b[1;31mRD update successful\x1b[0m"), "RD update successful");
    }

    #[test]
    fn strips_osc_title() {
        assert_eq!(strip(b"\x1b]0;native\x07> "), "> ");
        assert_eq!(strip(b"\x1b]0;native\x1b\\> "), "> ");
    }

    #[test]
    fn keeps_carriage_returns() {
        assert_eq!(strip(b"lt: 60s\r\n"), "lt: 60s\r\n");
    }

    #[test]
    fn keeps_utf8_continuation_bytes() {
        // U+00DB encodes as C3 9B; 0x9B must not be taken for a CSI
        assert_eq!(strip("\u{00DB}x".as_bytes()), "\u{00DB}x");
    }

    #[test]
    fn truncated_escape_is_dropped() {
        assert_eq!(strip(b"text\x1b"), "text");
        assert_eq!(strip(b"text\x1b[3"), "text");
    }

    #[test]
    fn sequence_split_across_chunks() {
        let mut filter = AnsiFilter::new();
        let first = filter.feed(b"success\x1b[3");
        assert_eq!(first, b"success");

        let second = filter.feed(b"2m: added\x1b[0m\n");
        assert_eq!(second, b": added\n");
        assert_eq!(filter.feed(b"ok"), b"ok");
    }

    #[test]
    fn osc_split_across_chunks() {
        let mut filter = AnsiFilter::new();
        assert_eq!(filter.feed(b"a\x1b]0;ti"), b"a");
        assert_eq!(filter.feed(b"tle\x07b"), b"b");
    }

    #[test]
    fn finish_discards_pending() {
        let mut filter = AnsiFilter::new();
        filter.feed(b"\x1b[");
        assert!(filter.finish().is_empty());
        assert_eq!(filter.feed(b"next"), b"next");
    }

    #[test]
    fn unterminated_osc_releases_output_past_bound() {
        let mut filter = AnsiFilter::new();
        assert!(filter.feed(b"\x1b]0;native").is_empty());

        let mut visible = Vec::new();
        for _ in 0..MAX_PENDING / 64 + 1 {
            visible.extend(filter.feed(&[b'.'; 64]));
        }
        visible.extend(filter.feed(b"\x1b[32mregistration successful\x1b[0m\r\n"));
        let text = String::from_utf8(visible).unwrap();
        assert!(text.starts_with("0;native"), "{text:?}");
        assert!(text.ends_with("registration successful\r\n"), "{text:?}");
    }
}
