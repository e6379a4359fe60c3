//! Append-only accumulators for captured child output.
//!
//! Output arrives in fixed-size chunks that are not aligned to lines or to
//! UTF-8 character boundaries. These helpers carry partial data across chunks
//! and only decode once a unit (line, whole stream, or complete characters)
//! is available.

/// Splits a byte stream into owned lines.
///
/// Every line-feed completes a line (empty lines included). Bytes after the
/// last line-feed are held until more data arrives or the stream finishes.
#[derive(Debug, Default)]
pub(crate) struct LineAccumulator {
    pending: Vec<u8>,
    lines: Vec<String>,
}

impl LineAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning how many lines it completed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> usize {
        let before = self.lines.len();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            let line = std::mem::take(&mut self.pending);
            self.lines.push(decode_owned(line));
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        self.lines.len() - before
    }

    /// Ends the stream. A non-empty unterminated fragment becomes the final line.
    pub(crate) fn finish(mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.lines.push(decode_owned(tail));
        }
        self.lines
    }
}

/// Collects a whole stream into one string.
#[derive(Debug, Default)]
pub(crate) struct TextAccumulator {
    bytes: Vec<u8>,
}

impl TextAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub(crate) fn finish(self) -> String {
        decode_owned(self.bytes)
    }
}

/// Turns chunks into strings without splitting multi-byte characters.
///
/// A character cut by a chunk boundary is carried into the next call.
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    carry: Vec<u8>,
}

impl ChunkDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Decodes everything in `chunk` except an incomplete trailing character.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);
        let cut = incomplete_tail_start(&bytes);
        self.carry = bytes.split_off(cut);
        decode_owned(bytes)
    }

    /// Flushes whatever is still carried (lossily, it can never complete now).
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            None
        } else {
            Some(decode_owned(std::mem::take(&mut self.carry)))
        }
    }
}

fn decode_owned(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

/// Index where a trailing, not yet complete UTF-8 sequence starts
/// (`bytes.len()` when the buffer ends on a character boundary).
fn incomplete_tail_start(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_on_line_feed() {
        let mut acc = LineAccumulator::new();
        assert_eq!(acc.push(b"one\ntwo\n"), 2);
        assert_eq!(acc.finish(), vec!["one", "two"]);
    }

    #[test]
    fn test_partial_line_is_carried_across_chunks() {
        let mut acc = LineAccumulator::new();
        assert_eq!(acc.push(b"hel"), 0);
        assert_eq!(acc.push(b"lo wor"), 0);
        assert_eq!(acc.push(b"ld\nnext"), 1);
        assert_eq!(acc.finish(), vec!["hello world", "next"]);
    }

    #[test]
    fn test_empty_lines_are_kept_but_no_trailing_empty_entry() {
        let mut acc = LineAccumulator::new();
        acc.push(b"a\n\nb\n");
        assert_eq!(acc.finish(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_no_output_gives_no_lines() {
        let acc = LineAccumulator::new();
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn test_line_feed_at_chunk_edge() {
        let mut acc = LineAccumulator::new();
        acc.push(b"first");
        acc.push(b"\n");
        acc.push(b"\nsecond");
        assert_eq!(acc.finish(), vec!["first", "", "second"]);
    }

    #[test]
    fn test_text_keeps_raw_bytes_in_order() {
        let mut acc = TextAccumulator::new();
        acc.push(b"line 1\nli");
        acc.push(b"ne 2\n");
        assert_eq!(acc.finish(), "line 1\nline 2\n");
    }

    #[test]
    fn test_decoder_holds_split_character() {
        let euro = "€".as_bytes();
        let mut decoder = ChunkDecoder::new();
        let mut first = b"price: ".to_vec();
        first.extend_from_slice(&euro[..2]);
        assert_eq!(decoder.decode(&first), "price: ");
        let mut second = euro[2..].to_vec();
        second.extend_from_slice(b"5");
        assert_eq!(decoder.decode(&second), "€5");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_flushes_truncated_tail_lossily() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&[b'x', 0xE2, 0x82]), "x");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
    }

    #[test]
    fn test_decoder_passes_invalid_bytes_through_lossily() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&[0xFF, b'a']), "\u{FFFD}a");
    }

    #[test]
    fn test_tail_detection() {
        assert_eq!(incomplete_tail_start(b""), 0);
        assert_eq!(incomplete_tail_start(b"abc"), 3);
        assert_eq!(incomplete_tail_start("ab€".as_bytes()), 5);
        assert_eq!(incomplete_tail_start(&[b'a', 0xF0, 0x9F, 0x98]), 1);
    }
}
