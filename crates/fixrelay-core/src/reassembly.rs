//! Line reassembly for chunked notification streams.
//!
//! BLE notifications split sentences at arbitrary byte offsets. The
//! reassembler buffers the text of one device and hands out complete lines
//! in arrival order. A trailing fragment is considered complete when it looks
//! like the end of an NMEA sentence (`...*HH`), otherwise it is kept until
//! more bytes arrive.
//!
//! No semantic validation happens here.

use tracing::warn;

/// Longest unterminated fragment kept before it is discarded as garbage.
///
/// NMEA sentences are at most 82 characters.
pub const MAX_PENDING_CHARS: usize = 1024;

/// Per-device line buffer.
#[derive(Debug, Default, Clone)]
pub struct SentenceReassembler {
    /// Unterminated text carried over from previous notifications.
    buffer: String,
    /// Bytes of an incomplete UTF-8 sequence at the end of the last notification.
    partial_char: Vec<u8>,
}

impl SentenceReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append notification bytes and return every line completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial_char.extend_from_slice(bytes);
        let cut = self.partial_char.len() - incomplete_tail_len(&self.partial_char);
        let tail = self.partial_char.split_off(cut);
        self.buffer.push_str(&String::from_utf8_lossy(&self.partial_char));
        self.partial_char = tail;

        if self.buffer.is_empty() {
            return Vec::new();
        }

        let mut fragments: Vec<&str> = self
            .buffer
            .split(|c| c == '\r' || c == '\n')
            .collect();
        let terminated = fragments.last().is_some_and(|last| looks_terminated(last));
        let retained = if terminated {
            String::new()
        } else {
            fragments.pop().unwrap_or_default().to_string()
        };

        let lines = fragments
            .into_iter()
            .filter(|fragment| !fragment.is_empty())
            .map(str::to_string)
            .collect();

        self.buffer = if retained.len() > MAX_PENDING_CHARS {
            warn!(
                "Discarding {} unterminated characters from notification stream",
                retained.len()
            );
            String::new()
        } else {
            retained
        };

        lines
    }

    /// The unterminated fragment currently held back.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Drop any buffered text.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.partial_char.clear();
    }
}

/// A fragment ending in a `*HH` checksum is a complete sentence.
fn looks_terminated(fragment: &str) -> bool {
    let chars: Vec<char> = fragment.chars().rev().take(3).collect();
    chars.len() == 3 && chars[2] == '*'
}

/// Number of trailing bytes forming the start of an unfinished UTF-8 sequence.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            // Continuation byte, keep looking for the leading byte
            continue;
        }
        let expected = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if expected > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    fn stream() -> String {
        format!("{GGA}\r\n{RMC}\r\n")
    }

    #[test]
    fn test_empty_feed_yields_nothing() {
        let mut reassembler = SentenceReassembler::new();
        assert!(reassembler.feed(b"").is_empty());
        assert_eq!(reassembler.pending(), "");
    }

    #[test]
    fn test_whole_stream() {
        let mut reassembler = SentenceReassembler::new();
        assert_eq!(reassembler.feed(stream().as_bytes()), vec![GGA, RMC]);
        assert_eq!(reassembler.pending(), "");
    }

    #[test]
    fn test_every_split_point_matches_whole() {
        let data = stream().into_bytes();
        for split in 0..=data.len() {
            let mut reassembler = SentenceReassembler::new();
            let mut lines = reassembler.feed(&data[..split]);
            lines.extend(reassembler.feed(&data[split..]));
            assert_eq!(lines, vec![GGA, RMC], "split at {split}");
        }
    }

    #[test]
    fn test_small_chunks_match_whole() {
        let data = stream().into_bytes();
        for size in [1, 3, 7, 20] {
            let mut reassembler = SentenceReassembler::new();
            let lines: Vec<String> = data
                .chunks(size)
                .flat_map(|chunk| reassembler.feed(chunk))
                .collect();
            assert_eq!(lines, vec![GGA, RMC], "chunk size {size}");
        }
    }

    #[test]
    fn test_checksum_terminated_buffer_drains() {
        let mut reassembler = SentenceReassembler::new();
        let lines = reassembler.feed(format!("{GGA}\r\n{RMC}").as_bytes());
        assert_eq!(lines, vec![GGA, RMC]);
        assert_eq!(reassembler.pending(), "");
    }

    #[test]
    fn test_mid_sentence_keeps_trailing_fragment() {
        let mut reassembler = SentenceReassembler::new();
        let lines = reassembler.feed(format!("{GGA}\r\n$GPRMC,123519,A,48").as_bytes());
        assert_eq!(lines, vec![GGA]);
        assert_eq!(reassembler.pending(), "$GPRMC,123519,A,48");

        // A partial checksum is not a terminator
        let lines = reassembler.feed(b"07.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6");
        assert!(lines.is_empty());
        assert!(reassembler.pending().ends_with("W*6"));

        let lines = reassembler.feed(b"A\r\n");
        assert_eq!(lines, vec![RMC]);
    }

    #[test]
    fn test_split_utf8_sequence_is_held_back() {
        let mut reassembler = SentenceReassembler::new();
        let text = "caf\u{e9}*00\r\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;

        assert!(reassembler.feed(&text[..split]).is_empty());
        assert_eq!(reassembler.pending(), "caf");
        assert_eq!(reassembler.feed(&text[split..]), vec!["caf\u{e9}*00"]);
    }

    #[test]
    fn test_oversized_fragment_discarded() {
        let mut reassembler = SentenceReassembler::new();
        let garbage = vec![b'x'; MAX_PENDING_CHARS + 1];
        assert!(reassembler.feed(&garbage).is_empty());
        assert_eq!(reassembler.pending(), "");
    }
}
