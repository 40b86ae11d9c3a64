//! Streaming inference support
//!
//! Handles token-by-token streaming output from the model and the byte-offset
//! bookkeeping that turns a stream of pieces into a stored turn.

/// Opaque llama context state captured after a turn finished generating.
///
/// `token_count` is the KV position the state ends at; generation resumed
/// from this snapshot continues at that position.
#[derive(Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Number of tokens resident in the KV cache when the state was taken
    pub token_count: i32,
    /// Serialized state as produced by llama.cpp
    pub data: Vec<u8>,
}

impl ContextSnapshot {
    /// Size of the serialized state in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("token_count", &self.token_count)
            .field("size_bytes", &self.data.len())
            .finish()
    }
}

/// Represents an event emitted by the worker during streaming inference.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A chunk of valid UTF-8 text and the token ids that produced it
    Piece { text: String, token_ids: Vec<i32> },
    /// Generation completed; carries the context state after the last token
    Done(ContextSnapshot),
    /// An error occurred during generation
    Error(String),
}

/// Reassembles token bytes into UTF-8 text.
///
/// A single token can end in the middle of a multi-byte character, so bytes
/// are held back until they form complete characters. Sequences that can
/// never become valid are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns whatever complete text is now available.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete tail, wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        (!out.is_empty()).then_some(out)
    }

    /// Drains any held-back bytes, lossily.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let s = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(s)
    }
}

/// A finished turn: full text, token ids and one byte span per piece.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedTurn {
    pub text: String,
    pub tokens: Vec<i32>,
    pub spans: Vec<(usize, usize)>,
}

/// Accumulates streamed pieces into a turn.
///
/// Spans are byte offsets into the UTF-8 text, contiguous and starting at 0.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    turn: CompletedTurn,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a piece and returns its span. Empty pieces are skipped.
    pub fn push(&mut self, piece: &str, token_ids: &[i32]) -> Option<(usize, usize)> {
        if piece.is_empty() {
            return None;
        }
        let start = self.turn.text.len();
        self.turn.text.push_str(piece);
        let end = self.turn.text.len();

        self.turn.tokens.extend_from_slice(token_ids);
        self.turn.spans.push((start, end));
        Some((start, end))
    }

    pub fn finish(self) -> CompletedTurn {
        self.turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_debug_hides_blob() {
        let snapshot = ContextSnapshot {
            token_count: 12,
            data: vec![0xAB; 1024],
        };
        let debug = format!("{:?}", snapshot);
        assert!(debug.contains("size_bytes: 1024"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn test_assembler_ascii_passthrough() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"Hello"), Some("Hello".to_string()));
        assert_eq!(asm.flush(), None);
    }

    #[test]
    fn test_assembler_holds_split_character() {
        // "é" is 0xC3 0xA9
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"caf\xC3"), Some("caf".to_string()));
        assert_eq!(asm.push(b"\xA9!"), Some("é!".to_string()));
        assert_eq!(asm.flush(), None);
    }

    #[test]
    fn test_assembler_four_byte_character_across_tokens() {
        // U+1F600 is F0 9F 98 80
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"\xF0"), None);
        assert_eq!(asm.push(b"\x9F\x98"), None);
        assert_eq!(asm.push(b"\x80"), Some("\u{1F600}".to_string()));
    }

    #[test]
    fn test_assembler_replaces_invalid_bytes() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"a\xFFb"), Some("a\u{FFFD}b".to_string()));
    }

    #[test]
    fn test_assembler_flush_incomplete_tail() {
        let mut asm = Utf8Assembler::new();
        asm.push(b"x\xE2\x82");
        assert_eq!(asm.flush(), Some("\u{FFFD}".to_string()));
        assert_eq!(asm.flush(), None);
    }

    #[test]
    fn test_accumulator_spans_are_contiguous_byte_offsets() {
        let mut acc = TurnAccumulator::new();
        assert_eq!(acc.push("Hi", &[1]), Some((0, 2)));
        assert_eq!(acc.push(" ", &[2]), Some((2, 3)));
        assert_eq!(acc.push("naïve", &[3, 4]), Some((3, 9)));

        let turn = acc.finish();
        assert_eq!(turn.text, "Hi naïve");
        assert_eq!(turn.tokens, vec![1, 2, 3, 4]);
        assert_eq!(turn.spans, vec![(0, 2), (2, 3), (3, 9)]);
        for (start, end) in &turn.spans {
            assert!(turn.text.is_char_boundary(*start));
            assert!(turn.text.is_char_boundary(*end));
        }
    }

    #[test]
    fn test_accumulator_skips_empty_pieces() {
        let mut acc = TurnAccumulator::new();
        assert_eq!(acc.push("", &[7]), None);
        let turn = acc.finish();
        assert!(turn.spans.is_empty());
        assert!(turn.tokens.is_empty());
    }
}
