//! Text chunking.
//!
//! The orchestration core never decides where to split text: it consumes
//! the ordered spans a `Chunker` produces. `SlidingWindowChunker` is the
//! default implementation; callers with tokenizer-aware chunkers plug in
//! their own behind the trait.

use crate::doc::ChunkSpan;

/// Splits text into ordered, contiguous-ish spans when it exceeds a
/// backend's input budget.
pub trait Chunker: Send + Sync {
    /// Returns ordered spans over `text`. An empty result means the text
    /// should be treated as a single chunk.
    fn chunk(&self, text: &str) -> Vec<ChunkSpan>;
}

impl std::fmt::Debug for dyn Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Chunker").finish_non_exhaustive()
    }
}

/// Character-budget sliding window with overlap.
///
/// Windows back off to the last whitespace inside the budget so chunks do
/// not cut words; a window with no whitespace splits at the budget.
pub struct SlidingWindowChunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl SlidingWindowChunker {
    /// `max_chars` is the window budget, `overlap_chars` how many trailing
    /// characters each window shares with the next.
    ///
    /// Overlap is clamped below the window size so progress is guaranteed.
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            overlap_chars: overlap_chars.min(max_chars.saturating_sub(1)),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }
}

impl Chunker for SlidingWindowChunker {
    fn chunk(&self, text: &str) -> Vec<ChunkSpan> {
        // Byte offset of every char boundary, plus the end of the text.
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let n_chars = boundaries.len() - 1;

        if n_chars <= self.max_chars {
            return vec![ChunkSpan::new(0, text.len())];
        }

        let mut spans = Vec::new();
        let mut start_char = 0;
        while start_char < n_chars {
            let mut end_char = (start_char + self.max_chars).min(n_chars);

            // Back off to the last whitespace inside the window, unless
            // this window already reaches the end of the text.
            if end_char < n_chars {
                let window = &text[boundaries[start_char]..boundaries[end_char]];
                if let Some(ws) = window.rfind(char::is_whitespace) {
                    let ws_char = window[..ws].chars().count();
                    if ws_char > 0 {
                        end_char = start_char + ws_char + 1;
                    }
                }
            }

            spans.push(ChunkSpan::new(
                boundaries[start_char],
                boundaries[end_char],
            ));

            if end_char == n_chars {
                break;
            }
            start_char = end_char.saturating_sub(self.overlap_chars).max(start_char + 1);
        }

        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_span() {
        let chunker = SlidingWindowChunker::new(100, 10);
        let spans = chunker.chunk("short text");
        assert_eq!(spans, vec![ChunkSpan::new(0, 10)]);
    }

    #[test]
    fn long_text_is_split_into_ordered_spans() {
        let text = "one two three four five six seven eight nine ten";
        let chunker = SlidingWindowChunker::new(20, 0);
        let spans = chunker.chunk(text);

        assert!(spans.len() > 1);
        // Spans are ordered and within bounds.
        for pair in spans.windows(2) {
            assert!(pair[0].start < pair[1].start);
        }
        assert_eq!(spans.last().unwrap().end, text.len());
    }

    #[test]
    fn spans_cover_the_full_text_without_overlap() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota";
        let chunker = SlidingWindowChunker::new(16, 0);
        let spans = chunker.chunk(text);

        assert_eq!(spans[0].start, 0);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(spans.last().unwrap().end, text.len());
    }

    #[test]
    fn windows_break_at_whitespace() {
        let text = "aaaa bbbb cccc dddd eeee";
        let chunker = SlidingWindowChunker::new(11, 0);
        for span in chunker.chunk(text) {
            let s = span.slice(text);
            // No chunk starts or ends mid-word (trailing space allowed).
            assert!(
                s.trim_end().chars().last().map_or(true, |c| !c.is_whitespace()),
                "bad span: {s:?}"
            );
        }
    }

    #[test]
    fn overlap_repeats_trailing_context() {
        let text = "aaaa bbbb cccc dddd eeee ffff gggg hhhh";
        let chunker = SlidingWindowChunker::new(15, 5);
        let spans = chunker.chunk(text);

        assert!(spans.len() > 1);
        for pair in spans.windows(2) {
            assert!(pair[1].start < pair[0].end, "no overlap between windows");
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllo wörld ünïcode täxt möre wörds hére ägain";
        let chunker = SlidingWindowChunker::new(12, 2);
        for span in chunker.chunk(text) {
            // Would panic on a non-boundary slice.
            let _ = span.slice(text);
        }
    }

    #[test]
    fn unbroken_text_still_makes_progress() {
        let text = "x".repeat(50);
        let chunker = SlidingWindowChunker::new(10, 4);
        let spans = chunker.chunk(&text);
        assert!(spans.len() >= 5);
        assert_eq!(spans.last().unwrap().end, text.len());
    }

    #[test]
    fn overlap_is_clamped_below_window() {
        let chunker = SlidingWindowChunker::new(10, 50);
        assert_eq!(chunker.overlap_chars(), 9);
        // Must terminate.
        let spans = chunker.chunk(&"y ".repeat(40));
        assert!(!spans.is_empty());
    }
}
