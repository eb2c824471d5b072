use crate::error::IngestError;
use crate::models::IngestionOptions;

const PARAGRAPH_BREAK: [char; 2] = ['\n', '\n'];
const SENTENCE_BREAK: [char; 2] = ['.', ' '];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {overlap} must be smaller than chunk_size {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }
}

impl TryFrom<&IngestionOptions> for ChunkingConfig {
    type Error = IngestError;

    fn try_from(value: &IngestionOptions) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.chunk_overlap)
    }
}

/// A trimmed chunk plus the character window `[start, end)` it was cut from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub content: String,
    pub start: usize,
    pub end: usize,
}

/// Splits `text` into windows of at most `chunk_size` characters, preferring to
/// end a window on a paragraph break and then on a sentence break when either
/// falls in the second half of the window. Consecutive windows share `overlap`
/// characters unless that would stall the cursor.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let half = config.chunk_size / 2;

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < len {
        let mut end = start + config.chunk_size;
        let is_final = end >= len;

        if is_final {
            end = len;
        } else if let Some(position) =
            rfind(&chars, &PARAGRAPH_BREAK, start, end).filter(|position| *position > start + half)
        {
            end = position;
        } else if let Some(position) =
            rfind(&chars, &SENTENCE_BREAK, start, end).filter(|position| *position > start + half)
        {
            end = position + 1;
        }

        let window: String = chars[start..end].iter().collect();
        let content = window.trim();
        if !content.is_empty() {
            chunks.push(TextChunk {
                index: chunks.len(),
                content: content.to_string(),
                start,
                end,
            });
        }

        if is_final {
            break;
        }

        let next = end.saturating_sub(config.overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

fn rfind(chars: &[char], pattern: &[char], start: usize, end: usize) -> Option<usize> {
    if end < start + pattern.len() {
        return None;
    }
    (start..=end - pattern.len())
        .rev()
        .find(|&position| chars[position..position + pattern.len()] == *pattern)
}

#[cfg(test)]
mod tests {
    use super::{chunk_text, ChunkingConfig};

    fn config(chunk_size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig::new(chunk_size, overlap).expect("valid config")
    }

    fn sentences(count: usize) -> String {
        (0..count)
            .map(|n| format!("Cell fact {n:03} is noted. "))
            .collect::<String>()
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("Short note.", config(500, 50));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Short note.");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 11));
    }

    #[test]
    fn blank_text_yields_nothing() {
        assert!(chunk_text("", config(500, 50)).is_empty());
        assert!(chunk_text("   \n\n  ", config(500, 50)).is_empty());
    }

    #[test]
    fn text_without_breaks_is_hard_cut() {
        let text = "a".repeat(1_200);
        let chunks = chunk_text(&text, config(500, 50));
        let windows: Vec<_> = chunks.iter().map(|chunk| (chunk.start, chunk.end)).collect();
        assert_eq!(windows, vec![(0, 500), (450, 950), (900, 1_200)]);
    }

    #[test]
    fn paragraph_break_past_midpoint_ends_the_window() {
        let text = format!("{}\n\n{}", "A".repeat(300), "B".repeat(400));
        let chunks = chunk_text(&text, config(500, 50));
        assert_eq!(chunks[0].content, "A".repeat(300));
        assert_eq!(chunks[0].end, 300);
        assert_eq!(chunks[1].start, 250);
    }

    #[test]
    fn paragraph_break_before_midpoint_is_ignored() {
        let text = format!("{}\n\n{}", "A".repeat(100), "B".repeat(900));
        let chunks = chunk_text(&text, config(500, 50));
        assert_eq!(chunks[0].end, 500);
    }

    #[test]
    fn sentence_break_keeps_the_period() {
        let text = sentences(60);
        let chunks = chunk_text(&text, config(500, 50));
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.content.ends_with('.'), "{:?}", chunk.content);
        }
    }

    #[test]
    fn long_page_produces_overlapping_windows() {
        let text = sentences(50);
        assert_eq!(text.chars().count(), 1_200);

        let chunks = chunk_text(&text, config(500, 50));
        assert!(chunks.len() >= 3);
        assert!(chunks[1].start < chunks[0].end);
        for chunk in &chunks {
            assert!(chunk.content.chars().count() <= 500);
        }
    }

    #[test]
    fn large_overlap_still_makes_progress() {
        let text = "x".repeat(100);
        let chunks = chunk_text(&text, config(10, 9));
        assert_eq!(chunks.last().map(|chunk| chunk.end), Some(100));
        assert!(chunks.windows(2).all(|pair| pair[1].start > pair[0].start));

        let snapped = format!("{}\n\n{}", "y".repeat(7), "z".repeat(40));
        let chunks = chunk_text(&snapped, config(10, 9));
        assert!(chunks.windows(2).all(|pair| pair[1].start > pair[0].start));
    }

    #[test]
    fn windows_cover_all_non_whitespace_content() {
        let text = format!(
            "{}\n\n{}\n\n   \n\n{}",
            sentences(17),
            "word ".repeat(130),
            sentences(9)
        );
        let chars: Vec<char> = text.chars().collect();
        let chunks = chunk_text(&text, config(200, 30));

        let mut covered = String::new();
        let mut previous_end = 0;
        for chunk in &chunks {
            let from = chunk.start.max(previous_end);
            if from < chunk.end {
                covered.extend(&chars[from..chunk.end]);
            }
            previous_end = previous_end.max(chunk.end);
        }

        let strip = |value: &str| value.chars().filter(|ch| !ch.is_whitespace()).collect::<String>();
        assert_eq!(strip(&covered), strip(&text));
    }

    #[test]
    fn chunk_indices_are_contiguous() {
        let chunks = chunk_text(&sentences(80), config(300, 40));
        for (position, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, position);
        }
    }

    #[test]
    fn counts_characters_not_bytes() {
        let text = "é".repeat(30);
        let chunks = chunk_text(&text, config(10, 2));
        assert!(chunks.iter().all(|chunk| chunk.content.chars().count() <= 10));
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(ChunkingConfig::new(100, 100).is_err());
        assert!(ChunkingConfig::new(0, 0).is_err());
        assert!(ChunkingConfig::new(100, 99).is_ok());
    }
}
