/// Drops NUL, replacement and non-whitespace control characters, collapses
/// whitespace runs to a single space and trims. Idempotent.
pub fn clean_text(text: &str) -> String {
    text.split(|ch: char| ch.is_whitespace())
        .map(|token| {
            token
                .chars()
                .filter(|ch| !is_stripped(*ch))
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_stripped(ch: char) -> bool {
    ch == '\0' || ch == char::REPLACEMENT_CHARACTER || (ch.is_control() && !ch.is_whitespace())
}

/// Decodes bytes as UTF-8, skipping invalid sequences instead of substituting them.
pub fn decode_utf8_lossless(bytes: &[u8]) -> String {
    let mut decoded = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        decoded.push_str(chunk.valid());
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::{clean_text, decode_utf8_lossless};

    #[test]
    fn collapses_whitespace_and_trims() {
        assert_eq!(
            clean_text("  Mitosis\n\n has\tfour \u{a0} phases.  "),
            "Mitosis has four phases."
        );
    }

    #[test]
    fn removes_nul_and_control_bytes() {
        let cleaned = clean_text("cell\0 wall\u{7} \u{fffd}membrane");
        assert_eq!(cleaned, "cell wall membrane");
        assert!(!cleaned.contains('\0'));
    }

    #[test]
    fn stripped_characters_do_not_leave_double_spaces() {
        assert_eq!(clean_text("a \0 b"), "a b");
        assert_eq!(clean_text("\0\0"), "");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let samples = [
            "",
            "   ",
            "plain",
            "x\0y \r\n\r\n z",
            "  Chapter 1.\n\nThe cell \u{2003}is the unit\u{1b}[0m of life.  ",
        ];
        for sample in samples {
            let once = clean_text(sample);
            assert_eq!(clean_text(&once), once, "sample {sample:?}");
        }
    }

    #[test]
    fn invalid_utf8_bytes_are_dropped() {
        let bytes = b"photo\xffsynthesis \xc3\xa9t\xc3";
        assert_eq!(decode_utf8_lossless(bytes), "photosynthesis \u{e9}t");
    }
}
