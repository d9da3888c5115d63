//! Text utilities: encoding-aware reads, normalisation, sentence boundaries.
//!
//! Offsets returned by functions in this module are byte offsets into the
//! original string, always landing on UTF-8 character boundaries.

use chardetng::EncodingDetector;
use std::path::Path;

use crate::types::Result;

pub mod fuzzy;

/// Sentence-ending punctuation recognised across Chinese and ASCII text.
const SENTENCE_ENDS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// Read a text file, detecting its encoding and stripping any BOM.
pub fn read_text_file(path: impl AsRef<Path>) -> Result<String> {
    let raw = std::fs::read(path.as_ref())?;

    let mut detector = EncodingDetector::new();
    detector.feed(&raw, true);
    let encoding = detector.guess(None, true);

    let (decoded, _, _) = encoding.decode(&raw);
    let mut content = decoded.into_owned();
    if let Some(stripped) = content.strip_prefix('\u{feff}') {
        content = stripped.to_string();
    }
    Ok(content)
}

/// Normalise full-width punctuation to half-width equivalents.
pub fn normalize_punctuation(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '，' => ',',
            '。' => '.',
            '！' => '!',
            '？' => '?',
            '；' => ';',
            '：' => ':',
            '“' | '”' => '"',
            '‘' | '’' => '\'',
            '（' => '(',
            '）' => ')',
            '【' => '[',
            '】' => ']',
            other => other,
        })
        .collect()
}

/// Collapse runs of three or more newlines and trim the ends.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newline_run = 0usize;
    for c in text.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
        } else {
            newline_run = 0;
            out.push(c);
        }
    }
    out.trim().to_string()
}

/// Find the position just past the nearest sentence-ending punctuation at or
/// after `start`. Returns `start` when no terminator exists.
pub fn find_sentence_end(text: &str, start: usize) -> usize {
    if start >= text.len() {
        return start;
    }
    for (idx, c) in text[start..].char_indices() {
        if SENTENCE_ENDS.contains(&c) {
            return start + idx + c.len_utf8();
        }
    }
    start
}

/// Single-line excerpt bounded to `limit` characters, `...`-terminated.
pub fn shorten_text(text: &str, limit: usize) -> String {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = compact.chars().collect();
    if chars.len() <= limit {
        return compact;
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = chars[..keep].iter().collect();
    out.push_str("...");
    out
}

/// Count CJK ideographs in the text.
pub fn count_chinese_chars(text: &str) -> usize {
    text.chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count()
}

/// Extract start/end markers from a text block: the first and last
/// substantial lines (>= 15 chars), truncated to `marker_length` characters.
pub fn text_markers(text: &str, marker_length: usize) -> (String, String) {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let start = lines
        .iter()
        .find(|l| l.chars().count() >= 15)
        .map(|l| l.chars().take(marker_length).collect())
        .unwrap_or_default();

    let end = lines
        .iter()
        .rev()
        .find(|l| l.chars().count() >= 15)
        .map(|l| {
            let chars: Vec<char> = l.chars().collect();
            let from = chars.len().saturating_sub(marker_length);
            chars[from..].iter().collect()
        })
        .unwrap_or_default();

    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn clean_text_collapses_blank_runs() {
        assert_eq!(clean_text("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(clean_text("  x  "), "x");
    }

    #[test]
    fn normalize_punctuation_maps_fullwidth() {
        assert_eq!(normalize_punctuation("你好，世界。"), "你好,世界.");
        assert_eq!(normalize_punctuation("（测试）"), "(测试)");
    }

    #[test]
    fn sentence_end_lands_past_punctuation() {
        let text = "他说。然后走了";
        let pos = find_sentence_end(text, 0);
        assert_eq!(&text[pos..], "然后走了");
    }

    #[test]
    fn sentence_end_without_terminator_returns_start() {
        assert_eq!(find_sentence_end("no terminator here", 3), 3);
    }

    #[test]
    fn shorten_text_compacts_and_bounds() {
        assert_eq!(shorten_text("short  text", 40), "short text");
        let long: String = "汉".repeat(100);
        let out = shorten_text(&long, 10);
        assert_eq!(out.chars().count(), 10);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn markers_come_from_substantial_lines(){
        let text = "短行\n这是一段足够长的开头文本可以当作起始标记使用\n中间\n这是一段足够长的结尾文本可以当作结束标记使用";
        let (start, end) = text_markers(text, 10);
        assert_eq!(start.chars().count(), 10);
        assert!(end.ends_with("使用"));
    }

    #[test]
    fn reads_utf8_file_and_strips_bom() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all("\u{feff}第一章 试读\n正文".as_bytes()).unwrap();
        let content = read_text_file(f.path()).unwrap();
        assert!(content.starts_with("第一章"));
    }

    #[test]
    fn reads_gbk_encoded_file() {
        let (encoded, _, _) = encoding_rs::GBK.encode("第一章 风起");
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&encoded).unwrap();
        let content = read_text_file(f.path()).unwrap();
        assert!(content.contains("风起"));
    }

    #[test]
    fn counts_chinese_chars() {
        assert_eq!(count_chinese_chars("abc中文de字"), 3);
    }
}
