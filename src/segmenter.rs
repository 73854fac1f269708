//! Incremental text segmenter: turns a lazy stream of character deltas
//! into a lazy sequence of UTF-8 segments, for low-TTFB LLM->TTS
//! chaining.
//!
//! Accumulate into a bounded look-ahead buffer, commit a boundary only
//! once enough trailing context has arrived to rule out an abbreviation,
//! decimal, URL, or quoted span.

use thiserror::Error;

use crate::config::{SegmenterConfig, SegmenterMode};

#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("invalid segmenter configuration: {0}")]
    Config(String),
}

const ABBREVIATIONS: &[&str] = &[
    "mr.", "mrs.", "ms.", "dr.", "prof.", "sr.", "jr.", "vs.", "etc.", "i.e.", "e.g.", "u.s.", "u.k.", "ph.d.",
    "m.d.", "b.a.", "m.a.", "d.d.s.", "a.m.", "p.m.",
];

const KNOWN_TLDS: &[&str] = &["com", "org", "net", "edu", "gov", "io", "ai", "cn", "uk", "ru", "de", "jp", "fr"];

const SENTENCE_BOUNDARIES: &[char] = &['.', '!', '?', '。', '！', '？'];
const PHRASE_EXTRA_BOUNDARIES: &[char] = &[',', ';', ':', '，', '；', '：'];

pub struct TextSegmenter {
    config: SegmenterConfig,
    buffer: Vec<char>,
    emitted_any: bool,
}

impl TextSegmenter {
    pub fn new(config: SegmenterConfig) -> Result<Self, SegmenterError> {
        config.validate().map_err(|e| SegmenterError::Config(e.message))?;
        Ok(Self {
            config,
            buffer: Vec::new(),
            emitted_any: false,
        })
    }

    fn current_mode(&self) -> SegmenterMode {
        match self.config.mode {
            SegmenterMode::Hybrid => {
                if self.emitted_any {
                    SegmenterMode::Sentence
                } else {
                    SegmenterMode::Phrase
                }
            }
            other => other,
        }
    }

    fn is_boundary_char(&self, c: char) -> bool {
        if SENTENCE_BOUNDARIES.contains(&c) {
            return true;
        }
        matches!(self.current_mode(), SegmenterMode::Phrase) && PHRASE_EXTRA_BOUNDARIES.contains(&c)
    }

    /// Feed the next chunk of text (as small as one character). Returns
    /// whatever segments this feed made resolvable.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.buffer.extend(text.chars());
        self.drain_ready(false)
    }

    /// Flush forces a decision on any pending boundary candidate using
    /// whatever context is available, then returns all remaining text as
    /// a final segment.
    pub fn flush(&mut self) -> Vec<String> {
        let mut out = self.drain_ready(true);
        if !self.buffer.is_empty() {
            let remaining: String = self.buffer.drain(..).collect();
            out.push(remaining);
        }
        out
    }

    fn drain_ready(&mut self, flushing: bool) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            if self.force_max_length_emission(&mut out) {
                continue;
            }

            let boundary = self.find_resolvable_boundary(flushing);
            let Some(pos) = boundary else { break };

            let mut end = pos;
            if end + 1 < self.buffer.len() && matches!(self.buffer[end + 1], '"' | '\u{201D}' | '\'') {
                end += 1;
            }
            let segment: String = self.buffer.drain(..=end).collect();
            let trimmed = segment.trim().to_string();

            if trimmed.chars().count() < self.config.min_segment_len && !flushing {
                // Too short to stand alone: put it back and wait for more
                // text to coalesce with.
                let mut combined: Vec<char> = segment.chars().collect();
                combined.extend(self.buffer.drain(..));
                self.buffer = combined;
                break;
            }
            if !trimmed.is_empty() {
                out.push(trimmed);
                self.emitted_any = true;
            }
        }
        out
    }

    fn force_max_length_emission(&mut self, out: &mut Vec<String>) -> bool {
        if self.buffer.len() <= self.config.max_segment_len {
            return false;
        }
        let window = &self.buffer[..self.config.max_segment_len];
        let cut = window.iter().rposition(|c| c.is_whitespace());
        let seg: String = match cut {
            Some(ws_pos) => self.buffer.drain(..=ws_pos).collect(),
            None => self.buffer.drain(..self.config.max_segment_len).collect(),
        };
        let trimmed = seg.trim().to_string();
        if !trimmed.is_empty() {
            out.push(trimmed);
            self.emitted_any = true;
        }
        true
    }

    fn find_resolvable_boundary(&self, flushing: bool) -> Option<usize> {
        for (i, &c) in self.buffer.iter().enumerate() {
            if !self.is_boundary_char(c) {
                continue;
            }
            let trailing = self.buffer.len() - i - 1;
            if !flushing && trailing < self.config.look_ahead {
                // Not enough trailing context yet to rule out an
                // abbreviation/decimal/URL at this or any later position.
                return None;
            }
            if self.is_suppressed(i) {
                continue;
            }
            return Some(i);
        }
        None
    }

    fn is_suppressed(&self, pos: usize) -> bool {
        self.in_quotes(pos) || self.is_abbreviation_dot(pos) || self.is_decimal_point(pos) || self.is_thousands_comma(pos) || self.is_inside_url(pos)
    }

    /// Odd number of quote marks before `pos` means we're inside a
    /// quoted span, where boundaries are ignored.
    fn in_quotes(&self, pos: usize) -> bool {
        let count = self.buffer[..pos]
            .iter()
            .filter(|&&c| c == '"' || c == '\u{201C}' || c == '\u{201D}')
            .count();
        count % 2 == 1
    }

    fn is_abbreviation_dot(&self, pos: usize) -> bool {
        if self.buffer[pos] != '.' {
            return false;
        }
        for abbr in ABBREVIATIONS {
            let abbr_chars: Vec<char> = abbr.chars().collect();
            if pos + 1 < abbr_chars.len() {
                continue;
            }
            let start = pos + 1 - abbr_chars.len();
            let window: String = self.buffer[start..=pos].iter().collect::<String>().to_lowercase();
            if window == *abbr {
                return true;
            }
        }
        self.is_uppercase_dotted_acronym(pos)
    }

    /// Any all-uppercase-letters-plus-dots sequence, e.g. `U.S.A.`
    fn is_uppercase_dotted_acronym(&self, pos: usize) -> bool {
        if self.buffer[pos] != '.' {
            return false;
        }
        let mut i = pos;
        let mut letter_dot_pairs = 0;
        loop {
            if i == 0 {
                break;
            }
            let letter = self.buffer[i - 1];
            if !letter.is_ascii_uppercase() {
                break;
            }
            letter_dot_pairs += 1;
            // The run continues only while a dot immediately precedes this
            // letter; hitting anything else (a space, start of buffer) ends
            // the acronym at a word boundary.
            if i < 2 || self.buffer[i - 2] != '.' {
                break;
            }
            i -= 2;
        }
        letter_dot_pairs >= 2
    }

    fn is_decimal_point(&self, pos: usize) -> bool {
        if self.buffer[pos] != '.' {
            return false;
        }
        let before = pos.checked_sub(1).map(|i| self.buffer[i]);
        let after = self.buffer.get(pos + 1).copied();
        matches!(before, Some(c) if c.is_ascii_digit()) && matches!(after, Some(c) if c.is_ascii_digit())
    }

    fn is_thousands_comma(&self, pos: usize) -> bool {
        if self.buffer[pos] != ',' {
            return false;
        }
        let before = pos.checked_sub(1).map(|i| self.buffer[i]);
        let after = self.buffer.get(pos + 1).copied();
        matches!(before, Some(c) if c.is_ascii_digit()) && matches!(after, Some(c) if c.is_ascii_digit())
    }

    /// Heuristic URL detection: a scheme prefix or `www.` before `pos`,
    /// continuing without whitespace through a known TLD.
    fn is_inside_url(&self, pos: usize) -> bool {
        let word_start = self.buffer[..pos]
            .iter()
            .rposition(|c| c.is_whitespace())
            .map(|i| i + 1)
            .unwrap_or(0);
        let word_end = self.buffer[pos..]
            .iter()
            .position(|c| c.is_whitespace())
            .map(|i| pos + i)
            .unwrap_or(self.buffer.len());
        let word: String = self.buffer[word_start..word_end].iter().collect::<String>().to_lowercase();

        let looks_like_url = word.starts_with("http://") || word.starts_with("https://") || word.starts_with("ftp://") || word.starts_with("www.");
        if !looks_like_url {
            return false;
        }
        KNOWN_TLDS.iter().any(|tld| word.contains(&format!(".{tld}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmenterMode;

    fn feed_one_char_at_a_time(segmenter: &mut TextSegmenter, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for c in text.chars() {
            out.extend(segmenter.feed(&c.to_string()));
        }
        out.extend(segmenter.flush());
        out
    }

    #[test]
    fn s2_abbreviation_does_not_split() {
        let cfg = SegmenterConfig { mode: SegmenterMode::Sentence, ..SegmenterConfig::default() };
        let mut seg = TextSegmenter::new(cfg).unwrap();
        let out = feed_one_char_at_a_time(&mut seg, "Dr. Smith went to the U.S. yesterday. He returned.");
        assert_eq!(out, vec!["Dr. Smith went to the U.S. yesterday.".to_string(), "He returned.".to_string()]);
    }

    #[test]
    fn s3_decimals_do_not_split() {
        let cfg = SegmenterConfig { mode: SegmenterMode::Sentence, ..SegmenterConfig::default() };
        let mut seg = TextSegmenter::new(cfg).unwrap();
        let out = feed_one_char_at_a_time(&mut seg, "Pi is 3.14 and e is 2.71. Done.");
        assert_eq!(out, vec!["Pi is 3.14 and e is 2.71.".to_string(), "Done.".to_string()]);
    }

    #[test]
    fn s4_hybrid_splits_phrase_first_then_sentence() {
        let cfg = SegmenterConfig { mode: SegmenterMode::Hybrid, min_segment_len: 1, ..SegmenterConfig::default() };
        let mut seg = TextSegmenter::new(cfg).unwrap();
        let out = feed_one_char_at_a_time(&mut seg, "First, we start. Then, we continue.");
        assert_eq!(out[0], "First,");
        assert_eq!(out[1], "we start.");
        assert_eq!(out[2], "Then, we continue.");
    }

    #[test]
    fn content_preservation_modulo_whitespace() {
        let cfg = SegmenterConfig { mode: SegmenterMode::Sentence, ..SegmenterConfig::default() };
        let mut seg = TextSegmenter::new(cfg).unwrap();
        let input = "Dr. Smith went to the U.S. yesterday. He returned home again.";
        let out = feed_one_char_at_a_time(&mut seg, input);
        let joined: String = out.join(" ");
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&joined), normalize(input));
    }
}
