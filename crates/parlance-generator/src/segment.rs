//! Sentence boundary detection over streamed tokens.
//!
//! Policy: a sentence ends at `.`, `!`, `?` or `…` (plus any immediately
//! following closing quotes/brackets) when the next character is
//! whitespace. A `.` is not a boundary when the word before it is a known
//! abbreviation or a single letter (initials). Decimal numbers never
//! trigger because the character after their `.` is a digit, not
//! whitespace. A completed sentence keeps one trailing space so that
//! concatenating all sentences reproduces the full message text.

const TERMINALS: [char; 4] = ['.', '!', '?', '…'];
const CLOSERS: [char; 6] = ['"', '\'', '”', '’', ')', ']'];

const ABBREVIATIONS: [&str; 13] = [
    "mr", "mrs", "ms", "dr", "prof", "st", "vs", "etc", "e.g", "i.e", "jr", "sr", "no",
];

/// Incremental segmenter. Feed token deltas with [`push`](Self::push);
/// call [`flush`](Self::flush) at end of stream for the final sentence.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buf: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append streamed text, returning any sentences completed by it.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut out = Vec::new();

        loop {
            match self.scan() {
                Some((cut, resume)) => {
                    let mut sentence = self.buf[..cut].trim_start().to_string();
                    sentence.push(' ');
                    out.push(sentence);
                    self.buf.drain(..resume);
                }
                None => break,
            }
        }
        out
    }

    /// End of stream: the trimmed remainder, if any.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.trim().is_empty()
    }

    /// Find the first boundary: returns (byte end of the sentence,
    /// byte start of the next one). A boundary only materialises once the
    /// first character of the *next* sentence has arrived.
    fn scan(&self) -> Option<(usize, usize)> {
        let chars: Vec<(usize, char)> = self.buf.char_indices().collect();
        let mut i = 0;
        while i < chars.len() {
            let (_, ch) = chars[i];
            if TERMINALS.contains(&ch) {
                if ch == '.' && self.is_guarded_period(&chars, i) {
                    i += 1;
                    continue;
                }
                // Attach any closing quotes/brackets to the sentence.
                let mut end = i + 1;
                while end < chars.len() && CLOSERS.contains(&chars[end].1) {
                    end += 1;
                }
                // Need whitespace after the boundary…
                if end < chars.len() && chars[end].1.is_whitespace() {
                    // …and the first character of the next sentence, so the
                    // trailing-space normalization has something to attach to.
                    let mut next = end;
                    while next < chars.len() && chars[next].1.is_whitespace() {
                        next += 1;
                    }
                    if next < chars.len() {
                        let cut = byte_at(&chars, end, self.buf.len());
                        let resume = byte_at(&chars, next, self.buf.len());
                        return Some((cut, resume));
                    }
                }
            }
            i += 1;
        }
        None
    }

    /// Abbreviation / initial guard for a period at `chars[i]`.
    fn is_guarded_period(&self, chars: &[(usize, char)], i: usize) -> bool {
        // Collect the word immediately before the period (letters, digits
        // and interior periods, as in "e.g").
        let mut start = i;
        while start > 0 {
            let prev = chars[start - 1].1;
            if prev.is_alphanumeric() || prev == '.' {
                start -= 1;
            } else {
                break;
            }
        }
        if start == i {
            return false; // no word before — e.g. "…." runs
        }
        let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
        let word = word.trim_matches('.').to_lowercase();
        if word.is_empty() {
            return false;
        }
        if word.len() == 1 && word.chars().all(|c| c.is_alphabetic()) {
            return true; // single-letter initial, "J. Smith"
        }
        ABBREVIATIONS.contains(&word.as_str())
    }
}

fn byte_at(chars: &[(usize, char)], idx: usize, buf_len: usize) -> usize {
    chars.get(idx).map(|(b, _)| *b).unwrap_or(buf_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(stream: &[&str]) -> Vec<String> {
        let mut seg = SentenceSegmenter::new();
        let mut out = Vec::new();
        for token in stream {
            out.extend(seg.push(token));
        }
        out.extend(seg.flush());
        out
    }

    #[test]
    fn splits_on_terminal_punctuation() {
        let sentences = collect(&["The capital of France is Paris. It is in the north."]);
        assert_eq!(
            sentences,
            vec![
                "The capital of France is Paris. ".to_string(),
                "It is in the north.".to_string(),
            ]
        );
    }

    #[test]
    fn boundary_can_straddle_token_edges() {
        let sentences = collect(&["One sentence", ".", " And", " another!", " Third?"]);
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0], "One sentence. ");
        assert_eq!(sentences[1], "And another! ");
        assert_eq!(sentences[2], "Third?");
    }

    #[test]
    fn abbreviations_do_not_split() {
        let sentences = collect(&["Dr. Smith lives on St. Mark street. He is in."]);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "Dr. Smith lives on St. Mark street. ");
    }

    #[test]
    fn initials_do_not_split() {
        let sentences = collect(&["J. R. Tolkien wrote it. Yes."]);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "J. R. Tolkien wrote it. ");
    }

    #[test]
    fn decimals_do_not_split() {
        let sentences = collect(&["Pi is 3.14 roughly. Indeed."]);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "Pi is 3.14 roughly. ");
    }

    #[test]
    fn closing_quote_attaches_to_sentence() {
        let sentences = collect(&["She said \"stop.\" Then left."]);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "She said \"stop.\" ");
    }

    #[test]
    fn concatenation_reproduces_text_modulo_whitespace_runs() {
        let input = "First.  Second!   Third.";
        let sentences = collect(&[input]);
        let joined: String = sentences.concat();
        assert_eq!(joined, "First. Second! Third.");
    }

    #[test]
    fn flush_returns_unterminated_tail() {
        let mut seg = SentenceSegmenter::new();
        assert!(seg.push("no punctuation here").is_empty());
        assert_eq!(seg.flush().unwrap(), "no punctuation here");
        assert!(seg.flush().is_none());
    }

    #[test]
    fn ellipsis_is_a_boundary() {
        let sentences = collect(&["Well… maybe. Sure."]);
        assert_eq!(sentences[0], "Well… ");
    }
}
