use crate::config::{AssemblerConfig, SpliceConfig};
use crate::types::{AudioBuffer, TokenClass};
use regex_lite::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// 単独のトークンとして扱う句読点
pub const PUNCTUATION: [&str; 6] = [",", ".", "?", "!", ":", ";"];

fn punctuation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([,.?!:;])").expect("句読点パターンは固定"))
}

/// 句読点トークンかどうか
pub fn is_punctuation(token: &str) -> bool {
    PUNCTUATION.contains(&token)
}

/// テキストをトークン列に分割
///
/// 小文字化・前後の空白除去の後、句読点の前後に空白を入れて
/// 空白で分割する。
///
/// # Examples
///
/// ```
/// # use splice_tts::tokenizer::tokenize;
/// assert_eq!(tokenize("  Xin chào, bạn!"), vec!["xin", "chào", ",", "bạn", "!"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = text.trim().to_lowercase();
    punctuation_regex()
        .replace_all(&normalized, " $1 ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// トークン分類器
///
/// 句読点・短い単語・接続詞・文末をフラグとして付ける。
pub struct TokenClassifier {
    short_word_max_chars: usize,
    short_word_ms: f64,
    conjunctions: HashSet<String>,
}

impl TokenClassifier {
    pub fn new(assembler: &AssemblerConfig, splice: &SpliceConfig) -> Self {
        Self {
            short_word_max_chars: assembler.short_word_max_chars,
            short_word_ms: splice.short_word_ms,
            conjunctions: assembler
                .conjunctions
                .iter()
                .map(|w| w.trim().to_lowercase())
                .collect(),
        }
    }

    /// トークンを分類
    ///
    /// `audio` は前処理済みのクリップ（長さで短い単語を判定する）。
    pub fn classify(&self, token: &str, audio: Option<&AudioBuffer>, is_last: bool) -> TokenClass {
        let punctuation = is_punctuation(token);
        let short_text = token.chars().count() <= self.short_word_max_chars;
        let short_audio = audio.is_some_and(|a| a.duration_ms() < self.short_word_ms);

        TokenClass {
            punctuation,
            short: !punctuation && (short_text || short_audio),
            conjunction: self.conjunctions.contains(token),
            last: is_last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TokenClassifier {
        TokenClassifier::new(&AssemblerConfig::default(), &SpliceConfig::default())
    }

    #[test]
    fn test_tokenize_lowercases_and_splits_punctuation() {
        assert_eq!(
            tokenize("Hello , World."),
            vec!["hello", ",", "world", "."]
        );
        assert_eq!(tokenize("a;b:c?"), vec!["a", ";", "b", ":", "c", "?"]);
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \n\t ").is_empty());
    }

    #[test]
    fn test_tokenize_unicode_words() {
        assert_eq!(tokenize("TIẾNG Việt"), vec!["tiếng", "việt"]);
    }

    #[test]
    fn test_classify_punctuation() {
        let class = classifier().classify(",", None, false);
        assert!(class.punctuation);
        assert!(!class.short);
        assert!(!class.is_ordinary());
    }

    #[test]
    fn test_classify_short_word_by_chars_and_duration() {
        let c = classifier();
        assert!(c.classify("bé", None, false).short);
        assert!(!c.classify("chào", None, false).short);

        let short_clip = AudioBuffer::new(vec![0.0; 1600], 16000);
        assert!(c.classify("chào", Some(&short_clip), false).short);
        let long_clip = AudioBuffer::new(vec![0.0; 8000], 16000);
        assert!(!c.classify("chào", Some(&long_clip), false).short);
    }

    #[test]
    fn test_classify_conjunction_and_last() {
        let c = classifier();
        let class = c.classify("và", None, true);
        assert!(class.conjunction);
        assert!(class.short);
        assert!(class.last);
        assert!(c.classify("nhưng", None, false).conjunction);
        assert!(!c.classify("xin", None, false).conjunction);
    }
}
