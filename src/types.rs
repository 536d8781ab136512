use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// モノラル音声バッファ
///
/// 浮動小数点サンプルとサンプリングレートの組。
/// 正規化後のサンプルは -1.0 ~ 1.0 の範囲に収まるが、
/// 最終クリッピング前は一時的に範囲外になることがある。
///
/// # Examples
///
/// ```
/// # use splice_tts::types::AudioBuffer;
/// let buffer = AudioBuffer::new(vec![0.0; 1600], 16000);
/// assert_eq!(buffer.len(), 1600);
/// assert!((buffer.duration_seconds() - 0.1).abs() < 1e-9);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    /// サンプル列 (モノラル)
    pub samples: Vec<f32>,

    /// サンプリングレート (Hz)
    ///
    /// バッファ全体で一定
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// 指定時間の無音バッファを作成
    pub fn silence(duration_ms: f64, sample_rate: u32) -> Self {
        let len = ms_to_samples(duration_ms, sample_rate);
        Self::new(vec![0.0; len], sample_rate)
    }

    /// サンプル数
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 長さ（秒）
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// 長さ（ミリ秒）
    pub fn duration_ms(&self) -> f64 {
        self.duration_seconds() * 1000.0
    }

    /// ミリ秒をこのバッファのサンプル数に換算
    pub fn ms_to_samples(&self, ms: f64) -> usize {
        ms_to_samples(ms, self.sample_rate)
    }

    /// 最大絶対振幅
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, &s| m.max(s.abs()))
    }
}

/// ミリ秒をサンプル数に換算（切り捨て）
pub fn ms_to_samples(ms: f64, sample_rate: u32) -> usize {
    if ms <= 0.0 {
        return 0;
    }
    (ms * sample_rate as f64 / 1000.0) as usize
}

/// フェードの形状
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FadeShape {
    /// 直線
    Linear,

    /// ハニング窓の半分
    Hann,
}

/// トークンの分類
///
/// クロスフェードの方針を決めるためのフラグ集合。
/// 各フラグは排他ではない（短い接続詞もありうる）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenClass {
    /// 句読点
    pub punctuation: bool,

    /// 短い単語（文字数が少ない、または 200ms 未満）
    pub short: bool,

    /// 接続詞・機能語
    pub conjunction: bool,

    /// 文中の最後のトークン
    pub last: bool,
}

impl TokenClass {
    /// 通常の単語かどうか
    pub fn is_ordinary(&self) -> bool {
        !self.punctuation && !self.short && !self.conjunction
    }
}

/// 結合待ちの1トークン分の音声
#[derive(Clone, Debug)]
pub struct SpliceItem {
    /// 元のトークン文字列
    pub token: String,

    /// 前処理済みの音声。録音のない句読点は `None`
    pub audio: Option<AudioBuffer>,

    /// トークン分類
    pub class: TokenClass,
}

/// 1回の合成リクエストで結合する音声列
///
/// トークン順に並び、左から順に畳み込まれて破棄される。
#[derive(Clone, Debug)]
pub struct SpliceJob {
    /// 結合に使うサンプリングレート（最初のクリップのレート）
    pub sample_rate: u32,

    /// トークン順の音声
    pub items: Vec<SpliceItem>,
}

/// 語彙カタログ中の1クリップ
///
/// (プロファイル, 正規化済み単語) → 音声ファイルのパス。
/// ライフサイクルはカタログ側が管理する。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClipRecord {
    pub profile_id: String,
    pub word: String,
    pub path: PathBuf,
}

/// 合成結果
///
/// 標準出力に JSON として出力される。
///
/// # JSON出力例
///
/// ```json
/// {
///   "path": "./audio_uploads/temp/tts_1_20250102_143015_0.wav",
///   "profile_id": "1",
///   "tokens": ["xin", "chào"],
///   "sample_rate": 16000,
///   "num_samples": 8000,
///   "duration_seconds": 0.5,
///   "created_at": "2025-01-02T14:30:15+09:00"
/// }
/// ```
#[derive(Clone, Debug, Serialize)]
pub struct SynthesisOutput {
    /// 書き出したWAVファイル
    pub path: PathBuf,

    pub profile_id: String,

    /// トークン化後のトークン列
    pub tokens: Vec<String>,

    pub sample_rate: u32,

    pub num_samples: usize,

    pub duration_seconds: f64,

    /// ISO 8601形式の作成時刻
    pub created_at: String,
}

impl SynthesisOutput {
    pub fn new(path: PathBuf, profile_id: &str, tokens: Vec<String>, audio: &AudioBuffer) -> Self {
        Self {
            path,
            profile_id: profile_id.to_string(),
            tokens,
            sample_rate: audio.sample_rate,
            num_samples: audio.len(),
            duration_seconds: audio.duration_seconds(),
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_buffer() {
        let buffer = AudioBuffer::silence(10.0, 16000);
        assert_eq!(buffer.len(), 160);
        assert!(buffer.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_duration_and_peak() {
        let buffer = AudioBuffer::new(vec![0.1, -0.5, 0.25, 0.0], 4);
        assert_eq!(buffer.duration_ms(), 1000.0);
        assert_eq!(buffer.peak(), 0.5);
        assert_eq!(buffer.ms_to_samples(500.0), 2);
    }

    #[test]
    fn test_token_class_ordinary() {
        assert!(TokenClass::default().is_ordinary());
        let class = TokenClass {
            short: true,
            conjunction: true,
            ..Default::default()
        };
        assert!(!class.is_ordinary());
    }

    #[test]
    fn test_fade_shape_serialization() {
        let json = serde_json::to_string(&FadeShape::Hann).unwrap();
        assert_eq!(json, r#""hann""#);
        let parsed: FadeShape = serde_json::from_str(r#""linear""#).unwrap();
        assert_eq!(parsed, FadeShape::Linear);
    }

    #[test]
    fn test_synthesis_output_json() {
        let audio = AudioBuffer::new(vec![0.0; 8000], 16000);
        let output = SynthesisOutput::new(
            PathBuf::from("/tmp/out.wav"),
            "7",
            vec!["xin".to_string(), "chào".to_string()],
            &audio,
        );
        let json = serde_json::to_string(&output).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["profile_id"], "7");
        assert_eq!(parsed["num_samples"], 8000);
        assert_eq!(parsed["duration_seconds"], 0.5);
        assert_eq!(parsed["tokens"][1], "chào");
    }
}
