use std::io;
use thiserror::Error;

/// 音声合成パイプラインのエラー
///
/// クリップ単位で回復できる問題（フォーマット・無音）はその場で
/// 修正またはパススルーされる。ここに現れるのは呼び出し側が判断すべき
/// ものだけで、部分的な出力ファイルは決して返さない。
#[derive(Error, Debug)]
pub enum SpliceError {
    /// 3種類のデコード手段すべてで読めなかった（再アップロードが必要）
    #[error("音声ファイルを読み込めません: {source_desc} ({})", .chain.join(" | "))]
    UnreadableAudio {
        /// 対象の説明（ファイルパスなど）
        source_desc: String,
        /// 各デコード手段のエラー（試行順）
        chain: Vec<String>,
    },

    /// 空ファイル、または構造的に不正な入力
    #[error("空または破損した音声ファイル: {0}")]
    EmptyOrCorruptFile(String),

    /// 録音されていない単語がある
    #[error("次の単語は語彙に登録されていません: {}", .0.join(", "))]
    MissingVocabulary(Vec<String>),

    /// 無音区間しか検出されなかった（ソフトエラー）
    #[error("無音以外の区間が検出されませんでした")]
    SilenceDetectionFailed,

    /// ノイズ除去・音声強調が内部で失敗した（ログのみ、呼び出し側には出ない）
    #[error("音声処理をスキップしました: {0}")]
    ProcessingDegraded(String),

    /// クロスフェード・結合中の予期しない失敗
    #[error("音声の結合に失敗: {0}")]
    AssemblyFailed(String),

    #[error("I/Oエラー: {0}")]
    Io(#[from] io::Error),
}

impl SpliceError {
    /// 再試行で解決する可能性があるか
    ///
    /// 内容起因のエラーは再試行しても結果が変わらない。
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpliceError::Io(_))
    }
}

/// パイプライン内部の Result 型
pub type Result<T> = std::result::Result<T, SpliceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_vocabulary_message_lists_words() {
        let err = SpliceError::MissingVocabulary(vec!["xin".to_string(), "chào".to_string()]);
        let msg = err.to_string();
        assert!(msg.contains("xin, chào"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unreadable_audio_includes_chain() {
        let err = SpliceError::UnreadableAudio {
            source_desc: "a.wav".to_string(),
            chain: vec!["hound: bad header".to_string(), "ffmpeg: not found".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a.wav"));
        assert!(msg.contains("hound: bad header | ffmpeg: not found"));
    }

    #[test]
    fn test_io_is_retryable() {
        let err: SpliceError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(err.is_retryable());
    }
}
