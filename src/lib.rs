//! splice-tts - 単語クリップをつなぎ合わせる音声合成
//!
//! プロファイル毎に録音した単語の音声を、入力テキストの順に並べて
//! 自然に聞こえる1つの波形へ合成するライブラリです。
//!
//! # 主な機能
//!
//! - **フォーマット正規化**: WAV / FLAC / OGG / MP3 などを検証し、モノラル16bit PCM WAV に統一
//! - **無音カット**: フレームエネルギーによる区間検出と 2ms 単位の境界補正
//! - **ノイズ除去・音声強調**: 失敗しても入力をそのまま返す控えめな後処理
//! - **継ぎ目処理**: 相互相関による位置合わせ、音量差の補正、ハニング窓クロスフェード
//! - **語彙管理**: 単語の登録・一覧・削除と、カタログ全体の一括修復
//!
//! # アーキテクチャ
//!
//! ```text
//! [text] → [Tokenizer] → [ClipCatalog] ──→ [AudioNormalizer]
//!                                                 ↓
//!                                        [SilenceTrimmer]
//!                                                 ↓
//!                                 [SpectralDenoiser / VoiceEnhancer]
//!                                                 ↓
//!                               [TransitionSplicer] (左から順に畳み込み)
//!                                                 ↓
//!                                  [global fade] → [WAV File]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use splice_tts::assembler::SentenceAssembler;
//! use splice_tts::catalog::DirectoryCatalog;
//! use splice_tts::config::Config;
//!
//! let config = Config::load_or_default("config.toml").unwrap();
//! let catalog = DirectoryCatalog::new(&config.catalog.root_dir);
//! let assembler = SentenceAssembler::new(catalog, &config);
//!
//! let output = assembler.synthesize("1", "Xin chào, bạn!").unwrap();
//! println!("{}", output.path.display());
//! ```

pub mod assembler;
pub mod catalog;
pub mod config;
pub mod denoiser;
pub mod dsp;
pub mod error;
pub mod normalizer;
pub mod splicer;
pub mod tokenizer;
pub mod trimmer;
pub mod types;
