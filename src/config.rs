use crate::types::FadeShape;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub trim: TrimConfig,
    #[serde(default = "TrimConfig::upload")]
    pub upload_trim: TrimConfig,
    #[serde(default)]
    pub denoise: DenoiseConfig,
    #[serde(default)]
    pub enhance: EnhanceConfig,
    #[serde(default)]
    pub splice: SpliceConfig,
    #[serde(default)]
    pub assembler: AssemblerConfig,
}

/// 語彙カタログ設定
///
/// # デフォルト値
///
/// - `root_dir`: "./audio_uploads/voice_profiles"
///
/// クリップは `<root_dir>/<profile_id>/<word>.wav` に置かれる。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

/// 出力設定
///
/// 合成結果のWAVファイル出力とログに関する設定。
///
/// # デフォルト値
///
/// - `output_dir`: "./audio_uploads/temp"
/// - `log_level`: "info"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// フォーマット正規化設定
///
/// # デフォルト値
///
/// - `transcoder`: "ffmpeg" (最終手段の外部変換ツール)
/// - `enable_transcoder`: true
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_transcoder")]
    pub transcoder: String,
    #[serde(default = "default_enabled")]
    pub enable_transcoder: bool,
}

/// 無音カット設定
///
/// `[trim]` はカタログのクリップを結合前に切り詰める厳しめの設定、
/// `[upload_trim]` は語彙登録時の緩めの設定（[`TrimConfig::upload`]）。
///
/// # デフォルト値 (`[trim]`)
///
/// - `top_db`: 33.0 dB（ピークからこれ以上小さいフレームは無音）
/// - `frame_length`: 2048 サンプル
/// - `hop_length`: 64 サンプル
/// - `pad_ms`: 12 ms
/// - `refine`: true（先頭・末尾 10% を 2ms 単位で再走査）
/// - `fade_ms`: 8 ms（直線フェード）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrimConfig {
    #[serde(default = "default_top_db")]
    pub top_db: f32,
    #[serde(default = "default_frame_length")]
    pub frame_length: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_pad_ms")]
    pub pad_ms: f64,
    #[serde(default = "default_enabled")]
    pub refine: bool,
    #[serde(default = "default_refine_region_ratio")]
    pub refine_region_ratio: f64,
    #[serde(default = "default_refine_frame_ms")]
    pub refine_frame_ms: f64,
    #[serde(default = "default_refine_threshold_ratio")]
    pub refine_threshold_ratio: f32,
    #[serde(default = "default_refine_tolerance_ms")]
    pub refine_tolerance_ms: f64,
    #[serde(default = "default_trim_fade_ms")]
    pub fade_ms: f64,
    #[serde(default = "default_fade_shape")]
    pub fade_shape: FadeShape,
    /// これより小さいRMS (dB) のクリップは `loudness_target_db` まで持ち上げる
    #[serde(default)]
    pub loudness_floor_db: Option<f32>,
    #[serde(default = "default_target_db")]
    pub loudness_target_db: f32,
    #[serde(default = "default_loudness_clip")]
    pub loudness_clip: f32,
}

/// ノイズ除去設定
///
/// # デフォルト値
///
/// - `reduction_factor`: 0.15（0.05未満はスキップ、上限 0.2）
/// - `noise_percentile`: 5（振幅dBの下位5%をノイズフロアとみなす）
/// - `mask_margin_db`: 3 dB
/// - `blend`: 0.3（元音声 70% / 処理後 30%）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DenoiseConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: f32,
    #[serde(default = "default_noise_percentile")]
    pub noise_percentile: f32,
    #[serde(default = "default_mask_margin_db")]
    pub mask_margin_db: f32,
    #[serde(default = "default_blend")]
    pub blend: f32,
    #[serde(default = "default_max_fft_size")]
    pub max_fft_size: usize,
    #[serde(default = "default_min_fft_size")]
    pub min_fft_size: usize,
}

/// 音声強調設定
///
/// 200–3500Hz の音声帯域を強調し、7kHz 以下の成分を残して再正規化する。
/// デフォルトでは無効。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnhanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_band_low_hz")]
    pub band_low_hz: f64,
    #[serde(default = "default_band_high_hz")]
    pub band_high_hz: f64,
    #[serde(default = "default_band_gain")]
    pub band_gain: f32,
    #[serde(default = "default_lowpass_hz")]
    pub lowpass_hz: f64,
    #[serde(default = "default_residual_gain")]
    pub residual_gain: f32,
    #[serde(default = "default_filter_order")]
    pub filter_order: usize,
    #[serde(default = "default_target_db")]
    pub target_db: f32,
}

/// クロスフェード結合設定
///
/// # デフォルト値
///
/// - `crossfade_ms`: 50 ms（通常の単語）
/// - `short_crossfade_ms`: 30 ms（短い単語・接続詞）
/// - `short_word_ms`: 200 ms 未満の後続クリップは
///   `short_word_max_crossfade_ms` (20ms) に制限し 15% 増幅
/// - `max_shift_samples`: 500（相互相関探索の最大シフト）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpliceConfig {
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: f64,
    #[serde(default = "default_short_crossfade_ms")]
    pub short_crossfade_ms: f64,
    #[serde(default = "default_short_word_ms")]
    pub short_word_ms: f64,
    #[serde(default = "default_short_word_max_crossfade_ms")]
    pub short_word_max_crossfade_ms: f64,
    #[serde(default = "default_short_word_boost")]
    pub short_word_boost: f32,
    #[serde(default = "default_fallback_fade_ms")]
    pub fallback_fade_ms: f64,
    #[serde(default = "default_energy_ratio_limit")]
    pub energy_ratio_limit: f32,
    #[serde(default = "default_energy_gain_limit")]
    pub energy_gain_limit: f32,
    #[serde(default = "default_max_shift_samples")]
    pub max_shift_samples: usize,
    #[serde(default = "default_shift_step")]
    pub shift_step: usize,
    #[serde(default = "default_min_correlation")]
    pub min_correlation: f32,
    #[serde(default = "default_min_alignment_samples")]
    pub min_alignment_samples: usize,
    #[serde(default = "default_seam_window")]
    pub seam_window: usize,
    #[serde(default = "default_seam_threshold_ratio")]
    pub seam_threshold_ratio: f32,
}

/// 文章組み立て設定
///
/// # デフォルト値
///
/// - `punctuation_pause_ms`: 10 ms
/// - `global_fade_ms`: 20 ms（全長の 10% まで）
/// - `short_word_max_chars`: 2
/// - `conjunctions`: ベトナム語の機能語
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssemblerConfig {
    #[serde(default = "default_punctuation_pause_ms")]
    pub punctuation_pause_ms: f64,
    #[serde(default = "default_global_fade_ms")]
    pub global_fade_ms: f64,
    #[serde(default = "default_global_fade_max_ratio")]
    pub global_fade_max_ratio: f64,
    #[serde(default = "default_short_word_max_chars")]
    pub short_word_max_chars: usize,
    #[serde(default = "default_conjunctions")]
    pub conjunctions: Vec<String>,
    #[serde(default = "default_enabled")]
    pub parallel_clip_processing: bool,
}

// Default functions
fn default_root_dir() -> String {
    "./audio_uploads/voice_profiles".to_string()
}

fn default_output_dir() -> String {
    "./audio_uploads/temp".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_transcoder() -> String {
    "ffmpeg".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_top_db() -> f32 {
    33.0
}

fn default_frame_length() -> usize {
    2048
}

fn default_hop_length() -> usize {
    64
}

fn default_pad_ms() -> f64 {
    12.0
}

fn default_refine_region_ratio() -> f64 {
    0.1
}

fn default_refine_frame_ms() -> f64 {
    2.0
}

fn default_refine_threshold_ratio() -> f32 {
    0.1
}

fn default_refine_tolerance_ms() -> f64 {
    5.0
}

fn default_trim_fade_ms() -> f64 {
    8.0
}

fn default_fade_shape() -> FadeShape {
    FadeShape::Linear
}

fn default_target_db() -> f32 {
    -20.0
}

fn default_loudness_clip() -> f32 {
    0.95
}

fn default_reduction_factor() -> f32 {
    0.15
}

fn default_noise_percentile() -> f32 {
    5.0
}

fn default_mask_margin_db() -> f32 {
    3.0
}

fn default_blend() -> f32 {
    0.3
}

fn default_max_fft_size() -> usize {
    2048
}

fn default_min_fft_size() -> usize {
    64
}

fn default_band_low_hz() -> f64 {
    200.0
}

fn default_band_high_hz() -> f64 {
    3500.0
}

fn default_band_gain() -> f32 {
    1.5
}

fn default_lowpass_hz() -> f64 {
    7000.0
}

fn default_residual_gain() -> f32 {
    0.7
}

fn default_filter_order() -> usize {
    4
}

fn default_crossfade_ms() -> f64 {
    50.0
}

fn default_short_crossfade_ms() -> f64 {
    30.0
}

fn default_short_word_ms() -> f64 {
    200.0
}

fn default_short_word_max_crossfade_ms() -> f64 {
    20.0
}

fn default_short_word_boost() -> f32 {
    1.15
}

fn default_fallback_fade_ms() -> f64 {
    10.0
}

fn default_energy_ratio_limit() -> f32 {
    1.5
}

fn default_energy_gain_limit() -> f32 {
    1.5
}

fn default_max_shift_samples() -> usize {
    500
}

fn default_shift_step() -> usize {
    5
}

fn default_min_correlation() -> f32 {
    0.1
}

fn default_min_alignment_samples() -> usize {
    100
}

fn default_seam_window() -> usize {
    100
}

fn default_seam_threshold_ratio() -> f32 {
    0.1
}

fn default_punctuation_pause_ms() -> f64 {
    10.0
}

fn default_global_fade_ms() -> f64 {
    20.0
}

fn default_global_fade_max_ratio() -> f64 {
    0.1
}

fn default_short_word_max_chars() -> usize {
    2
}

fn default_conjunctions() -> Vec<String> {
    ["và", "hay", "hoặc", "nhưng", "của", "thì", "là", "mà"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            output: OutputConfig::default(),
            normalizer: NormalizerConfig::default(),
            trim: TrimConfig::default(),
            upload_trim: TrimConfig::upload(),
            denoise: DenoiseConfig::default(),
            enhance: EnhanceConfig::default(),
            splice: SpliceConfig::default(),
            assembler: AssemblerConfig::default(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            transcoder: default_transcoder(),
            enable_transcoder: default_enabled(),
        }
    }
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            top_db: default_top_db(),
            frame_length: default_frame_length(),
            hop_length: default_hop_length(),
            pad_ms: default_pad_ms(),
            refine: default_enabled(),
            refine_region_ratio: default_refine_region_ratio(),
            refine_frame_ms: default_refine_frame_ms(),
            refine_threshold_ratio: default_refine_threshold_ratio(),
            refine_tolerance_ms: default_refine_tolerance_ms(),
            fade_ms: default_trim_fade_ms(),
            fade_shape: default_fade_shape(),
            loudness_floor_db: None,
            loudness_target_db: default_target_db(),
            loudness_clip: default_loudness_clip(),
        }
    }
}

impl TrimConfig {
    fn check(&self, section: &str) -> Result<()> {
        anyhow::ensure!(self.hop_length > 0, "{}.hop_length は 1 以上にしてください", section);
        anyhow::ensure!(
            self.frame_length >= self.hop_length,
            "{}.frame_length ({}) が hop_length ({}) より短い",
            section,
            self.frame_length,
            self.hop_length
        );
        Ok(())
    }

    /// 語彙登録時（アップロード直後）の無音カット設定
    ///
    /// 小さな声も拾えるよう閾値を緩め、パディングを長めに取り、
    /// 小さすぎる録音は -20dB まで持ち上げる。
    pub fn upload() -> Self {
        Self {
            top_db: 30.0,
            frame_length: 512,
            hop_length: 128,
            pad_ms: 50.0,
            refine: false,
            fade_ms: 30.0,
            fade_shape: FadeShape::Hann,
            loudness_floor_db: Some(-30.0),
            ..Self::default()
        }
    }
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            reduction_factor: default_reduction_factor(),
            noise_percentile: default_noise_percentile(),
            mask_margin_db: default_mask_margin_db(),
            blend: default_blend(),
            max_fft_size: default_max_fft_size(),
            min_fft_size: default_min_fft_size(),
        }
    }
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            band_low_hz: default_band_low_hz(),
            band_high_hz: default_band_high_hz(),
            band_gain: default_band_gain(),
            lowpass_hz: default_lowpass_hz(),
            residual_gain: default_residual_gain(),
            filter_order: default_filter_order(),
            target_db: default_target_db(),
        }
    }
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: default_crossfade_ms(),
            short_crossfade_ms: default_short_crossfade_ms(),
            short_word_ms: default_short_word_ms(),
            short_word_max_crossfade_ms: default_short_word_max_crossfade_ms(),
            short_word_boost: default_short_word_boost(),
            fallback_fade_ms: default_fallback_fade_ms(),
            energy_ratio_limit: default_energy_ratio_limit(),
            energy_gain_limit: default_energy_gain_limit(),
            max_shift_samples: default_max_shift_samples(),
            shift_step: default_shift_step(),
            min_correlation: default_min_correlation(),
            min_alignment_samples: default_min_alignment_samples(),
            seam_window: default_seam_window(),
            seam_threshold_ratio: default_seam_threshold_ratio(),
        }
    }
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            punctuation_pause_ms: default_punctuation_pause_ms(),
            global_fade_ms: default_global_fade_ms(),
            global_fade_max_ratio: default_global_fade_max_ratio(),
            short_word_max_chars: default_short_word_max_chars(),
            conjunctions: default_conjunctions(),
            parallel_clip_processing: default_enabled(),
        }
    }
}

impl Config {
    /// TOML の設定ファイルを読み込む
    ///
    /// 書かれていない項目は既定値で埋まる。読み込んだ後に
    /// フレーム分割と位置合わせの刻み幅を検査する。
    ///
    /// ```no_run
    /// # use splice_tts::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("設定ファイルが不正です: {:?}", path))
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("TOML のパースに失敗")?;
        config.trim.check("trim")?;
        config.upload_trim.check("upload_trim")?;
        anyhow::ensure!(
            config.splice.shift_step > 0,
            "splice.shift_step は 1 以上にしてください"
        );
        anyhow::ensure!(
            config.splice.crossfade_ms >= 0.0 && config.splice.short_crossfade_ms >= 0.0,
            "splice のクロスフェード長が負です"
        );
        Ok(config)
    }

    /// 既定値をすべて書き出した設定ファイルを作る（`--generate-config`）
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(&Config::default())
            .context("既定設定のシリアライズに失敗")?;
        fs::write(path, content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path))
    }

    /// 設定ファイルが無ければ既定値で動かす
    ///
    /// 存在するのに読めない・壊れている場合は既定値に逃げずエラーにする。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => {
                Self::parse(&content).with_context(|| format!("設定ファイルが不正です: {:?}", path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("設定ファイルがないため既定値で合成します: {:?}", path);
                Ok(Config::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path))
            }
        }
    }
}
