//! ノイズ除去と音声強調
//!
//! どちらも品質を少し良くするためのベストエフォート処理で、
//! 内部で失敗した場合は警告ログを出して入力をそのまま返す。
//! サンプル数は決して変わらない。

use crate::config::{DenoiseConfig, EnhanceConfig};
use crate::dsp::{self, SosFilter};
use crate::error::{Result, SpliceError};
use crate::types::AudioBuffer;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// 縮退時の共通処理（警告して入力を返す）
fn passthrough_on_error(
    result: Result<AudioBuffer>,
    audio: &AudioBuffer,
    stage: &str,
) -> AudioBuffer {
    match result {
        Ok(processed) => processed,
        Err(e) => {
            log::warn!("{}: {}", stage, e);
            audio.clone()
        }
    }
}

fn ensure_finite(samples: &[f32], what: &str) -> Result<()> {
    if samples.iter().all(|s| s.is_finite()) {
        Ok(())
    } else {
        Err(SpliceError::ProcessingDegraded(format!(
            "{}に非有限値が含まれています",
            what
        )))
    }
}

/// スペクトルマスクによる控えめなノイズ除去
///
/// 1. STFT（ハン窓、hop = n_fft / 4）で振幅と位相に分ける
/// 2. 振幅 dB の下位パーセンタイルをノイズフロアとし、その近傍のビンだけを減衰
/// 3. 元の位相で逆変換し、元音声とブレンドする
pub struct SpectralDenoiser {
    config: DenoiseConfig,
}

impl SpectralDenoiser {
    pub fn new(config: &DenoiseConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// ノイズ除去（失敗時は入力をそのまま返す）
    pub fn denoise(&self, audio: &AudioBuffer) -> AudioBuffer {
        if !self.config.enabled {
            return audio.clone();
        }
        passthrough_on_error(self.try_denoise(audio), audio, "ノイズ除去をスキップ")
    }

    /// ノイズ除去の本体
    ///
    /// 数値的な問題は [`SpliceError::ProcessingDegraded`] で返す。
    pub fn try_denoise(&self, audio: &AudioBuffer) -> Result<AudioBuffer> {
        let factor = self.config.reduction_factor;
        if factor < 0.05 {
            return Ok(audio.clone());
        }
        let factor = factor.min(0.2);

        let n_fft = self.config.max_fft_size.min(audio.len());
        if n_fft < self.config.min_fft_size.max(4) {
            return Ok(audio.clone());
        }
        ensure_finite(&audio.samples, "入力")?;

        let hop = n_fft / 4;
        let window = dsp::periodic_hann(n_fft);
        let mut spectrum = stft(&audio.samples, n_fft, hop, &window);

        let bins = n_fft / 2 + 1;
        let db = magnitude_db(&spectrum, bins);
        let floor = dsp::percentile(&db, self.config.noise_percentile)
            .ok_or_else(|| SpliceError::ProcessingDegraded("スペクトルが空です".to_string()))?;
        let cutoff = floor + self.config.mask_margin_db;
        let gain = 1.0 - factor * 0.8;

        let mut masked = 0usize;
        for (frame, frame_db) in spectrum.iter_mut().zip(db.chunks(bins)) {
            for (k, &value) in frame_db.iter().enumerate() {
                if value < cutoff {
                    masked += 1;
                    frame[k] *= gain;
                    // 負の周波数側も同じ利得にして実信号を保つ
                    let mirror = (n_fft - k) % n_fft;
                    if mirror != k {
                        frame[mirror] *= gain;
                    }
                }
            }
        }
        log::debug!(
            "ノイズ除去: n_fft={}, フロア={:.1}dB, 減衰ビン={}/{}",
            n_fft,
            floor,
            masked,
            db.len()
        );

        let denoised = istft(&spectrum, n_fft, hop, &window, audio.len());
        ensure_finite(&denoised, "ノイズ除去結果")?;

        let blend = self.config.blend;
        let samples = audio
            .samples
            .iter()
            .zip(&denoised)
            .map(|(&orig, &clean)| (1.0 - blend) * orig + blend * clean)
            .collect();

        Ok(AudioBuffer::new(samples, audio.sample_rate))
    }
}

/// 中心揃え（両端ゼロ埋め）の STFT
fn stft(samples: &[f32], n_fft: usize, hop: usize, window: &[f32]) -> Vec<Vec<Complex<f32>>> {
    let pad = n_fft / 2;
    let mut padded = vec![0.0f32; pad];
    padded.extend_from_slice(samples);
    padded.extend(std::iter::repeat(0.0).take(pad));

    let n_frames = 1 + (padded.len() - n_fft) / hop;
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);

    (0..n_frames)
        .map(|i| {
            let start = i * hop;
            let mut frame: Vec<Complex<f32>> = padded[start..start + n_fft]
                .iter()
                .zip(window)
                .map(|(&s, &w)| Complex::new(s * w, 0.0))
                .collect();
            fft.process(&mut frame);
            frame
        })
        .collect()
}

/// 片側スペクトルの振幅 dB（最大値から 80dB 下で頭打ち）
fn magnitude_db(spectrum: &[Vec<Complex<f32>>], bins: usize) -> Vec<f32> {
    const AMIN: f32 = 1e-5;
    const TOP_DB: f32 = 80.0;

    let mut db: Vec<f32> = spectrum
        .iter()
        .flat_map(|frame| frame[..bins].iter())
        .map(|c| 20.0 * c.norm().max(AMIN).log10())
        .collect();
    let max = db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    for value in db.iter_mut() {
        *value = value.max(max - TOP_DB);
    }
    db
}

/// 窓の二乗和で正規化するオーバーラップ加算
fn istft(
    spectrum: &[Vec<Complex<f32>>],
    n_fft: usize,
    hop: usize,
    window: &[f32],
    length: usize,
) -> Vec<f32> {
    let total = n_fft + hop * spectrum.len().saturating_sub(1);
    let mut output = vec![0.0f32; total];
    let mut window_sum = vec![0.0f32; total];

    let mut planner = FftPlanner::<f32>::new();
    let ifft = planner.plan_fft_inverse(n_fft);
    let scale = 1.0 / n_fft as f32;

    for (i, frame) in spectrum.iter().enumerate() {
        let mut buffer = frame.clone();
        ifft.process(&mut buffer);
        let start = i * hop;
        for (j, (c, &w)) in buffer.iter().zip(window).enumerate() {
            output[start + j] += c.re * scale * w;
            window_sum[start + j] += w * w;
        }
    }

    for (s, &w) in output.iter_mut().zip(&window_sum) {
        if w > 1e-8 {
            *s /= w;
        }
    }

    let pad = n_fft / 2;
    let mut samples: Vec<f32> = output.into_iter().skip(pad).take(length).collect();
    samples.resize(length, 0.0);
    samples
}

/// 音声帯域の強調
///
/// 200-3500Hz のバンドパスを強め、ローパスした成分を弱めに足し戻してから
/// 目標音量に正規化する。
pub struct VoiceEnhancer {
    config: EnhanceConfig,
}

impl VoiceEnhancer {
    pub fn new(config: &EnhanceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// 音声強調（失敗時は入力をそのまま返す）
    pub fn enhance(&self, audio: &AudioBuffer) -> AudioBuffer {
        if !self.config.enabled {
            return audio.clone();
        }
        passthrough_on_error(self.try_enhance(audio), audio, "音声強調をスキップ")
    }

    pub fn try_enhance(&self, audio: &AudioBuffer) -> Result<AudioBuffer> {
        if audio.is_empty() {
            return Ok(audio.clone());
        }
        ensure_finite(&audio.samples, "入力")?;

        let fs = audio.sample_rate as f64;
        let degraded = |e: anyhow::Error| SpliceError::ProcessingDegraded(format!("{:#}", e));
        let band = SosFilter::butter_bandpass(
            self.config.filter_order,
            self.config.band_low_hz,
            self.config.band_high_hz,
            fs,
        )
        .map_err(degraded)?;
        let lowpass = SosFilter::butter_lowpass(self.config.filter_order, self.config.lowpass_hz, fs)
            .map_err(degraded)?;

        let voice = band.apply(&audio.samples);
        let residual = lowpass.apply(&audio.samples);
        let mixed: Vec<f32> = voice
            .iter()
            .zip(&residual)
            .map(|(&v, &r)| v * self.config.band_gain + r * self.config.residual_gain)
            .collect();
        ensure_finite(&mixed, "フィルタ出力")?;

        let samples = dsp::normalize_loudness(&mixed, self.config.target_db);
        Ok(AudioBuffer::new(samples, audio.sample_rate))
    }
}
