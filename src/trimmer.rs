use crate::config::TrimConfig;
use crate::dsp::{self, apply_fade_in, apply_fade_out};
use crate::error::{Result, SpliceError};
use crate::types::AudioBuffer;

/// 無音でない区間を検出
///
/// `hop_length` 毎に中心を置いた `frame_length` サンプルのフレーム
/// （両端はゼロ埋め）の平均二乗値を、最大フレームを基準とした dB に変換し、
/// `-top_db` を超えるフレームの連続をサンプル区間 `[start, end)` に戻す。
///
/// 全サンプルが0なら空のベクタを返す。
///
/// # Examples
///
/// ```
/// # use splice_tts::trimmer::split_non_silent;
/// let mut samples = vec![0.0f32; 16000];
/// for s in samples[6000..10000].iter_mut() {
///     *s = 0.5;
/// }
/// let intervals = split_non_silent(&samples, 30.0, 512, 128);
/// assert_eq!(intervals.len(), 1);
/// assert!(intervals[0].0 <= 6000 && intervals[0].1 >= 10000);
/// ```
pub fn split_non_silent(
    samples: &[f32],
    top_db: f32,
    frame_length: usize,
    hop_length: usize,
) -> Vec<(usize, usize)> {
    detect_intervals(samples, top_db, frame_length, hop_length).0
}

/// 区間と、無音判定に使ったパワーの閾値を返す
fn detect_intervals(
    samples: &[f32],
    top_db: f32,
    frame_length: usize,
    hop_length: usize,
) -> (Vec<(usize, usize)>, f64) {
    const AMIN: f64 = 1e-10;

    let power = dsp::centered_frame_power(samples, frame_length, hop_length);
    let reference = power.iter().copied().fold(0.0f64, f64::max);
    if reference <= 0.0 {
        return (Vec::new(), 0.0);
    }
    let ref_db = 10.0 * reference.max(AMIN).log10();
    let threshold = -(top_db as f64);

    let mut intervals = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &p) in power.iter().enumerate() {
        let db = 10.0 * p.max(AMIN).log10() - ref_db;
        let loud = db > threshold;
        match (loud, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                intervals.push((start, i));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        intervals.push((start, power.len()));
    }

    let intervals = intervals
        .into_iter()
        .map(|(s, e)| {
            (
                (s * hop_length).min(samples.len()),
                (e * hop_length).min(samples.len()),
            )
        })
        .filter(|(s, e)| s < e)
        .collect();
    (intervals, reference * 10f64.powf(threshold / 10.0))
}

fn mean_power(samples: &[f32]) -> f64 {
    (dsp::rms(samples) as f64).powi(2)
}

/// 前後の無音を取り除く
///
/// 粗い区間検出 → 2ms単位の境界補正 → パディング → 短いフェード、の順に処理する。
/// 設定は用途別のプリセット（[`TrimConfig::default`] はカタログ用、
/// [`TrimConfig::upload`] はアップロード直後用）を使う。
pub struct SilenceTrimmer {
    config: TrimConfig,
}

impl SilenceTrimmer {
    pub fn new(config: &TrimConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// 残すべき区間 `[start, end)`（パディング・境界補正込み）
    ///
    /// 無音以外の区間がなければ `None`。
    pub fn detect_span(&self, audio: &AudioBuffer) -> Option<(usize, usize)> {
        let (intervals, power_threshold) = detect_intervals(
            &audio.samples,
            self.config.top_db,
            self.config.frame_length,
            self.config.hop_length,
        );
        let (mut first_start, first_end) = *intervals.first()?;
        let (last_start, mut last_end) = *intervals.last()?;

        let pad = audio.ms_to_samples(self.config.pad_ms);

        if self.config.refine {
            if let Some(actual) = self.refine_start(audio, first_start, first_end) {
                let tolerance = audio.ms_to_samples(self.config.refine_tolerance_ms);
                if actual < first_start + tolerance {
                    first_start = actual;
                }
            }
            if let Some(actual) = self.refine_end(audio, last_start, last_end) {
                let tolerance = audio.ms_to_samples(self.config.refine_tolerance_ms);
                if actual + tolerance > last_end {
                    last_end = actual;
                }
            }
        }

        // 端のフレームはゼロ埋めで弱く見えるので、切り落とす部分そのものが
        // 閾値を超えていれば無音とはみなさない
        if first_start > 0 && mean_power(&audio.samples[..first_start]) > power_threshold {
            first_start = 0;
        }
        if last_end < audio.len() && mean_power(&audio.samples[last_end..]) > power_threshold {
            last_end = audio.len();
        }

        let start = first_start.saturating_sub(pad);
        let end = (last_end + pad).min(audio.len());
        if start >= end {
            return None;
        }
        Some((start, end))
    }

    /// 先頭区間の最初の一部から、RMS が閾値を超える最初の位置を探す
    fn refine_start(&self, audio: &AudioBuffer, start: usize, end: usize) -> Option<usize> {
        let region_len = ((end - start) as f64 * self.config.refine_region_ratio) as usize;
        let frame = audio.ms_to_samples(self.config.refine_frame_ms);
        if frame == 0 || region_len < frame {
            return None;
        }

        let levels = dsp::block_rms(&audio.samples[start..start + region_len], frame);
        let threshold = self.refine_threshold(&levels)?;
        levels
            .iter()
            .position(|&level| level > threshold)
            .map(|k| start + k * frame)
    }

    /// 末尾区間の最後の一部から、RMS が閾値を超える最後の位置を探す
    fn refine_end(&self, audio: &AudioBuffer, start: usize, end: usize) -> Option<usize> {
        let region_len = ((end - start) as f64 * self.config.refine_region_ratio) as usize;
        let frame = audio.ms_to_samples(self.config.refine_frame_ms);
        if frame == 0 || region_len < frame {
            return None;
        }

        let region_start = end - region_len;
        let levels = dsp::block_rms(&audio.samples[region_start..end], frame);
        let threshold = self.refine_threshold(&levels)?;
        levels
            .iter()
            .rposition(|&level| level > threshold)
            .map(|k| (region_start + (k + 1) * frame).min(end))
    }

    fn refine_threshold(&self, levels: &[f32]) -> Option<f32> {
        let peak = levels.iter().copied().fold(0.0f32, f32::max);
        if peak <= 0.0 {
            return None;
        }
        Some(peak * self.config.refine_threshold_ratio)
    }

    /// 前後の無音を取り除いた音声を返す
    ///
    /// 無音以外の区間が見つからなければ [`SpliceError::SilenceDetectionFailed`]。
    /// その場合に元の音声を残すかどうかは呼び出し側が決める。
    pub fn trim(&self, audio: &AudioBuffer) -> Result<AudioBuffer> {
        let (start, end) = self
            .detect_span(audio)
            .ok_or(SpliceError::SilenceDetectionFailed)?;

        let mut samples = audio.samples[start..end].to_vec();

        let fade_len = audio
            .ms_to_samples(self.config.fade_ms)
            .min(samples.len() / 4);
        if fade_len > 0 && samples.len() > 2 * fade_len {
            apply_fade_in(&mut samples, fade_len, self.config.fade_shape);
            apply_fade_out(&mut samples, fade_len, self.config.fade_shape);
        }

        if let Some(floor_db) = self.config.loudness_floor_db {
            let level_db = dsp::amplitude_to_db(dsp::rms(&samples));
            if level_db < floor_db && level_db > dsp::SILENCE_DB {
                let gain = 10f32.powf((self.config.loudness_target_db - level_db) / 20.0);
                let limit = self.config.loudness_clip;
                log::debug!(
                    "音量が小さいため増幅: {:.1}dB -> {:.1}dB",
                    level_db,
                    self.config.loudness_target_db
                );
                for s in samples.iter_mut() {
                    *s = (*s * gain).clamp(-limit, limit);
                }
            }
        }

        log::debug!(
            "無音カット: {} -> {} サンプル ({}..{})",
            audio.len(),
            samples.len(),
            start,
            end
        );

        Ok(AudioBuffer::new(samples, audio.sample_rate))
    }

    /// 無音検出に失敗したら元の音声をそのまま返す
    pub fn trim_or_keep(&self, audio: &AudioBuffer) -> AudioBuffer {
        match self.trim(audio) {
            Ok(trimmed) => trimmed,
            Err(e) => {
                log::warn!("{}。元の音声をそのまま使います", e);
                audio.clone()
            }
        }
    }
}
