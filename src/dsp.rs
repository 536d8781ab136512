//! 共通の数値処理
//!
//! RMS・デシベル変換、窓関数、フェード、パーセンタイル、
//! リサンプリング、Butterworth フィルタ (二次セクション) をまとめる。

use crate::types::{AudioBuffer, FadeShape};
use anyhow::{bail, Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use rustfft::num_complex::Complex64;
use std::f64::consts::PI;

/// 無音とみなすときの最小dB値
pub const SILENCE_DB: f32 = -100.0;

/// RMS (Root Mean Square) を計算
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_of_squares / samples.len() as f64).sqrt() as f32
}

/// 振幅をデシベル (dB) に変換
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return SILENCE_DB;
    }
    (20.0 * amplitude.log10()).max(SILENCE_DB)
}

/// ハニング窓（両端が0になる対称窓）
pub fn hanning(len: usize) -> Vec<f32> {
    match len {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (len - 1) as f64;
            (0..len)
                .map(|n| (0.5 - 0.5 * (2.0 * PI * n as f64 / denom).cos()) as f32)
                .collect()
        }
    }
}

/// 周期ハン窓（STFT用）
pub fn periodic_hann(len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| (0.5 - 0.5 * (2.0 * PI * n as f64 / len as f64).cos()) as f32)
        .collect()
}

/// 0 から 1 へ上昇するフェードカーブ
///
/// `Hann` はハニング窓 `2n` 点の前半、`Linear` は両端を含む直線。
pub fn fade_in_curve(len: usize, shape: FadeShape) -> Vec<f32> {
    match shape {
        FadeShape::Hann => {
            let mut window = hanning(len * 2);
            window.truncate(len);
            window
        }
        FadeShape::Linear => linspace(0.0, 1.0, len),
    }
}

/// 1 から 0 へ下降するフェードカーブ
pub fn fade_out_curve(len: usize, shape: FadeShape) -> Vec<f32> {
    let mut curve = fade_in_curve(len, shape);
    curve.reverse();
    curve
}

/// 両端を含む等間隔の値
pub fn linspace(start: f32, end: f32, len: usize) -> Vec<f32> {
    match len {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (len - 1) as f32;
            (0..len).map(|i| start + step * i as f32).collect()
        }
    }
}

/// 先頭 `len` サンプルにフェードインをかける
pub fn apply_fade_in(samples: &mut [f32], len: usize, shape: FadeShape) {
    let len = len.min(samples.len());
    for (s, g) in samples[..len].iter_mut().zip(fade_in_curve(len, shape)) {
        *s *= g;
    }
}

/// 末尾 `len` サンプルにフェードアウトをかける
pub fn apply_fade_out(samples: &mut [f32], len: usize, shape: FadeShape) {
    let len = len.min(samples.len());
    let start = samples.len() - len;
    for (s, g) in samples[start..].iter_mut().zip(fade_out_curve(len, shape)) {
        *s *= g;
    }
}

/// 線形補間によるパーセンタイル (0-100)
pub fn percentile(values: &[f32], p: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p.clamp(0.0, 100.0) as f64 / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = (rank - lower as f64) as f32;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// RMS が `target_db` になるようゲインをかけ、±1.0 でクリップ
///
/// 全サンプルが0の場合はそのまま返す。
pub fn normalize_loudness(samples: &[f32], target_db: f32) -> Vec<f32> {
    if samples.iter().all(|&s| s == 0.0) {
        return samples.to_vec();
    }
    let current_db = 20.0 * (rms(samples) + 1e-9).log10();
    let gain = 10f32.powf((target_db - current_db) / 20.0);
    samples
        .iter()
        .map(|&s| (s * gain).clamp(-1.0, 1.0))
        .collect()
}

/// フレーム毎の平均二乗値（中心揃え・両端ゼロ埋め）
///
/// フレーム `i` は `i * hop_length` を中心とする `frame_length` サンプル。
/// フレーム数は `1 + len / hop_length`。
pub fn centered_frame_power(samples: &[f32], frame_length: usize, hop_length: usize) -> Vec<f64> {
    if samples.is_empty() || frame_length == 0 || hop_length == 0 {
        return Vec::new();
    }

    // 累積和で各フレームの二乗和を求める
    let mut prefix = Vec::with_capacity(samples.len() + 1);
    prefix.push(0.0f64);
    let mut acc = 0.0f64;
    for &s in samples {
        acc += (s as f64) * (s as f64);
        prefix.push(acc);
    }

    let half = (frame_length / 2) as isize;
    let n_frames = 1 + samples.len() / hop_length;
    (0..n_frames)
        .map(|i| {
            let center = (i * hop_length) as isize;
            let start = (center - half).clamp(0, samples.len() as isize) as usize;
            let end = (center - half + frame_length as isize).clamp(0, samples.len() as isize) as usize;
            (prefix[end] - prefix[start]) / frame_length as f64
        })
        .collect()
}

/// 連続フレーム毎のRMS（ゼロ埋めなし、最後の端数フレームも含む）
pub fn block_rms(samples: &[f32], frame_length: usize) -> Vec<f32> {
    if frame_length == 0 {
        return Vec::new();
    }
    samples.chunks(frame_length).map(rms).collect()
}

/// 高品質リサンプリング
///
/// 出力長は `round(len * target_rate / sample_rate)` に揃える。
pub fn resample(audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    if audio.sample_rate == target_rate {
        return Ok(audio.clone());
    }
    if audio.sample_rate == 0 || target_rate == 0 {
        bail!(
            "不正なサンプリングレート: {} -> {}",
            audio.sample_rate,
            target_rate
        );
    }
    if audio.is_empty() {
        return Ok(AudioBuffer::new(Vec::new(), target_rate));
    }

    let ratio = target_rate as f64 / audio.sample_rate as f64;
    let expected = (audio.len() as f64 * ratio).round() as usize;
    let chunk_size = 1024;

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_size, 1)
        .context("リサンプラーの作成に失敗")?;

    // SincFixedIn の出力は入力と時刻が揃っているので先頭は捨てない
    let mut output: Vec<f32> = Vec::with_capacity(expected + chunk_size);
    let mut chunks = audio.samples.chunks_exact(chunk_size);
    for chunk in chunks.by_ref() {
        let result = resampler
            .process(&[chunk], None)
            .context("リサンプリングに失敗")?;
        extend_channel(&mut output, result)?;
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let input = [remainder];
        let result = resampler
            .process_partial(Some(&input[..]), None)
            .context("リサンプリングに失敗")?;
        extend_channel(&mut output, result)?;
    }

    // フィルタに残った末尾を押し出す
    while output.len() < expected {
        let result = resampler
            .process_partial::<&[f32]>(None, None)
            .context("リサンプリングに失敗")?;
        extend_channel(&mut output, result)?;
    }

    output.truncate(expected);
    Ok(AudioBuffer::new(output, target_rate))
}

fn extend_channel(output: &mut Vec<f32>, result: Vec<Vec<f32>>) -> Result<()> {
    match result.into_iter().next() {
        Some(channel) if !channel.is_empty() => {
            output.extend(channel);
            Ok(())
        }
        _ => bail!("リサンプラーが出力を返しませんでした"),
    }
}

/// 二次セクション (biquad) の係数
///
/// `b` は分子、`a` は分母（`a[0] == 1`）。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Biquad {
    /// 周波数 `freq` (Hz) での複素応答
    fn response(&self, freq: f64, sample_rate: f64) -> Complex64 {
        let w = 2.0 * PI * freq / sample_rate;
        let z1 = Complex64::from_polar(1.0, -w);
        let z2 = z1 * z1;
        let num = self.b[0] + z1 * self.b[1] + z2 * self.b[2];
        let den = self.a[0] + z1 * self.a[1] + z2 * self.a[2];
        num / den
    }
}

/// Butterworth フィルタ（二次セクションの縦続接続）
#[derive(Clone, Debug)]
pub struct SosFilter {
    sections: Vec<Biquad>,
}

impl SosFilter {
    /// Butterworth ローパス
    pub fn butter_lowpass(order: usize, cutoff_hz: f64, sample_rate: f64) -> Result<Self> {
        validate_band(order, &[cutoff_hz], sample_rate)?;
        let fs2 = 2.0 * sample_rate;
        let wc = fs2 * (PI * cutoff_hz / sample_rate).tan();

        let poles: Vec<Complex64> = analog_prototype(order).into_iter().map(|p| p * wc).collect();
        let mut filter = Self::from_analog(&poles, &[], wc.powi(order as i32), fs2);
        filter.normalize_at(0.0, sample_rate);
        Ok(filter)
    }

    /// Butterworth バンドパス（次数 `order` の原型から `2 * order` 次）
    pub fn butter_bandpass(order: usize, low_hz: f64, high_hz: f64, sample_rate: f64) -> Result<Self> {
        validate_band(order, &[low_hz, high_hz], sample_rate)?;
        if low_hz >= high_hz {
            bail!("バンドパスの下限が上限以上です: {} >= {}", low_hz, high_hz);
        }
        let fs2 = 2.0 * sample_rate;
        let w1 = fs2 * (PI * low_hz / sample_rate).tan();
        let w2 = fs2 * (PI * high_hz / sample_rate).tan();
        let w0 = (w1 * w2).sqrt();
        let bw = w2 - w1;

        let mut poles = Vec::with_capacity(order * 2);
        for p in analog_prototype(order) {
            let p_lp = p * (bw / 2.0);
            let disc = (p_lp * p_lp - w0 * w0).sqrt();
            poles.push(p_lp + disc);
            poles.push(p_lp - disc);
        }
        let zeros = vec![Complex64::new(0.0, 0.0); order];
        let mut filter = Self::from_analog(&poles, &zeros, bw.powi(order as i32), fs2);

        // 中心周波数 (プリワープ逆変換) で利得1に合わせる
        let center_hz = sample_rate / PI * (w0 / fs2).atan();
        filter.normalize_at(center_hz, sample_rate);
        Ok(filter)
    }

    /// アナログ零点・極から双一次変換で二次セクションを組み立てる
    fn from_analog(poles: &[Complex64], zeros: &[Complex64], gain: f64, fs2: f64) -> Self {
        let bilinear = |s: Complex64| (fs2 + s) / (fs2 - s);
        let digital_poles: Vec<Complex64> = poles.iter().map(|&p| bilinear(p)).collect();
        let mut digital_zeros: Vec<f64> = zeros.iter().map(|&z| bilinear(z).re).collect();
        // 無限遠の零点は z = -1 に写る
        digital_zeros.extend(std::iter::repeat(-1.0).take(poles.len() - zeros.len()));

        let num: Complex64 = zeros.iter().map(|&z| fs2 - z).product();
        let den: Complex64 = poles.iter().map(|&p| fs2 - p).product();
        let digital_gain = gain * (num / den).re;

        let denominators = pair_poles(&digital_poles);
        let numerators = pair_zeros(&digital_zeros);

        let mut sections: Vec<Biquad> = denominators
            .into_iter()
            .zip(numerators)
            .map(|(a, b)| Biquad { b, a })
            .collect();
        if let Some(first) = sections.first_mut() {
            for coeff in first.b.iter_mut() {
                *coeff *= digital_gain;
            }
        }
        Self { sections }
    }

    /// 周波数 `freq` での利得が1になるよう先頭セクションを調整
    fn normalize_at(&mut self, freq: f64, sample_rate: f64) {
        let magnitude = self.magnitude(freq, sample_rate);
        if magnitude > 0.0 && magnitude.is_finite() {
            if let Some(first) = self.sections.first_mut() {
                for coeff in first.b.iter_mut() {
                    *coeff /= magnitude;
                }
            }
        }
    }

    /// 周波数応答の大きさ
    pub fn magnitude(&self, freq: f64, sample_rate: f64) -> f64 {
        self.sections
            .iter()
            .map(|s| s.response(freq, sample_rate))
            .product::<Complex64>()
            .norm()
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// フィルタを適用（転置直接II型）
    pub fn apply(&self, samples: &[f32]) -> Vec<f32> {
        let mut signal: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        for section in &self.sections {
            let (mut z1, mut z2) = (0.0f64, 0.0f64);
            for x in signal.iter_mut() {
                let input = *x;
                let y = section.b[0] * input + z1;
                z1 = section.b[1] * input - section.a[1] * y + z2;
                z2 = section.b[2] * input - section.a[2] * y;
                *x = y;
            }
        }
        signal.into_iter().map(|s| s as f32).collect()
    }
}

fn validate_band(order: usize, freqs: &[f64], sample_rate: f64) -> Result<()> {
    if order == 0 {
        bail!("フィルタ次数は1以上が必要です");
    }
    let nyquist = sample_rate / 2.0;
    for &f in freqs {
        if !(f > 0.0 && f < nyquist) {
            bail!(
                "カットオフ周波数 {} Hz がナイキスト周波数 {} Hz の範囲外です",
                f,
                nyquist
            );
        }
    }
    Ok(())
}

/// 正規化 Butterworth 原型の極（左半平面）
fn analog_prototype(order: usize) -> Vec<Complex64> {
    (0..order)
        .map(|k| {
            let m = -(order as f64) + 1.0 + 2.0 * k as f64;
            -Complex64::from_polar(1.0, PI * m / (2.0 * order as f64))
        })
        .collect()
}

/// 極を共役対（または実数対）にまとめて分母係数を作る
fn pair_poles(poles: &[Complex64]) -> Vec<[f64; 3]> {
    const EPS: f64 = 1e-10;
    let mut sections = Vec::new();
    let mut reals = Vec::new();

    for p in poles {
        if p.im > EPS {
            sections.push([1.0, -2.0 * p.re, p.norm_sqr()]);
        } else if p.im.abs() <= EPS {
            reals.push(p.re);
        }
    }
    for pair in reals.chunks(2) {
        match pair {
            [p1, p2] => sections.push([1.0, -(p1 + p2), p1 * p2]),
            [p] => sections.push([1.0, -p, 0.0]),
            _ => {}
        }
    }
    sections
}

/// 実数零点を符号の異なる組に優先してまとめ、分子係数を作る
fn pair_zeros(zeros: &[f64]) -> Vec<[f64; 3]> {
    let mut positive: Vec<f64> = zeros.iter().copied().filter(|&z| z >= 0.0).collect();
    let mut negative: Vec<f64> = zeros.iter().copied().filter(|&z| z < 0.0).collect();
    let mut sections = Vec::new();

    while !positive.is_empty() || !negative.is_empty() {
        let (z1, z2) = match (positive.pop(), negative.pop()) {
            (Some(p), Some(n)) => (p, Some(n)),
            (Some(p), None) => (p, positive.pop()),
            (None, Some(n)) => (n, negative.pop()),
            (None, None) => break,
        };
        match z2 {
            Some(z2) => sections.push([1.0, -(z1 + z2), z1 * z2]),
            None => sections.push([1.0, -z1, 0.0]),
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_rms_and_db() {
        let samples = vec![0.5f32; 1600];
        assert!((rms(&samples) - 0.5).abs() < 1e-6);
        assert!((amplitude_to_db(0.1) - (-20.0)).abs() < 1e-4);
        assert_eq!(amplitude_to_db(0.0), SILENCE_DB);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_hanning_matches_symmetric_definition() {
        let w = hanning(5);
        assert_eq!(w.len(), 5);
        assert!(w[0].abs() < 1e-7);
        assert!((w[2] - 1.0).abs() < 1e-7);
        assert!(w[4].abs() < 1e-7);
        assert!((w[1] - w[3]).abs() < 1e-7);
    }

    #[test]
    fn test_fade_curves() {
        let fade_in = fade_in_curve(4, FadeShape::Linear);
        assert_eq!(fade_in.first(), Some(&0.0));
        assert_eq!(fade_in.last(), Some(&1.0));

        let fade_out = fade_out_curve(8, FadeShape::Hann);
        assert!(fade_out[0] > 0.95);
        assert!(fade_out[7] < 0.05);

        let mut samples = vec![1.0f32; 10];
        apply_fade_in(&mut samples, 4, FadeShape::Linear);
        apply_fade_out(&mut samples, 4, FadeShape::Linear);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[5], 1.0);
        assert_eq!(samples[9], 0.0);
    }

    #[test]
    fn test_fade_longer_than_buffer_is_clamped() {
        let mut samples = vec![1.0f32; 3];
        apply_fade_in(&mut samples, 10, FadeShape::Linear);
        assert_eq!(samples, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_percentile() {
        let values: Vec<f32> = (1..=100).map(|v| v as f32).collect();
        let p5 = percentile(&values, 5.0).unwrap();
        assert!((p5 - 5.95).abs() < 1e-4);
        assert_eq!(percentile(&values, 100.0), Some(100.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_normalize_loudness() {
        let samples = sine(440.0, 16000, 16000, 0.01);
        let normalized = normalize_loudness(&samples, -20.0);
        let db = amplitude_to_db(rms(&normalized));
        assert!((db + 20.0).abs() < 0.1);

        let zeros = vec![0.0f32; 100];
        assert_eq!(normalize_loudness(&zeros, -20.0), zeros);
    }

    #[test]
    fn test_centered_frame_power() {
        let mut samples = vec![0.0f32; 1000];
        for s in samples[400..600].iter_mut() {
            *s = 1.0;
        }
        let power = centered_frame_power(&samples, 100, 50);
        assert_eq!(power.len(), 1 + 1000 / 50);
        // フレーム10 は 450..550 で全て 1.0
        assert!((power[10] - 1.0).abs() < 1e-9);
        assert_eq!(power[0], 0.0);
    }

    #[test]
    fn test_block_rms_includes_remainder() {
        let samples = vec![1.0f32; 10];
        let values = block_rms(&samples, 4);
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let audio = AudioBuffer::new(vec![0.1; 1000], 16000);
        let result = resample(&audio, 16000).unwrap();
        assert_eq!(result, audio);
    }

    fn peak_index(samples: &[f32]) -> usize {
        samples
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (i, &s)| if s.abs() > best.1 { (i, s.abs()) } else { best })
            .0
    }

    #[test]
    fn test_resample_keeps_timing() {
        // 0.5秒地点のインパルスは変換後も0.5秒地点に来る
        let mut down = vec![0.0f32; 22050];
        down[11025] = 1.0;
        let result = resample(&AudioBuffer::new(down, 22050), 16000).unwrap();
        assert_eq!(result.sample_rate, 16000);
        assert_eq!(result.len(), 16000);
        let peak = peak_index(&result.samples);
        assert!((7999..=8001).contains(&peak), "peak = {}", peak);

        let mut up = vec![0.0f32; 8000];
        up[4000] = 1.0;
        let result = resample(&AudioBuffer::new(up, 8000), 16000).unwrap();
        assert_eq!(result.len(), 16000);
        let peak = peak_index(&result.samples);
        assert!((7999..=8001).contains(&peak), "peak = {}", peak);
    }

    #[test]
    fn test_resample_keeps_onset() {
        // 先頭 30ms の音が欠けずに残る
        let mut samples = sine(200.0, 8000, 240, 0.5);
        samples.resize(1210, 0.0);
        let input_energy: f32 = samples.iter().map(|s| s * s).sum();

        let result = resample(&AudioBuffer::new(samples, 8000), 16000).unwrap();
        assert_eq!(result.len(), 2420);

        let onset_energy: f32 = result.samples[..520].iter().map(|s| s * s).sum();
        let kept = onset_energy / (2.0 * input_energy);
        assert!(kept > 0.95, "kept = {}", kept);

        let last_audible = result
            .samples
            .iter()
            .rposition(|s| s.abs() > 0.01)
            .unwrap();
        assert!(last_audible >= 470, "last audible = {}", last_audible);
    }

    #[test]
    fn test_lowpass_passes_dc_and_blocks_high() {
        let filter = SosFilter::butter_lowpass(4, 1000.0, 16000.0).unwrap();
        assert_eq!(filter.sections().len(), 2);
        assert!((filter.magnitude(0.0, 16000.0) - 1.0).abs() < 1e-9);
        assert!(filter.magnitude(5000.0, 16000.0) < 0.01);

        let dc = vec![1.0f32; 4000];
        let out = filter.apply(&dc);
        assert!((out[3999] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_bandpass_response() {
        let filter = SosFilter::butter_bandpass(4, 200.0, 3500.0, 16000.0).unwrap();
        assert_eq!(filter.sections().len(), 4);
        assert!((filter.magnitude(1000.0, 16000.0) - 1.0).abs() < 0.05);
        assert!(filter.magnitude(30.0, 16000.0) < 0.01);
        assert!(filter.magnitude(7500.0, 16000.0) < 0.01);

        let voice = sine(1000.0, 16000, 16000, 0.5);
        let out = filter.apply(&voice);
        let level = rms(&out[8000..]);
        assert!((level - rms(&voice[8000..])).abs() < 0.05);
    }

    #[test]
    fn test_filter_rejects_cutoff_above_nyquist() {
        assert!(SosFilter::butter_lowpass(4, 7000.0, 8000.0).is_err());
        assert!(SosFilter::butter_bandpass(4, 3500.0, 200.0, 16000.0).is_err());
        assert!(SosFilter::butter_lowpass(0, 1000.0, 16000.0).is_err());
    }
}
