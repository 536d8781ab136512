//! 2つの音声の継ぎ目処理
//!
//! 隣り合うクリップを次の手順でつなぐ：
//!
//! 1. 後ろのクリップが短ければクロスフェードを短くし、音量を少し上げる
//! 2. どちらかがクロスフェード長より短ければ、短いフェードで単純連結
//! 3. 継ぎ目付近の音量差が大きければ、小さい側を持ち上げる
//! 4. 相互相関で最も揃う時間ずれを探し、十分に相関があれば適用
//! 5. ハニング窓由来のフェードでクロスフェード
//! 6. 継ぎ目で平均値が急に変わっていれば局所的に平滑化
//!
//! 出力長は常に `len(A) + len(B) - crossfade_samples`
//! （単純連結時は `len(A) + len(B)`）。

use crate::config::SpliceConfig;
use crate::dsp::{self, linspace};
use crate::error::{Result, SpliceError};
use crate::types::AudioBuffer;

/// 相関値の差がこれ以下なら同点とみなす
const TIE_TOLERANCE: f32 = 1e-4;

/// 結合結果
#[derive(Clone, Debug)]
pub struct SpliceOutcome {
    pub audio: AudioBuffer,

    /// 実際に重ねたサンプル数（単純連結時は0）
    pub crossfade_samples: usize,

    /// 適用した時間ずれ（サンプル、負なら重なりを広げて B を前に寄せた）
    pub shift: isize,

    /// 継ぎ目の平滑化を行ったか
    pub seam_smoothed: bool,
}

/// クロスフェードによる結合器
pub struct TransitionSplicer {
    config: SpliceConfig,
}

impl TransitionSplicer {
    pub fn new(config: &SpliceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// 2つの音声をクロスフェードでつなぐ
    ///
    /// # Arguments
    ///
    /// * `a` - 前の音声（ここまでの結合結果）
    /// * `b` - 後ろのクリップ
    /// * `crossfade_ms` - 希望するクロスフェード長（短い単語では短縮される）
    ///
    /// # Examples
    ///
    /// ```
    /// # use splice_tts::config::SpliceConfig;
    /// # use splice_tts::splicer::TransitionSplicer;
    /// # use splice_tts::types::AudioBuffer;
    /// let splicer = TransitionSplicer::new(&SpliceConfig::default());
    /// let a = AudioBuffer::new(vec![0.3; 4800], 16000);
    /// let b = AudioBuffer::new(vec![0.3; 4000], 16000);
    /// let outcome = splicer.splice(a, b, 50.0).unwrap();
    /// assert_eq!(outcome.audio.len(), 4800 + 4000 - outcome.crossfade_samples);
    /// ```
    pub fn splice(&self, a: AudioBuffer, b: AudioBuffer, crossfade_ms: f64) -> Result<SpliceOutcome> {
        check_rates(&a, &b)?;
        let sample_rate = a.sample_rate;
        let mut first = a.samples;
        let mut second = b.samples;

        let short_word = second.len() < dsp_ms(self.config.short_word_ms, sample_rate);
        let mut crossfade_ms = crossfade_ms;
        if short_word {
            crossfade_ms = crossfade_ms.min(self.config.short_word_max_crossfade_ms);
            for s in second.iter_mut() {
                *s *= self.config.short_word_boost;
            }
        }

        let mut cf = dsp_ms(crossfade_ms, sample_rate);
        if cf == 0 || first.len() < cf || second.len() < cf {
            let audio = self.concat_samples(first, second, sample_rate);
            return Ok(SpliceOutcome {
                audio,
                crossfade_samples: 0,
                shift: 0,
                seam_smoothed: false,
            });
        }

        self.balance_energy(&mut first, &mut second, cf);

        let mut shift = 0isize;
        if !short_word && cf > self.config.min_alignment_samples {
            if let Some((best_shift, corr)) = self.find_alignment(&first, &second, cf) {
                // 重なりの長さを変えて A の末尾と B の先頭の対応をずらす
                let aligned = cf as isize - best_shift;
                let fits = aligned > 0 && (aligned as usize) <= first.len().min(second.len());
                if best_shift != 0 && corr > self.config.min_correlation && fits {
                    log::debug!("継ぎ目の位置合わせ: shift={}, corr={:.3}", best_shift, corr);
                    shift = best_shift;
                    cf = aligned as usize;
                }
            }
        }

        let head_len = first.len() - cf;
        let mut result = Vec::with_capacity(first.len() + second.len() - cf);
        result.extend_from_slice(&first[..head_len]);

        let window = dsp::hanning(cf * 2);
        let (fade_in, fade_out) = window.split_at(cf);
        result.extend(
            first[head_len..]
                .iter()
                .zip(fade_out)
                .zip(second[..cf].iter().zip(fade_in))
                .map(|((&x, &wo), (&y, &wi))| x * wo + y * wi),
        );
        result.extend_from_slice(&second[cf..]);

        let expected = first.len() + second.len() - cf;
        if result.len() != expected {
            return Err(SpliceError::AssemblyFailed(format!(
                "結合後の長さが不正: {} != {}",
                result.len(),
                expected
            )));
        }

        let seam_smoothed = self.smooth_seam(&mut result, head_len);

        Ok(SpliceOutcome {
            audio: AudioBuffer::new(result, sample_rate),
            crossfade_samples: cf,
            shift,
            seam_smoothed,
        })
    }

    /// 短いフェードをかけて単純に連結
    ///
    /// 句読点の直後など、クロスフェードで間を潰したくない箇所に使う。
    pub fn concat_with_fade(&self, a: AudioBuffer, b: AudioBuffer) -> Result<AudioBuffer> {
        check_rates(&a, &b)?;
        let sample_rate = a.sample_rate;
        Ok(self.concat_samples(a.samples, b.samples, sample_rate))
    }

    /// 末尾に無音を足す
    pub fn append_pause(&self, mut a: AudioBuffer, pause_ms: f64) -> AudioBuffer {
        let len = a.ms_to_samples(pause_ms);
        a.samples.extend(std::iter::repeat(0.0).take(len));
        a
    }

    fn concat_samples(&self, mut first: Vec<f32>, second: Vec<f32>, sample_rate: u32) -> AudioBuffer {
        let mut second = second;
        let fade = (first.len() / 2)
            .min(second.len() / 2)
            .min(dsp_ms(self.config.fallback_fade_ms, sample_rate));
        if fade > 1 {
            let tail = first.len() - fade;
            for (s, g) in first[tail..].iter_mut().zip(linspace(1.0, 0.8, fade)) {
                *s *= g;
            }
            for (s, g) in second[..fade].iter_mut().zip(linspace(0.8, 1.0, fade)) {
                *s *= g;
            }
        }
        first.extend_from_slice(&second);
        AudioBuffer::new(first, sample_rate)
    }

    /// 継ぎ目の音量差を緩和
    ///
    /// A が大きすぎれば B 全体を、B が大きすぎれば A の末尾窓を
    /// 徐々に持ち上げる。完全には揃えない。
    fn balance_energy(&self, first: &mut [f32], second: &mut [f32], cf: usize) {
        let tail = first.len() - cf;
        let tail_power = mean_square(&first[tail..]);
        let head_power = mean_square(&second[..cf]).max(1e-10);
        let ratio = (tail_power / head_power).sqrt() as f32;

        let limit = self.config.energy_ratio_limit;
        let max_gain = self.config.energy_gain_limit;
        if ratio > limit {
            let gain = max_gain.min(ratio * 0.8);
            log::debug!("後続クリップを増幅: ratio={:.2}, gain={:.2}", ratio, gain);
            for s in second.iter_mut() {
                *s *= gain;
            }
        } else if ratio < 1.0 / limit {
            let gain = if ratio > 0.0 {
                max_gain.min(0.8 / ratio)
            } else {
                max_gain
            };
            log::debug!("前の末尾を増幅: ratio={:.2}, gain={:.2}", ratio, gain);
            for (s, g) in first[tail..].iter_mut().zip(linspace(1.0, gain, cf)) {
                *s *= g;
            }
        }
    }

    /// 正規化相互相関が最大になる時間ずれを探す
    ///
    /// 負のずれ `-k` は A の末尾 `i` と B の先頭 `i + k` が対応することを表す。
    /// 相関がほぼ同じなら絶対値の小さいずれを選ぶ。
    fn find_alignment(&self, first: &[f32], second: &[f32], cf: usize) -> Option<(isize, f32)> {
        let end = &first[first.len() - cf..];
        let start = &second[..cf];
        let max_shift = (cf / 4).min(self.config.max_shift_samples) as isize;
        let step = self.config.shift_step.max(1);
        let min_len = (self.config.min_alignment_samples / 2).max(1);

        let mut best: Option<(isize, f32)> = None;
        for shift in (-max_shift..=max_shift).step_by(step) {
            let (x, y) = if shift < 0 {
                let n = (cf as isize + shift) as usize;
                (&end[..n], &start[(-shift) as usize..][..n])
            } else {
                let n = cf - shift as usize;
                (&end[shift as usize..][..n], &start[..n])
            };
            if x.len() < min_len {
                continue;
            }

            let corr = normalized_correlation(x, y);
            let better = match best {
                None => true,
                Some((best_shift, c)) => {
                    corr > c + TIE_TOLERANCE
                        || (corr >= c - TIE_TOLERANCE && shift.abs() < best_shift.abs())
                }
            };
            if better {
                best = Some((shift, corr));
            }
        }
        best
    }

    /// 継ぎ目で平均値が跳んでいれば、その近傍を移動平均と混ぜて滑らかにする
    fn smooth_seam(&self, result: &mut [f32], transition: usize) -> bool {
        let w = self.config.seam_window;
        if w == 0 || transition <= w || transition + w >= result.len() {
            return false;
        }

        let pre = mean(&result[transition - w..transition]);
        let post = mean(&result[transition..transition + w]);
        let peak = result.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        if (pre - post).abs() <= self.config.seam_threshold_ratio * peak {
            return false;
        }

        log::debug!("継ぎ目の段差を平滑化: {:.4} -> {:.4}", pre, post);
        let region = &mut result[transition - w..transition + w];
        let averaged = moving_average(region, (w / 10).max(3) | 1);
        let weights = dsp::hanning(region.len());
        for ((s, avg), weight) in region.iter_mut().zip(averaged).zip(weights) {
            *s = (1.0 - weight) * *s + weight * avg;
        }
        true
    }
}

fn check_rates(a: &AudioBuffer, b: &AudioBuffer) -> Result<()> {
    if a.sample_rate != b.sample_rate {
        return Err(SpliceError::AssemblyFailed(format!(
            "サンプリングレートが一致しません: {} != {}",
            a.sample_rate, b.sample_rate
        )));
    }
    Ok(())
}

fn dsp_ms(ms: f64, sample_rate: u32) -> usize {
    crate::types::ms_to_samples(ms, sample_rate)
}

fn mean(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f32>() / samples.len() as f32
}

fn mean_square(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64
}

fn normalized_correlation(x: &[f32], y: &[f32]) -> f32 {
    let (mut dot, mut xx, mut yy) = (0.0f64, 0.0f64, 0.0f64);
    for (&a, &b) in x.iter().zip(y) {
        dot += a as f64 * b as f64;
        xx += a as f64 * a as f64;
        yy += b as f64 * b as f64;
    }
    (dot / ((xx * yy).sqrt() + 1e-10)) as f32
}

/// 中心揃えの移動平均（端は範囲内のサンプルだけで平均）
fn moving_average(samples: &[f32], kernel: usize) -> Vec<f32> {
    let half = kernel / 2;
    (0..samples.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(samples.len());
            mean(&samples[start..end])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16000;

    fn tone(freq: f32, len: usize, amplitude: f32) -> AudioBuffer {
        let samples = (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / RATE as f32).sin() * amplitude)
            .collect();
        AudioBuffer::new(samples, RATE)
    }

    fn splicer() -> TransitionSplicer {
        TransitionSplicer::new(&SpliceConfig::default())
    }

    #[test]
    fn test_crossfade_length_bound() {
        let cases = [
            (tone(200.0, 4800, 0.5), tone(200.0, 4000, 0.5), 50.0),
            (tone(220.0, 8000, 0.5), tone(330.0, 6000, 0.2), 50.0),
            (tone(150.0, 3000, 0.1), tone(300.0, 5000, 0.6), 30.0),
            (tone(440.0, 5000, 0.4), tone(440.0, 2000, 0.4), 50.0),
        ];
        for (a, b, ms) in cases {
            let (la, lb) = (a.len(), b.len());
            let outcome = splicer().splice(a, b, ms).unwrap();
            assert!(outcome.crossfade_samples > 0);
            assert_eq!(outcome.audio.len(), la + lb - outcome.crossfade_samples);
        }
    }

    #[test]
    fn test_fallback_concatenates_when_too_short() {
        // 5ms のクリップは 20ms のクロスフェードに足りない
        let a = tone(200.0, 4800, 0.5);
        let b = tone(200.0, 80, 0.5);
        let outcome = splicer().splice(a, b, 50.0).unwrap();
        assert_eq!(outcome.crossfade_samples, 0);
        assert_eq!(outcome.audio.len(), 4880);
    }

    #[test]
    fn test_short_word_caps_crossfade() {
        // 150ms の後続クリップは 20ms (320サンプル) 以下に制限される
        let a = tone(200.0, 8000, 0.5);
        let b = tone(200.0, 2400, 0.5);
        let outcome = splicer().splice(a, b, 50.0).unwrap();
        assert_eq!(outcome.crossfade_samples, 320);
        assert_eq!(outcome.shift, 0);
    }

    #[test]
    fn test_energy_balancing_boosts_quiet_second() {
        let a = tone(200.0, 8000, 0.8);
        let b = tone(200.0, 8000, 0.1);
        let outcome = splicer().splice(a, b, 50.0).unwrap();
        // 後半は 1.5 倍まで持ち上がる
        let tail = &outcome.audio.samples[outcome.audio.len() - 3200..];
        assert!(tail.iter().fold(0.0f32, |m, &s| m.max(s.abs())) > 0.14);
    }

    /// 決定的な白色ノイズ
    fn noise(len: usize, seed: u64) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * 0.8
            })
            .collect()
    }

    #[test]
    fn test_alignment_applies_best_shift() {
        // B の先頭は A の末尾より 40 サンプル前から始まる同じ信号
        let signal = noise(9000, 42);
        let a = AudioBuffer::new(signal[..4800].to_vec(), RATE);
        let b = AudioBuffer::new(signal[3960..8760].to_vec(), RATE);

        let (shift, corr) = splicer()
            .find_alignment(&a.samples, &b.samples, 800)
            .unwrap();
        assert_eq!(shift, -40);
        assert!(corr > 0.99);

        let outcome = splicer().splice(a, b, 50.0).unwrap();
        assert_eq!(outcome.shift, -40);
        assert_eq!(outcome.crossfade_samples, 840);
        let merged = &outcome.audio.samples;
        assert_eq!(merged.len(), 4800 + 4800 - 840);

        // 重なり以外はそのまま、重なり部分も元の信号に戻る
        assert_eq!(&merged[..3860], &signal[..3860]);
        assert_eq!(&merged[4800..], &signal[4800..8760]);
        for i in 4100..4700 {
            assert!((merged[i] - signal[i]).abs() < 0.01, "i = {}", i);
        }
    }

    #[test]
    fn test_alignment_rejected_when_correlation_is_low() {
        // 直流と交互符号の列はどのずれでも相関がほぼ0
        let a = AudioBuffer::new(vec![0.5f32; 4800], RATE);
        let b = AudioBuffer::new(
            (0..4800).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect(),
            RATE,
        );

        let (shift, corr) = splicer()
            .find_alignment(&a.samples, &b.samples, 800)
            .unwrap();
        assert_ne!(shift, 0);
        assert!(corr <= 0.1);

        let outcome = splicer().splice(a, b, 50.0).unwrap();
        assert_eq!(outcome.shift, 0);
        assert_eq!(outcome.crossfade_samples, 800);
        assert_eq!(outcome.audio.len(), 8800);
    }

    #[test]
    fn test_alignment_prefers_smallest_shift_on_ties() {
        // 位相の連続した周期信号は複数のずれで同じ相関になる
        let a = tone(200.0, 4800, 0.5);
        let b = tone(200.0, 4800, 0.5);

        let (shift, _) = splicer()
            .find_alignment(&a.samples, &b.samples, 800)
            .unwrap();
        assert_eq!(shift, 0);

        let outcome = splicer().splice(a, b, 50.0).unwrap();
        assert_eq!(outcome.shift, 0);
        assert_eq!(outcome.crossfade_samples, 800);
        assert_eq!(outcome.audio.len(), 8800);
    }

    #[test]
    fn test_energy_balancing_ramps_quiet_tail() {
        let mut first = vec![0.1f32; 2000];
        let mut second = vec![0.8f32; 2000];
        splicer().balance_energy(&mut first, &mut second, 800);

        assert!(first[..1201].iter().all(|&s| s == 0.1));
        assert!((first[1999] - 0.15).abs() < 1e-6);
        assert!(first[1200..].windows(2).all(|w| w[1] >= w[0]));
        assert!(second.iter().all(|&s| s == 0.8));
    }

    #[test]
    fn test_correlation_is_normalized() {
        let x = vec![0.1f32, 0.5, -0.3, 0.2];
        let y: Vec<f32> = x.iter().map(|v| v * 3.0).collect();
        assert!((normalized_correlation(&x, &y) - 1.0).abs() < 1e-5);
        let neg: Vec<f32> = x.iter().map(|v| -v).collect();
        assert!((normalized_correlation(&x, &neg) + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_seam_step_is_smoothed() {
        let splicer = splicer();
        let mut result = vec![0.0f32; 400];
        for s in result[200..].iter_mut() {
            *s = 0.5;
        }
        assert!(splicer.smooth_seam(&mut result, 200));
        assert!(result[199] > 0.0 && result[200] < 0.5);
        assert_eq!(result.len(), 400);

        let mut flat = vec![0.2f32; 400];
        assert!(!splicer.smooth_seam(&mut flat, 200));
    }

    #[test]
    fn test_pause_and_concat_preserve_gap() {
        let splicer = splicer();
        let a = tone(200.0, 1600, 0.5);
        let with_pause = splicer.append_pause(a, 10.0);
        assert_eq!(with_pause.len(), 1760);

        let b = tone(200.0, 1600, 0.5);
        let joined = splicer.concat_with_fade(with_pause, b).unwrap();
        assert_eq!(joined.len(), 3360);
        assert!(joined.samples[1600..1760].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mismatched_rates_fail() {
        let a = AudioBuffer::new(vec![0.1; 1000], 16000);
        let b = AudioBuffer::new(vec![0.1; 1000], 22050);
        assert!(matches!(
            splicer().splice(a, b, 50.0),
            Err(SpliceError::AssemblyFailed(_))
        ));
    }
}
