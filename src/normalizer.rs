//! 音声フォーマットの正規化
//!
//! ユーザーがアップロードした任意の音声ファイルを検証し、
//! モノラル16bit PCM WAV（元のサンプリングレート）に揃える。
//!
//! デコードは次の順に試す：
//!
//! 1. `hound` による WAV の直接読み込み
//! 2. `symphonia` による汎用デコード（flac / ogg / mp3 / aac / mp4 など）
//! 3. 外部トランスコーダ（`ffmpeg -y -i <in> -acodec pcm_s16le <out>`）

use crate::config::NormalizerConfig;
use crate::error::{Result, SpliceError};
use crate::types::AudioBuffer;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// i16 サンプルを -1.0 ~ 1.0 に変換
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// -1.0 ~ 1.0 のサンプルを i16 に変換（範囲外はクリップ）
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// インターリーブされたサンプルをチャンネル平均でモノラル化
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// 音声フォーマット正規化器
pub struct AudioNormalizer {
    /// 外部トランスコーダのコマンド名（無効なら `None`）
    transcoder: Option<String>,
}

impl AudioNormalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        let transcoder = if config.enable_transcoder {
            Some(config.transcoder.clone())
        } else {
            None
        };
        Self { transcoder }
    }

    /// バイト列をデコードしてモノラル音声を得る
    ///
    /// # Arguments
    ///
    /// * `bytes` - 音声ファイルの中身
    /// * `extension` - 拡張子のヒント（`"mp3"` など、不明なら `None`）
    /// * `source_desc` - ログ・エラー用の説明（ファイルパスなど）
    pub fn decode(
        &self,
        bytes: &[u8],
        extension: Option<&str>,
        source_desc: &str,
    ) -> Result<AudioBuffer> {
        if bytes.is_empty() {
            return Err(SpliceError::EmptyOrCorruptFile(format!(
                "{} (0バイト)",
                source_desc
            )));
        }

        let mut chain = Vec::new();

        match decode_wav(bytes) {
            Ok(audio) => return check_decoded(audio, source_desc),
            Err(e) => {
                log::debug!("WAVとして読み込めません: {} ({})", source_desc, e);
                chain.push(format!("hound: {}", e));
            }
        }

        match decode_symphonia(bytes, extension) {
            Ok(audio) => {
                log::warn!("汎用デコーダで読み込みました: {}", source_desc);
                return check_decoded(audio, source_desc);
            }
            Err(e) => {
                log::warn!("汎用デコーダでの読み込みに失敗: {} ({})", source_desc, e);
                chain.push(format!("symphonia: {}", e));
            }
        }

        match &self.transcoder {
            Some(program) => match transcode(program, bytes, extension) {
                Ok(audio) => {
                    log::warn!("{} で変換して読み込みました: {}", program, source_desc);
                    return check_decoded(audio, source_desc);
                }
                Err(e) => {
                    log::warn!("{} での変換に失敗: {} ({})", program, source_desc, e);
                    chain.push(format!("{}: {}", program, e));
                }
            },
            None => chain.push("transcoder: 無効".to_string()),
        }

        Err(SpliceError::UnreadableAudio {
            source_desc: source_desc.to_string(),
            chain,
        })
    }

    /// 正規形（モノラル16bit PCM WAV）にエンコード
    pub fn encode_canonical(audio: &AudioBuffer) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: audio.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
            for &sample in &audio.samples {
                writer.write_sample(f32_to_i16(sample)).map_err(wav_error)?;
            }
            writer.finalize().map_err(wav_error)?;
        }
        Ok(cursor.into_inner())
    }

    /// バイト列を検証し、正規形の音声とそのエンコード結果を返す
    ///
    /// 返す音声は正規形をデコードし直した値なので、
    /// 16bit 量子化後のサンプルと一致する。
    pub fn normalize_bytes(
        &self,
        bytes: &[u8],
        extension: Option<&str>,
        source_desc: &str,
    ) -> Result<(AudioBuffer, Vec<u8>)> {
        let decoded = self.decode(bytes, extension, source_desc)?;
        let canonical = Self::encode_canonical(&decoded)?;
        let audio = decode_wav(&canonical).map_err(|e| {
            SpliceError::EmptyOrCorruptFile(format!("{}: 再エンコード結果が不正 ({})", source_desc, e))
        })?;
        Ok((audio, canonical))
    }

    /// ファイルを検証して正規形に書き換える
    ///
    /// 既に正規形であればファイルには触れない。
    /// 書き換えは同じディレクトリの一時ファイルからのアトミックな置き換えで行う。
    pub fn normalize_file<P: AsRef<Path>>(&self, path: P) -> Result<AudioBuffer> {
        let path = path.as_ref();
        let source_desc = path.display().to_string();

        if !path.exists() {
            return Err(SpliceError::EmptyOrCorruptFile(format!(
                "{} (ファイルが存在しません)",
                source_desc
            )));
        }

        let bytes = fs::read(path)?;
        let extension = path.extension().and_then(|e| e.to_str());
        let (audio, canonical) = self.normalize_bytes(&bytes, extension, &source_desc)?;

        if canonical != bytes {
            log::info!("音声ファイルを正規形に変換: {:?}", path);
            write_atomic(path, &canonical)?;
        } else {
            log::debug!("音声ファイルは正規形です: {:?}", path);
        }

        Ok(audio)
    }
}

/// 同じディレクトリの一時ファイル経由でファイルを置き換える
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| SpliceError::Io(e.error))?;
    Ok(())
}

fn wav_error(e: hound::Error) -> SpliceError {
    match e {
        hound::Error::IoError(io) => SpliceError::Io(io),
        other => SpliceError::AssemblyFailed(format!("WAVエンコードに失敗: {}", other)),
    }
}

fn check_decoded(audio: AudioBuffer, source_desc: &str) -> Result<AudioBuffer> {
    if audio.sample_rate == 0 {
        return Err(SpliceError::EmptyOrCorruptFile(format!(
            "{} (サンプリングレートが不正)",
            source_desc
        )));
    }
    if audio.is_empty() {
        return Err(SpliceError::EmptyOrCorruptFile(format!(
            "{} (サンプルがありません)",
            source_desc
        )));
    }
    Ok(audio)
}

/// WAV を直接読み込む
fn decode_wav(bytes: &[u8]) -> std::result::Result<AudioBuffer, hound::Error> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    Ok(AudioBuffer::new(
        downmix(&interleaved, spec.channels as usize),
        spec.sample_rate,
    ))
}

/// symphonia で任意フォーマットをデコード
fn decode_symphonia(
    bytes: &[u8],
    extension: Option<&str>,
) -> std::result::Result<AudioBuffer, SymphoniaError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or(SymphoniaError::Unsupported("音声トラックがありません"))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(err),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // 壊れたパケットは読み飛ばす
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => return Err(err),
        };
        let spec = *decoded.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        let channels = spec.channels.count();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        mono.extend(downmix(sample_buf.samples(), channels));
    }

    Ok(AudioBuffer::new(mono, sample_rate))
}

/// 外部トランスコーダで PCM WAV に変換してから読み込む
fn transcode(program: &str, bytes: &[u8], extension: Option<&str>) -> anyhow::Result<AudioBuffer> {
    use anyhow::Context;

    let suffix = format!(".{}", extension.unwrap_or("bin"));
    let mut input = tempfile::Builder::new()
        .prefix("splice_in_")
        .suffix(&suffix)
        .tempfile()
        .context("一時入力ファイルの作成に失敗")?;
    input.write_all(bytes).context("一時入力ファイルの書き込みに失敗")?;
    input.flush()?;

    let output = tempfile::Builder::new()
        .prefix("splice_out_")
        .suffix(".wav")
        .tempfile()
        .context("一時出力ファイルの作成に失敗")?;

    let status = Command::new(program)
        .arg("-y")
        .arg("-i")
        .arg(input.path())
        .args(["-acodec", "pcm_s16le"])
        .arg(output.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("{} の起動に失敗", program))?;

    if !status.success() {
        anyhow::bail!("{} が失敗しました: {}", program, status);
    }

    let converted = fs::read(output.path()).context("変換結果の読み込みに失敗")?;
    decode_wav(&converted).context("変換結果をWAVとして読み込めません")
}
