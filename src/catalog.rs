//! 語彙カタログ
//!
//! プロファイル毎に `<root>/<profile>/<word>.wav` の形で単語クリップを保持する。
//! 合成時の単語解決のほか、語彙登録・一覧・削除・一括修復を提供する。

use crate::config::Config;
use crate::denoiser::{SpectralDenoiser, VoiceEnhancer};
use crate::error::Result;
use crate::normalizer::{write_atomic, AudioNormalizer};
use crate::trimmer::SilenceTrimmer;
use crate::types::{AudioBuffer, ClipRecord};
use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// 一括修復の対象とする拡張子
pub const AUDIO_EXTENSIONS: [&str; 4] = ["wav", "mp3", "flac", "ogg"];

/// 単語 → クリップの解決
///
/// 合成処理はこのトレイト越しにカタログを読むだけで、
/// クリップの登録・削除には関与しない。
pub trait ClipCatalog: Send + Sync {
    /// 正規化済みの単語に対応するクリップを探す
    fn resolve_word(&self, profile_id: &str, word: &str) -> Option<ClipRecord>;

    /// クリップの中身を読み込む
    fn load_clip_bytes(&self, record: &ClipRecord) -> Result<Vec<u8>> {
        Ok(fs::read(&record.path)?)
    }
}

/// 単語の正規化（小文字化・前後の空白除去）
pub fn normalize_word(word: &str) -> String {
    word.trim().to_lowercase()
}

/// ファイル名として安全な識別子かどうか
fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// ディレクトリ上のカタログ
#[derive(Clone, Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile_dir(&self, profile_id: &str) -> Option<PathBuf> {
        is_safe_component(profile_id).then(|| self.root.join(profile_id))
    }

    /// クリップの保存先
    pub fn clip_path(&self, profile_id: &str, word: &str) -> Option<PathBuf> {
        let word = normalize_word(word);
        if !is_safe_component(&word) {
            return None;
        }
        self.profile_dir(profile_id)
            .map(|dir| dir.join(format!("{}.wav", word)))
    }

    /// 登録済みの単語一覧（ソート済み）
    pub fn list_words(&self, profile_id: &str) -> anyhow::Result<Vec<String>> {
        let dir = match self.profile_dir(profile_id) {
            Some(dir) if dir.is_dir() => dir,
            _ => return Ok(Vec::new()),
        };

        let mut words = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("プロファイルディレクトリの読み込みに失敗: {:?}", dir))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("wav") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    words.push(stem.to_string());
                }
            }
        }
        words.sort();
        Ok(words)
    }

    /// 単語を削除（存在しなければ `false`）
    pub fn remove_word(&self, profile_id: &str, word: &str) -> anyhow::Result<bool> {
        let path = match self.clip_path(profile_id, word) {
            Some(path) if path.exists() => path,
            _ => return Ok(false),
        };
        fs::remove_file(&path).with_context(|| format!("クリップの削除に失敗: {:?}", path))?;
        log::info!("語彙を削除: {} / {}", profile_id, normalize_word(word));
        Ok(true)
    }
}

impl ClipCatalog for DirectoryCatalog {
    fn resolve_word(&self, profile_id: &str, word: &str) -> Option<ClipRecord> {
        let path = self.clip_path(profile_id, word)?;
        path.is_file().then(|| ClipRecord {
            profile_id: profile_id.to_string(),
            word: normalize_word(word),
            path,
        })
    }
}

/// カタログ用クリップの前処理
///
/// 無音カット（検出できなければ元のまま）→ ノイズ除去 → 音声強調。
pub struct ClipProcessor {
    trimmer: SilenceTrimmer,
    denoiser: SpectralDenoiser,
    enhancer: VoiceEnhancer,
}

impl ClipProcessor {
    pub fn new(config: &Config) -> Self {
        Self {
            trimmer: SilenceTrimmer::new(&config.trim),
            denoiser: SpectralDenoiser::new(&config.denoise),
            enhancer: VoiceEnhancer::new(&config.enhance),
        }
    }

    pub fn process(&self, audio: &AudioBuffer) -> AudioBuffer {
        let trimmed = self.trimmer.trim_or_keep(audio);
        let denoised = self.denoiser.denoise(&trimmed);
        self.enhancer.enhance(&denoised)
    }
}

/// 語彙登録
///
/// アップロードされた音声を検証・正規化し、
/// 無音カットと前処理をしてからカタログに保存する。
pub struct VocabularyIngest<'a> {
    catalog: &'a DirectoryCatalog,
    normalizer: AudioNormalizer,
    upload_trimmer: SilenceTrimmer,
    processor: ClipProcessor,
}

impl<'a> VocabularyIngest<'a> {
    pub fn new(catalog: &'a DirectoryCatalog, config: &Config) -> Self {
        Self {
            catalog,
            normalizer: AudioNormalizer::new(&config.normalizer),
            upload_trimmer: SilenceTrimmer::new(&config.upload_trim),
            processor: ClipProcessor::new(config),
        }
    }

    /// 単語を登録（既存のクリップは置き換える）
    ///
    /// 途中で失敗した場合、既存のクリップは変更されず一時ファイルも残らない。
    ///
    /// # Arguments
    ///
    /// * `profile_id` - 声のプロファイル
    /// * `word` - 単語（小文字化・空白除去して保存）
    /// * `bytes` - アップロードされたファイルの中身
    /// * `extension` - 元ファイルの拡張子（デコードのヒント）
    pub fn add_word(
        &self,
        profile_id: &str,
        word: &str,
        bytes: &[u8],
        extension: Option<&str>,
    ) -> anyhow::Result<ClipRecord> {
        let word = normalize_word(word);
        let path = self
            .catalog
            .clip_path(profile_id, &word)
            .with_context(|| format!("不正なプロファイルまたは単語: {:?} / {:?}", profile_id, word))?;
        let dir = path
            .parent()
            .context("クリップの保存先ディレクトリがありません")?
            .to_path_buf();

        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("プロファイルディレクトリの作成に失敗: {:?}", dir))?;
        }

        let source_desc = format!("{} / {}", profile_id, word);
        let (audio, _) = self
            .normalizer
            .normalize_bytes(bytes, extension, &source_desc)
            .with_context(|| format!("アップロード音声の検証に失敗: {}", source_desc))?;

        let trimmed = self.upload_trimmer.trim_or_keep(&audio);
        let processed = self.processor.process(&trimmed);
        let canonical = AudioNormalizer::encode_canonical(&processed)?;

        write_atomic(&path, &canonical)
            .with_context(|| format!("クリップの保存に失敗: {:?}", path))?;

        log::info!(
            "語彙を登録: {} ({:.0}ms) -> {:?}",
            source_desc,
            processed.duration_ms(),
            path
        );

        Ok(ClipRecord {
            profile_id: profile_id.to_string(),
            word,
            path,
        })
    }
}

/// 一括修復の対象と動作
#[derive(Clone, Debug, Default)]
pub struct RepairOptions {
    /// フォーマットの検証・修正だけを行い、前処理はしない
    pub validate_only: bool,

    /// 対象プロファイル（`None` なら全て）
    pub profile_id: Option<String>,

    /// 対象単語（`None` なら全て）
    pub word: Option<String>,
}

/// 修復に失敗したファイル
#[derive(Clone, Debug, Serialize)]
pub struct RepairFailure {
    pub path: PathBuf,
    pub error: String,
}

/// 一括修復の結果
#[derive(Clone, Debug, Default, Serialize)]
pub struct RepairReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<RepairFailure>,
}

/// カタログ内の音声ファイルを一括で検証・修復
///
/// 各ファイルは一時ファイルに書き出してから置き換えるため、
/// 失敗したファイルは元の内容のまま残る。
/// `.wav` 以外のファイルは `<word>.wav` に変換し、成功後に元ファイルを削除する。
pub fn repair_catalog(
    catalog: &DirectoryCatalog,
    normalizer: &AudioNormalizer,
    processor: &ClipProcessor,
    options: &RepairOptions,
) -> anyhow::Result<RepairReport> {
    let files = collect_audio_files(catalog, options)?;
    let mut report = RepairReport {
        total: files.len(),
        ..Default::default()
    };

    log::info!("修復対象: {} ファイル", files.len());

    for path in files {
        match repair_file(&path, normalizer, processor, options.validate_only) {
            Ok(()) => report.succeeded += 1,
            Err(e) => {
                log::error!("修復に失敗: {:?} ({})", path, e);
                report.failed += 1;
                report.failures.push(RepairFailure {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    log::info!(
        "修復完了: 合計 {} / 成功 {} / 失敗 {}",
        report.total,
        report.succeeded,
        report.failed
    );
    Ok(report)
}

fn collect_audio_files(
    catalog: &DirectoryCatalog,
    options: &RepairOptions,
) -> anyhow::Result<Vec<PathBuf>> {
    let root = catalog.root();
    if !root.is_dir() {
        log::warn!("カタログディレクトリがありません: {:?}", root);
        return Ok(Vec::new());
    }

    let profiles: Vec<PathBuf> = match &options.profile_id {
        Some(profile) => catalog.profile_dir(profile).into_iter().collect(),
        None => fs::read_dir(root)
            .with_context(|| format!("カタログディレクトリの読み込みに失敗: {:?}", root))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect(),
    };
    let word_filter = options.word.as_deref().map(normalize_word);

    let mut files = Vec::new();
    for dir in profiles.into_iter().filter(|d| d.is_dir()) {
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("プロファイルディレクトリの読み込みに失敗: {:?}", dir))?
        {
            let path = entry?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase);
            let stem = path.file_stem().and_then(|s| s.to_str());
            let matches_ext = ext.is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.as_str()));
            let matches_word = match (&word_filter, stem) {
                (Some(word), Some(stem)) => stem == word,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if path.is_file() && matches_ext && matches_word {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn repair_file(
    path: &Path,
    normalizer: &AudioNormalizer,
    processor: &ClipProcessor,
    validate_only: bool,
) -> anyhow::Result<()> {
    let bytes = fs::read(path)?;
    let extension = path.extension().and_then(|e| e.to_str());
    let (audio, canonical) =
        normalizer.normalize_bytes(&bytes, extension, &path.display().to_string())?;

    let output = if validate_only {
        canonical
    } else {
        AudioNormalizer::encode_canonical(&processor.process(&audio))?
    };

    let target = path.with_extension("wav");
    if target == path && output == bytes {
        log::debug!("変更なし: {:?}", path);
        return Ok(());
    }

    // 変換先に別内容の WAV があれば、そちらが合成で使われているので触らない
    if target != path && target.exists() {
        let existing = fs::read(&target)
            .with_context(|| format!("既存クリップの読み込みに失敗: {:?}", target))?;
        if existing != output {
            anyhow::bail!("変換先に別の内容のクリップがあります: {:?}", target);
        }
        fs::remove_file(path)?;
        log::info!("重複ファイルを削除: {:?} (同じ内容: {:?})", path, target);
        return Ok(());
    }

    write_atomic(&target, &output)?;
    if target != path {
        fs::remove_file(path)?;
        log::info!("WAVに変換: {:?} -> {:?}", path, target);
    } else {
        log::info!("修復: {:?}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn voiced(len: usize, rate: u32) -> AudioBuffer {
        let samples = (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / rate as f32).sin() * 0.4)
            .collect();
        AudioBuffer::new(samples, rate)
    }

    fn wav_bytes(audio: &AudioBuffer) -> Vec<u8> {
        AudioNormalizer::encode_canonical(audio).unwrap()
    }

    #[test]
    fn test_resolve_and_list_words() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = DirectoryCatalog::new(temp_dir.path());
        let dir = temp_dir.path().join("1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("xin.wav"), wav_bytes(&voiced(1600, 16000))).unwrap();
        fs::write(dir.join("chào.wav"), wav_bytes(&voiced(1600, 16000))).unwrap();
        fs::write(dir.join("notes.txt"), b"x").unwrap();

        let record = catalog.resolve_word("1", " XIN ").unwrap();
        assert_eq!(record.word, "xin");
        assert_eq!(record.path, dir.join("xin.wav"));
        assert!(catalog.resolve_word("1", "bạn").is_none());
        assert!(catalog.resolve_word("2", "xin").is_none());
        assert!(catalog.resolve_word("1", "../1/xin").is_none());

        assert_eq!(catalog.list_words("1").unwrap(), vec!["chào", "xin"]);
        assert!(catalog.list_words("missing").unwrap().is_empty());
    }

    #[test]
    fn test_remove_word() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = DirectoryCatalog::new(temp_dir.path());
        let dir = temp_dir.path().join("1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("xin.wav"), b"data").unwrap();

        assert!(catalog.remove_word("1", "xin").unwrap());
        assert!(!catalog.remove_word("1", "xin").unwrap());
        assert!(!dir.join("xin.wav").exists());
    }

    #[test]
    fn test_add_word_writes_canonical_clip() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = DirectoryCatalog::new(temp_dir.path());
        let config = Config::default();
        let ingest = VocabularyIngest::new(&catalog, &config);

        // 前後に無音のあるステレオ 44.1kHz 録音
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let tone = voiced(13230, 44100);
            for _ in 0..22050 {
                writer.write_sample(0i16).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            for &s in &tone.samples {
                let v = (s * 32767.0) as i16;
                writer.write_sample(v).unwrap();
                writer.write_sample(v).unwrap();
            }
            for _ in 0..22050 {
                writer.write_sample(0i16).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let record = ingest
            .add_word("1", "Chào", &cursor.into_inner(), Some("wav"))
            .unwrap();
        assert_eq!(record.word, "chào");
        assert!(record.path.exists());

        let reader = hound::WavReader::open(&record.path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 44100);
        // 1.3秒の録音から前後の無音が削られている
        assert!(reader.duration() < 44100);
        assert!(reader.duration() >= 13230);

        let entries: Vec<_> = fs::read_dir(temp_dir.path().join("1")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_add_word_rejects_garbage_without_side_effects() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = DirectoryCatalog::new(temp_dir.path());
        let mut config = Config::default();
        config.normalizer.enable_transcoder = false;
        let ingest = VocabularyIngest::new(&catalog, &config);

        let dir = temp_dir.path().join("1");
        fs::create_dir_all(&dir).unwrap();
        let existing = wav_bytes(&voiced(1600, 16000));
        fs::write(dir.join("xin.wav"), &existing).unwrap();

        assert!(ingest.add_word("1", "xin", b"not audio", Some("mp3")).is_err());
        assert!(ingest.add_word("1", "xin", b"", None).is_err());
        assert!(ingest.add_word("1", "a/b", &existing, None).is_err());

        assert_eq!(fs::read(dir.join("xin.wav")).unwrap(), existing);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn test_repair_catalog_counts_and_filters() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = DirectoryCatalog::new(temp_dir.path());
        let mut config = Config::default();
        config.normalizer.enable_transcoder = false;
        let normalizer = AudioNormalizer::new(&config.normalizer);
        let processor = ClipProcessor::new(&config);

        let dir1 = temp_dir.path().join("1");
        let dir2 = temp_dir.path().join("2");
        fs::create_dir_all(&dir1).unwrap();
        fs::create_dir_all(&dir2).unwrap();
        let good = wav_bytes(&voiced(3200, 16000));
        fs::write(dir1.join("xin.wav"), &good).unwrap();
        fs::write(dir1.join("bad.wav"), b"garbage").unwrap();
        fs::write(dir1.join("readme.txt"), b"skip").unwrap();
        // 古いアップロードが WAV と並んで残っている
        let stale = wav_bytes(&voiced(1600, 16000));
        fs::write(dir1.join("xin.mp3"), &stale).unwrap();
        fs::write(dir2.join("chào.wav"), &good).unwrap();
        fs::write(dir2.join("chào.ogg"), &good).unwrap();

        let report = repair_catalog(
            &catalog,
            &normalizer,
            &processor,
            &RepairOptions {
                validate_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(report.total, 5);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failures[0].path, dir1.join("bad.wav"));
        assert_eq!(report.failures[1].path, dir1.join("xin.mp3"));
        // 失敗したファイルは元のまま
        assert_eq!(fs::read(dir1.join("bad.wav")).unwrap(), b"garbage");
        assert_eq!(fs::read(dir1.join("xin.mp3")).unwrap(), stale);
        // 使用中のクリップは古いアップロードで上書きされない
        assert_eq!(fs::read(dir1.join("xin.wav")).unwrap(), good);
        // 同じ内容の重複は削除される
        assert!(!dir2.join("chào.ogg").exists());
        assert_eq!(fs::read(dir2.join("chào.wav")).unwrap(), good);

        let filtered = repair_catalog(
            &catalog,
            &normalizer,
            &processor,
            &RepairOptions {
                validate_only: false,
                profile_id: Some("2".to_string()),
                word: Some("chào".to_string()),
            },
        )
        .unwrap();
        assert_eq!(filtered.total, 1);
        assert_eq!(filtered.succeeded, 1);
    }

    #[test]
    fn test_clip_processor_keeps_silent_clip() {
        let processor = ClipProcessor::new(&Config::default());
        let silent = AudioBuffer::new(vec![0.0; 1600], 16000);
        let result = processor.process(&silent);
        assert_eq!(result.len(), 1600);
    }
}
