//! 文の組み立て
//!
//! テキストを単語クリップの並びに変換し、1つの WAV ファイルにまとめる。
//!
//! ```text
//! Tokenizing → Resolving → PerClipProcessing → Assembling → Finalizing → Done
//!      └───────────┴──────────────┴───────────────┴─────────────┴──→ Failed
//! ```

use crate::catalog::{ClipCatalog, ClipProcessor};
use crate::config::{AssemblerConfig, Config, SpliceConfig};
use crate::dsp::{self, apply_fade_in, apply_fade_out};
use crate::error::{Result, SpliceError};
use crate::normalizer::AudioNormalizer;
use crate::splicer::TransitionSplicer;
use crate::tokenizer::{is_punctuation, tokenize, TokenClassifier};
use crate::types::{AudioBuffer, ClipRecord, FadeShape, SpliceItem, SpliceJob, SynthesisOutput};
use rayon::prelude::*;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// 出力ファイル名の重複を避けるための通し番号
static OUTPUT_SEQ: AtomicU64 = AtomicU64::new(0);

/// 合成処理の状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblyState {
    Tokenizing,
    Resolving,
    PerClipProcessing,
    Assembling,
    Finalizing,
    Done,
    Failed,
}

impl AssemblyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssemblyState::Done | AssemblyState::Failed)
    }
}

/// 1リクエスト分の状態遷移
struct Run<'a> {
    profile_id: &'a str,
    state: AssemblyState,
}

impl<'a> Run<'a> {
    fn new(profile_id: &'a str) -> Self {
        log::debug!("[{}] 状態: {:?}", profile_id, AssemblyState::Tokenizing);
        Self {
            profile_id,
            state: AssemblyState::Tokenizing,
        }
    }

    fn advance(&mut self, next: AssemblyState) {
        if self.state.is_terminal() {
            return;
        }
        log::debug!("[{}] 状態: {:?} -> {:?}", self.profile_id, self.state, next);
        self.state = next;
    }

    /// エラーなら Failed に遷移してそのまま返す
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            log::error!("[{}] {:?} で失敗: {}", self.profile_id, self.state, e);
            self.advance(AssemblyState::Failed);
        }
        result
    }
}

/// 組み立て結果（ファイル書き出し前）
#[derive(Clone, Debug)]
pub struct Assembled {
    pub tokens: Vec<String>,
    pub audio: AudioBuffer,
}

/// 文の合成器
///
/// 同じインスタンスを複数スレッドから同時に使ってよい
/// （共有するのは読み取り専用のカタログだけ）。
pub struct SentenceAssembler<C: ClipCatalog> {
    catalog: C,
    normalizer: AudioNormalizer,
    processor: ClipProcessor,
    splicer: TransitionSplicer,
    classifier: TokenClassifier,
    config: AssemblerConfig,
    splice: SpliceConfig,
    output_dir: PathBuf,
}

impl<C: ClipCatalog> SentenceAssembler<C> {
    pub fn new(catalog: C, config: &Config) -> Self {
        Self {
            catalog,
            normalizer: AudioNormalizer::new(&config.normalizer),
            processor: ClipProcessor::new(config),
            splicer: TransitionSplicer::new(&config.splice),
            classifier: TokenClassifier::new(&config.assembler, &config.splice),
            config: config.assembler.clone(),
            splice: config.splice.clone(),
            output_dir: PathBuf::from(&config.output.output_dir),
        }
    }

    /// テキストを合成して WAV ファイルに書き出す
    ///
    /// 失敗した場合は出力ファイルも一時ファイルも残らない。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use splice_tts::assembler::SentenceAssembler;
    /// # use splice_tts::catalog::DirectoryCatalog;
    /// # use splice_tts::config::Config;
    /// let config = Config::default();
    /// let catalog = DirectoryCatalog::new(&config.catalog.root_dir);
    /// let assembler = SentenceAssembler::new(catalog, &config);
    /// let output = assembler.synthesize("1", "xin chào").unwrap();
    /// println!("{:?}", output.path);
    /// ```
    pub fn synthesize(&self, profile_id: &str, text: &str) -> Result<SynthesisOutput> {
        let mut run = Run::new(profile_id);
        let assembled = self.assemble_run(&mut run, text)?;

        run.advance(AssemblyState::Finalizing);
        let written = self.write_output(profile_id, &assembled.audio);
        let path = run.check(written)?;

        run.advance(AssemblyState::Done);
        log::info!(
            "音声を書き出しました: {:?} ({} サンプル, {:.2}秒)",
            path,
            assembled.audio.len(),
            assembled.audio.duration_seconds()
        );

        Ok(SynthesisOutput::new(
            path,
            profile_id,
            assembled.tokens,
            &assembled.audio,
        ))
    }

    /// ファイルに書き出さずに合成結果を返す
    pub fn assemble(&self, profile_id: &str, text: &str) -> Result<Assembled> {
        let mut run = Run::new(profile_id);
        let assembled = self.assemble_run(&mut run, text)?;
        run.advance(AssemblyState::Done);
        Ok(assembled)
    }

    fn assemble_run(&self, run: &mut Run<'_>, text: &str) -> Result<Assembled> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return run.check(Err(SpliceError::AssemblyFailed(
                "合成するテキストが空です".to_string(),
            )));
        }

        run.advance(AssemblyState::Resolving);
        let resolved = self.resolve(run.profile_id, &tokens);
        let resolved = run.check(resolved)?;

        run.advance(AssemblyState::PerClipProcessing);
        let job = self.prepare_job(&tokens, &resolved);
        let job = run.check(job)?;

        run.advance(AssemblyState::Assembling);
        let audio = self.fold(job);
        let mut audio = run.check(audio)?;

        self.apply_global_fade(&mut audio);
        for s in audio.samples.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        Ok(Assembled { tokens, audio })
    }

    /// 全トークンのクリップを探す
    ///
    /// 録音のない単語が1つでもあれば、その一覧を返して失敗する。
    /// 句読点は録音がなくてもよい。
    fn resolve(&self, profile_id: &str, tokens: &[String]) -> Result<Vec<Option<ClipRecord>>> {
        let mut missing: Vec<String> = Vec::new();
        let records: Vec<Option<ClipRecord>> = tokens
            .iter()
            .map(|token| {
                let record = self.catalog.resolve_word(profile_id, token);
                if record.is_none() && !is_punctuation(token) && !missing.contains(token) {
                    missing.push(token.clone());
                }
                record
            })
            .collect();

        if !missing.is_empty() {
            return Err(SpliceError::MissingVocabulary(missing));
        }
        Ok(records)
    }

    /// クリップを読み込んで前処理し、サンプリングレートを揃える
    fn prepare_job(&self, tokens: &[String], records: &[Option<ClipRecord>]) -> Result<SpliceJob> {
        let load = |record: &Option<ClipRecord>| -> Result<Option<AudioBuffer>> {
            record.as_ref().map(|r| self.load_clip(r)).transpose()
        };

        let clips: Vec<Option<AudioBuffer>> = if self.config.parallel_clip_processing {
            records.par_iter().map(load).collect::<Result<_>>()?
        } else {
            records.iter().map(load).collect::<Result<_>>()?
        };

        let sample_rate = clips
            .iter()
            .flatten()
            .map(|clip| clip.sample_rate)
            .next()
            .unwrap_or(16000);

        let last = tokens.len() - 1;
        let mut items = Vec::with_capacity(tokens.len());
        for (i, (token, clip)) in tokens.iter().zip(clips).enumerate() {
            let audio = match clip {
                Some(clip) if clip.sample_rate != sample_rate => {
                    log::debug!(
                        "'{}' をリサンプリング: {}Hz -> {}Hz",
                        token,
                        clip.sample_rate,
                        sample_rate
                    );
                    Some(dsp::resample(&clip, sample_rate).map_err(|e| {
                        SpliceError::AssemblyFailed(format!("'{}' のリサンプリングに失敗: {:#}", token, e))
                    })?)
                }
                other => other,
            };
            let class = self.classifier.classify(token, audio.as_ref(), i == last);
            items.push(SpliceItem {
                token: token.clone(),
                audio,
                class,
            });
        }

        Ok(SpliceJob { sample_rate, items })
    }

    fn load_clip(&self, record: &ClipRecord) -> Result<AudioBuffer> {
        let bytes = self.catalog.load_clip_bytes(record)?;
        let extension = record.path.extension().and_then(|e| e.to_str());
        let (audio, _) =
            self.normalizer
                .normalize_bytes(&bytes, extension, &record.path.display().to_string())?;
        Ok(self.processor.process(&audio))
    }

    /// 左から順に結合
    fn fold(&self, job: SpliceJob) -> Result<AudioBuffer> {
        let mut combined: Option<AudioBuffer> = None;
        let mut after_pause = false;

        for item in job.items {
            if item.class.punctuation {
                let base = combined
                    .take()
                    .unwrap_or_else(|| AudioBuffer::new(Vec::new(), job.sample_rate));
                let paused = self.splicer.append_pause(base, self.config.punctuation_pause_ms);
                combined = Some(match item.audio {
                    Some(clip) => self.splicer.concat_with_fade(paused, clip)?,
                    None => paused,
                });
                after_pause = true;
                continue;
            }

            let clip = item.audio.ok_or_else(|| {
                SpliceError::AssemblyFailed(format!("'{}' の音声がありません", item.token))
            })?;

            combined = Some(match combined.take() {
                None => clip,
                Some(previous) if after_pause => self.splicer.concat_with_fade(previous, clip)?,
                Some(previous) => {
                    let crossfade_ms = if item.class.short || item.class.conjunction {
                        self.splice.short_crossfade_ms
                    } else {
                        self.splice.crossfade_ms
                    };
                    self.splicer.splice(previous, clip, crossfade_ms)?.audio
                }
            });
            after_pause = false;
        }

        combined.ok_or_else(|| SpliceError::AssemblyFailed("結合する音声がありません".to_string()))
    }

    /// 文全体の先頭・末尾にフェードをかける
    fn apply_global_fade(&self, audio: &mut AudioBuffer) {
        let by_ratio = (audio.len() as f64 * self.config.global_fade_max_ratio) as usize;
        let fade = audio.ms_to_samples(self.config.global_fade_ms).min(by_ratio);
        if fade > 1 {
            apply_fade_in(&mut audio.samples, fade, FadeShape::Hann);
            apply_fade_out(&mut audio.samples, fade, FadeShape::Hann);
        }
    }

    /// 出力ディレクトリに一意な名前で書き出す
    fn write_output(&self, profile_id: &str, audio: &AudioBuffer) -> Result<PathBuf> {
        if !self.output_dir.exists() {
            fs::create_dir_all(&self.output_dir)?;
        }

        let bytes = AudioNormalizer::encode_canonical(audio)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.output_dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;

        let path = self.output_dir.join(output_file_name(profile_id));
        temp.persist_noclobber(&path)
            .map_err(|e| SpliceError::Io(e.error))?;
        Ok(path)
    }
}

/// `tts_<profile>_<日時>_<通し番号>.wav`
fn output_file_name(profile_id: &str) -> String {
    let profile: String = profile_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let seq = OUTPUT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("tts_{}_{}_{}.wav", profile, timestamp, seq)
}
