use anyhow::{bail, Context, Result};
use env_logger::Env;
use splice_tts::assembler::SentenceAssembler;
use splice_tts::catalog::{
    repair_catalog, ClipProcessor, DirectoryCatalog, RepairOptions, VocabularyIngest,
};
use splice_tts::config::Config;
use splice_tts::normalizer::AudioNormalizer;
use std::fs;
use std::path::Path;

const USAGE: &str = "\
使い方:
  splice-tts --generate-config [path]
  splice-tts synthesize <profile> <text...>        [--config <path>]
  splice-tts add-word <profile> <word> <file>      [--config <path>]
  splice-tts list-words <profile>                  [--config <path>]
  splice-tts remove-word <profile> <word>          [--config <path>]
  splice-tts repair [--validate-only] [--profile P] [--word W] [--config <path>]";

/// `--name value` 形式のオプションを取り出す
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    match args.iter().position(|a| a == name) {
        Some(i) => {
            if i + 1 >= args.len() {
                bail!("{} には値が必要です", name);
            }
            let value = args.remove(i + 1);
            args.remove(i);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// `--name` 形式のフラグを取り出す
fn take_flag(args: &mut Vec<String>, name: &str) -> bool {
    match args.iter().position(|a| a == name) {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn main() -> Result<()> {
    // コマンドライン引数をパース
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    // 設定ファイル生成モード
    if args.first().map(String::as_str) == Some("--generate-config") {
        let config_path = args.get(1).map(String::as_str).unwrap_or("config.toml");
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    let config_path =
        take_option(&mut args, "--config")?.unwrap_or_else(|| "config.toml".to_string());

    // ロガーを初期化（ログレベルは設定ファイルから）
    let log_level = Config::from_file(&config_path)
        .map(|c| c.output.log_level)
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let config = Config::load_or_default(&config_path)?;
    log::debug!("設定: {:?}", config);

    let catalog = DirectoryCatalog::new(&config.catalog.root_dir);

    let command = match args.first() {
        Some(command) => command.clone(),
        None => {
            eprintln!("{}", USAGE);
            return Ok(());
        }
    };
    let rest = &args[1..];

    match command.as_str() {
        "synthesize" => {
            if rest.len() < 2 {
                bail!("プロファイルとテキストを指定してください\n{}", USAGE);
            }
            let profile_id = &rest[0];
            let text = rest[1..].join(" ");
            let assembler = SentenceAssembler::new(catalog, &config);
            let output = assembler
                .synthesize(profile_id, &text)
                .with_context(|| format!("音声合成に失敗: {:?}", text))?;
            print_json(&output)?;
        }
        "add-word" => {
            if rest.len() != 3 {
                bail!("プロファイル・単語・ファイルを指定してください\n{}", USAGE);
            }
            let path = Path::new(&rest[2]);
            let bytes = fs::read(path)
                .with_context(|| format!("音声ファイルの読み込みに失敗: {:?}", path))?;
            let extension = path.extension().and_then(|e| e.to_str());
            let ingest = VocabularyIngest::new(&catalog, &config);
            let record = ingest.add_word(&rest[0], &rest[1], &bytes, extension)?;
            print_json(&record)?;
        }
        "list-words" => {
            if rest.len() != 1 {
                bail!("プロファイルを指定してください\n{}", USAGE);
            }
            print_json(&catalog.list_words(&rest[0])?)?;
        }
        "remove-word" => {
            if rest.len() != 2 {
                bail!("プロファイルと単語を指定してください\n{}", USAGE);
            }
            if !catalog.remove_word(&rest[0], &rest[1])? {
                log::warn!("単語が登録されていません: {} / {}", rest[0], rest[1]);
            }
        }
        "repair" => {
            let mut rest = rest.to_vec();
            let options = RepairOptions {
                validate_only: take_flag(&mut rest, "--validate-only"),
                profile_id: take_option(&mut rest, "--profile")?,
                word: take_option(&mut rest, "--word")?,
            };
            if !rest.is_empty() {
                bail!("不明な引数: {:?}\n{}", rest, USAGE);
            }
            let normalizer = AudioNormalizer::new(&config.normalizer);
            let processor = ClipProcessor::new(&config);
            let report = repair_catalog(&catalog, &normalizer, &processor, &options)?;
            print_json(&report)?;
        }
        other => bail!("不明なコマンド: {}\n{}", other, USAGE),
    }

    Ok(())
}
