//! Worker protocol over stdio with `Content-Length` framed JSON.

use anyhow::{Result, anyhow, bail};
use std::env;
use taxonium::{about, settings::EngineSettings, stdio::run_stdio_worker};

fn usage() {
    println!(
        "Usage:\n  \
taxonium_worker [-v|-vv] [--settings PATH] [--help|-h] [--version|-V]\n\n  \
Reads framed requests (upload, query, search, config, details, list,\n  \
nextstrain, overall_spectrum, variation_data) from stdin and writes framed\n  \
responses to stdout. Logging goes to stderr.\n"
    );
}

fn run() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();
    let mut verbose = 0u8;
    let mut settings_path: Option<String> = None;
    let mut idx = 1usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "--help" | "-h" => {
                usage();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("{}", about::version_cli_text());
                return Ok(());
            }
            "-v" => verbose += 1,
            "-vv" => verbose += 2,
            "--settings" => {
                idx += 1;
                let path = args
                    .get(idx)
                    .ok_or_else(|| anyhow!("Missing PATH after --settings"))?;
                settings_path = Some(path.clone());
            }
            other => bail!("Unknown argument '{other}'. Use --help for usage."),
        }
        idx += 1;
    }

    let mut logger = env_logger::Builder::from_default_env();
    match verbose {
        0 => {}
        1 => {
            logger.filter_level(log::LevelFilter::Info);
        }
        _ => {
            logger.filter_level(log::LevelFilter::Debug);
        }
    }
    logger.init();

    let settings = match settings_path {
        Some(path) => EngineSettings::load_from_path(&path)?,
        None => EngineSettings::default(),
    };
    log::info!("Worker starting ({})", about::TAXONIUM_VERSION);
    run_stdio_worker(settings)?;
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
