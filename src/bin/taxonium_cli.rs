use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use std::{env, fs};
use taxonium::{
    about,
    protocol::{Bounds, MetadataPayload, MutationClass, Request, Response, SearchSpec, UploadPayload},
    settings::EngineSettings,
    worker::WorkerState,
};

fn usage() {
    eprintln!(
        "Usage:\n  \
  taxonium_cli --version\n  \
  taxonium_cli [OPTIONS] TREE config\n  \
  taxonium_cli [OPTIONS] TREE query ['<bounds-json>']\n  \
  taxonium_cli [OPTIONS] TREE search '<search-json>' ['<bounds-json>']\n  \
  taxonium_cli [OPTIONS] TREE details NODE_ID\n  \
  taxonium_cli [OPTIONS] TREE list NODE_ID KEY\n  \
  taxonium_cli [OPTIONS] TREE export NODE_ID [OUTPUT.json]\n  \
  taxonium_cli [OPTIONS] TREE spectrum\n  \
  taxonium_cli [OPTIONS] TREE variation nt|aa START END\n\n  \
  Options:\n  \
  -v, -vv                  log at info / debug level\n  \
  --settings PATH          engine settings JSON\n  \
  --filetype TYPE          nwk|nexus|nextstrain|jsonl (default: from file name)\n  \
  --metadata PATH          CSV/TSV metadata joined by taxon name\n  \
  --taxon-column NAME      metadata column holding taxon names\n  \
  --ladderize              order siblings by descendant count\n  \
  --hydrated               inline mutation records in node output\n\n  \
  Tip: pass @file.json instead of inline JSON"
    );
}

#[derive(Debug, Default)]
struct Options {
    verbose: u8,
    settings: Option<String>,
    filetype: Option<String>,
    metadata: Option<String>,
    taxon_column: Option<String>,
    ladderize: bool,
    hydrated: bool,
    positional: Vec<String>,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options::default();
    let mut idx = 1usize;
    while idx < args.len() {
        let arg = args[idx].as_str();
        let mut value = || -> Result<String> {
            idx += 1;
            args.get(idx)
                .cloned()
                .ok_or_else(|| anyhow!("Missing value after {arg}"))
        };
        match arg {
            "-v" => options.verbose += 1,
            "-vv" => options.verbose += 2,
            "--settings" => options.settings = Some(value()?),
            "--filetype" => options.filetype = Some(value()?),
            "--metadata" => options.metadata = Some(value()?),
            "--taxon-column" => options.taxon_column = Some(value()?),
            "--ladderize" => options.ladderize = true,
            "--hydrated" => options.hydrated = true,
            other => options.positional.push(other.to_string()),
        }
        idx += 1;
    }
    Ok(options)
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    if verbose > 0 {
        builder.filter_level(match verbose {
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        });
    } else if env::var_os("RUST_LOG").is_none() {
        builder.filter_level(log::LevelFilter::Error);
    }
    builder.init();
}

fn load_json_arg(value: &str) -> Result<String> {
    if let Some(path) = value.strip_prefix('@') {
        fs::read_to_string(path).with_context(|| format!("Could not read JSON file '{path}'"))
    } else {
        Ok(value.to_string())
    }
}

fn parse_bounds(arg: Option<&String>) -> Result<Option<Bounds>> {
    arg.map(|raw| {
        let json = load_json_arg(raw)?;
        serde_json::from_str(&json).context("Invalid bounds JSON")
    })
    .transpose()
}

fn parse_node_id(arg: Option<&String>) -> Result<usize> {
    let raw = arg.ok_or_else(|| anyhow!("Missing NODE_ID"))?;
    raw.parse()
        .with_context(|| format!("Invalid node id '{raw}'"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn upload_request(tree: &str, options: &Options) -> Request {
    Request::Upload {
        job_id: Some(0),
        data: UploadPayload {
            filename: tree.to_string(),
            filetype: options.filetype.clone(),
            path: Some(tree.to_string()),
            ladderize: options.ladderize,
            use_hydrated_mutations: options.hydrated,
            metadata: options.metadata.as_ref().map(|path| MetadataPayload {
                filename: path.clone(),
                path: Some(path.clone()),
                taxon_column: options.taxon_column.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn command_request(command: &str, args: &[String]) -> Result<Request> {
    let job_id = Some(1);
    Ok(match command {
        "config" => Request::Config { job_id },
        "query" => Request::Query {
            job_id,
            bounds: parse_bounds(args.first())?,
        },
        "search" => {
            let raw = args.first().ok_or_else(|| anyhow!("Missing search JSON"))?;
            let search: SearchSpec =
                serde_json::from_str(&load_json_arg(raw)?).context("Invalid search JSON")?;
            Request::Search {
                job_id,
                search,
                bounds: parse_bounds(args.get(1))?,
            }
        }
        "details" => Request::Details {
            job_id,
            node_id: parse_node_id(args.first())?,
        },
        "list" => Request::List {
            job_id,
            node_id: parse_node_id(args.first())?,
            key: args.get(1).cloned().ok_or_else(|| anyhow!("Missing KEY"))?,
        },
        "export" => Request::Nextstrain {
            job_id,
            node_id: parse_node_id(args.first())?,
            config: None,
        },
        "spectrum" => Request::OverallSpectrum { job_id },
        "variation" => {
            let class = match args.first().map(String::as_str) {
                Some("nt") => MutationClass::Nt,
                Some("aa") => MutationClass::Aa,
                other => bail!("Expected nt or aa, got {other:?}"),
            };
            let coordinate = |i: usize, name: &str| -> Result<f64> {
                let raw = args.get(i).ok_or_else(|| anyhow!("Missing {name}"))?;
                raw.parse().with_context(|| format!("Invalid {name} '{raw}'"))
            };
            Request::VariationData {
                job_id,
                class,
                nt_bounds: [coordinate(1, "START")?, coordinate(2, "END")?],
                bounds: None,
            }
        }
        other => {
            usage();
            bail!("Unknown command '{other}'");
        }
    })
}

fn run() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }
    let options = parse_options(&args)?;
    init_logging(options.verbose);
    let [tree, command, rest @ ..] = options.positional.as_slice() else {
        usage();
        bail!("Missing TREE or command");
    };
    let settings = match &options.settings {
        Some(path) => EngineSettings::load_from_path(path)?,
        None => EngineSettings::default(),
    };
    let request = command_request(command, rest)?;

    let mut worker = WorkerState::new(settings);
    for response in worker.handle_collect(upload_request(tree, &options)) {
        if let Some(error) = response.error() {
            bail!("Could not load '{tree}': {error}");
        }
    }

    let mut variation = Vec::new();
    for response in worker.handle_collect(request) {
        match response {
            Response::Status { data, .. } => {
                if let Some(error) = data.error {
                    bail!(error);
                }
            }
            Response::Query { data, .. } => print_json(&data)?,
            Response::Search { data, .. } => print_json(&data)?,
            Response::Config { data, .. } => print_json(&data)?,
            Response::Details { data, .. } => print_json(&data)?,
            Response::List { data, .. } => print_json(&data)?,
            Response::Nextstrain { data, .. } => match rest.get(1) {
                Some(output) => {
                    fs::write(output, serde_json::to_string_pretty(&data)?)
                        .with_context(|| format!("Could not write '{output}'"))?;
                    eprintln!("Wrote {output}");
                }
                None => print_json(&data)?,
            },
            Response::OverallSpectrum { data, .. } => print_json(&data)?,
            Response::VariationData { data, .. } => {
                // a cached chunk repeats every entry of the pass
                if data.cached {
                    variation = data.entries;
                } else {
                    variation.extend(data.entries);
                }
            }
        }
    }
    if command == "variation" {
        print_json(&variation)?;
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
