//! One ingestion: read the input, parse it, lay it out, join metadata and
//! build the node store.

use crate::error::{EngineError, EngineResult};
use crate::jsonl::parse_jsonl;
use crate::layout::{AxisPlan, LayoutOptions, lay_out};
use crate::metadata::{join_metadata, parse_metadata};
use crate::newick::{nexus_to_newick, parse_newick};
use crate::nextstrain::parse_nextstrain;
use crate::node_store::{Dataset, NodeStore};
use crate::settings::EngineSettings;
use crate::source::{FileType, InputSource};
use std::path::PathBuf;
use taxonium_protocol::{MetadataPayload, StatusMessage, UploadPayload};

#[derive(Debug, Clone)]
pub struct MetadataOptions {
    pub filename: String,
    pub source: InputSource,
    pub file_type: Option<String>,
    pub taxon_column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub filename: String,
    pub source: InputSource,
    pub file_type: Option<String>,
    pub ladderize: bool,
    pub use_hydrated_mutations: bool,
    pub metadata: Option<MetadataOptions>,
}

fn payload_source(filename: &str, data: &Option<String>, path: &Option<String>) -> EngineResult<InputSource> {
    match (data, path) {
        (_, Some(path)) => Ok(InputSource::Path(PathBuf::from(path))),
        (Some(data), None) => Ok(InputSource::Text(data.clone())),
        (None, None) => Err(EngineError::invalid(format!(
            "Upload of '{filename}' has neither data nor path"
        ))),
    }
}

impl UploadOptions {
    pub fn from_path(path: &str) -> Self {
        Self {
            filename: path.to_string(),
            source: InputSource::Path(PathBuf::from(path)),
            file_type: None,
            ladderize: false,
            use_hydrated_mutations: false,
            metadata: None,
        }
    }

    pub fn from_payload(payload: &UploadPayload) -> EngineResult<Self> {
        let metadata = payload
            .metadata
            .as_ref()
            .map(|m: &MetadataPayload| -> EngineResult<MetadataOptions> {
                Ok(MetadataOptions {
                    filename: m.filename.clone(),
                    source: payload_source(&m.filename, &m.data, &m.path)?,
                    file_type: m.filetype.clone(),
                    taxon_column: m.taxon_column.clone(),
                })
            })
            .transpose()?;
        Ok(Self {
            filename: payload.filename.clone(),
            source: payload_source(&payload.filename, &payload.data, &payload.path)?,
            file_type: payload.filetype.clone(),
            ladderize: payload.ladderize,
            use_hydrated_mutations: payload.use_hydrated_mutations,
            metadata,
        })
    }
}

fn percentage(done: u64, total: Option<u64>) -> Option<f64> {
    total
        .filter(|t| *t > 0)
        .map(|t| (done as f64 / t as f64 * 100.0).min(100.0))
}

/// Runs a full ingestion. Progress is reported through `on_status`; errors
/// are terminal for this attempt.
pub fn ingest(
    options: &UploadOptions,
    settings: &EngineSettings,
    generation: u64,
    on_status: &mut dyn FnMut(StatusMessage),
) -> EngineResult<Dataset> {
    let file_type = FileType::resolve(options.file_type.as_deref(), &options.filename)?;
    if file_type.is_metadata() {
        return Err(EngineError::unsupported(format!(
            "'{}' is a metadata table, not a tree",
            options.filename
        )));
    }
    log::info!("Ingesting '{}' as {file_type:?}", options.filename);

    let mut last_reported = -1.0;
    let text = options.source.read_text(&options.filename, &mut |done, total| {
        if let Some(pct) = percentage(done, total) {
            if pct - last_reported >= 5.0 {
                last_reported = pct;
                on_status(StatusMessage::progress("Loading file", Some(pct)));
            }
        }
    })?;

    on_status(StatusMessage::progress("Parsing tree", None));
    let (mut nodes, mutations, reference, overwrite_config) = match file_type {
        FileType::Jsonl => {
            let tree = parse_jsonl(&text, &mut |done, total| {
                let pct = percentage(done as u64, total.map(|t| t as u64));
                on_status(StatusMessage::progress("Reading nodes", pct));
            })?;
            (tree.nodes, tree.mutations, Default::default(), tree.config)
        }
        _ => {
            let (mut tree, axes) = match file_type {
                FileType::Nextstrain => (parse_nextstrain(&text)?, AxisPlan::Auto),
                FileType::Nexus => (parse_newick(&nexus_to_newick(&text)?)?, AxisPlan::Distance),
                _ => (parse_newick(&text)?, AxisPlan::Distance),
            };
            on_status(StatusMessage::progress("Laying out tree", None));
            let nodes = lay_out(&mut tree, &LayoutOptions::new(settings, options.ladderize, axes));
            let overlay = std::mem::take(&mut tree.overlay);
            (nodes, tree.mutations, tree.reference, overlay)
        }
    };
    drop(text);

    let table = match &options.metadata {
        Some(meta) => {
            on_status(StatusMessage::progress("Reading metadata", None));
            let meta_type = FileType::resolve(meta.file_type.as_deref(), &meta.filename)?;
            let meta_text = meta.source.read_text(&meta.filename, &mut |_, _| {})?;
            Some(parse_metadata(
                &meta_text,
                meta_type,
                meta.taxon_column.as_deref(),
                &mut |rows| log::debug!("Read {rows} metadata rows"),
            )?)
        }
        None => None,
    };
    if table.is_some() || file_type != FileType::Jsonl {
        join_metadata(&mut nodes, table.as_ref());
    }

    let store = NodeStore::new(nodes)?;
    on_status(StatusMessage::finished("Tree ready"));
    log::info!(
        "Ingested {} nodes ({} tips, {} distinct mutations)",
        store.len(),
        store.num_tips(),
        mutations.len()
    );
    Ok(Dataset {
        store,
        mutations,
        reference,
        overwrite_config,
        use_hydrated_mutations: options.use_hydrated_mutations,
        generation,
    })
}
