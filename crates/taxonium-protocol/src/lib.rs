//! Machine-readable contracts shared between the Taxonium engine worker and
//! its callers.
//!
//! Everything in here is plain serde data. Field names follow the JSON wire
//! format used by the interactive surface, so a message serialized by one side
//! can be read back by the other without a translation layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub type NodeId = usize;
pub type MutationId = u32;
pub type JobId = u64;

/// Gene name used for nucleotide-level mutations.
pub const NUCLEOTIDE_GENE: &str = "nt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationClass {
    Nt,
    Aa,
}

impl MutationClass {
    pub fn for_gene(gene: &str) -> Self {
        if gene == NUCLEOTIDE_GENE {
            Self::Nt
        } else {
            Self::Aa
        }
    }
}

/// One substitution event, stored once in the global mutation table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mutation {
    pub gene: String,
    #[serde(rename = "type")]
    pub class: MutationClass,
    pub previous_residue: String,
    pub new_residue: String,
    pub residue_pos: u32,
    pub mutation_id: MutationId,
}

impl Mutation {
    pub fn is_nucleotide(&self) -> bool {
        self.gene == NUCLEOTIDE_GENE
    }

    pub fn label(&self) -> String {
        format!(
            "{}:{}{}{}",
            self.gene, self.previous_residue, self.residue_pos, self.new_residue
        )
    }
}

/// A scalar attribute value joined onto a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl MetaValue {
    pub fn blank() -> Self {
        Self::Text(String::new())
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(s) if s.is_empty())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
            Self::Flag(_) => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Flag(b) => write!(f, "{b}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A number that may arrive either as a JSON number or as a string typed
/// into a search box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LooseNumber {
    Number(f64),
    Text(String),
}

impl LooseNumber {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            Self::Number(_) => None,
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        }
    }
}

/// Per-node mutations on the wire: indices into the global table, or the
/// mutation records themselves when the caller asked for hydrated nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeMutations {
    Ids(Vec<MutationId>),
    Hydrated(Vec<Mutation>),
}

impl Default for NodeMutations {
    fn default() -> Self {
        Self::Ids(vec![])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub parent_id: NodeId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_dist: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_time: Option<f64>,
    pub y: f64,
    pub num_tips: usize,
    #[serde(default)]
    pub is_tip: bool,
    #[serde(default)]
    pub mutations: NodeMutations,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, MetaValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XType {
    #[default]
    #[serde(rename = "x_dist")]
    Distance,
    #[serde(rename = "x_time")]
    Time,
}

impl XType {
    pub fn accessor(self) -> &'static str {
        match self {
            Self::Distance => "x_dist",
            Self::Time => "x_time",
        }
    }
}

/// Query rectangle in layout coordinates. Missing (or NaN) components mean
/// "unbounded" on that side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub min_x: Option<f64>,
    #[serde(default)]
    pub max_x: Option<f64>,
    #[serde(default)]
    pub min_y: Option<f64>,
    #[serde(default)]
    pub max_y: Option<f64>,
    #[serde(default)]
    pub zoom: [f64; 2],
    #[serde(rename = "xType", default)]
    pub x_type: XType,
}

impl Bounds {
    pub fn unbounded(x_type: XType) -> Self {
        Self {
            x_type,
            ..Default::default()
        }
    }

    pub fn component(value: Option<f64>) -> Option<f64> {
        value.filter(|v| !v.is_nan())
    }

    /// True when no side of the rectangle carries a usable value.
    pub fn is_unbounded(&self) -> bool {
        [self.min_x, self.max_x, self.min_y, self.max_y]
            .iter()
            .all(|v| Self::component(*v).is_none())
    }
}

/// Wire form of a (possibly nested) search specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    #[serde(default)]
    pub key: String,
    #[serde(rename = "type")]
    pub spec_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<LooseNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_residue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tips: Option<LooseNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<LooseNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean_method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subspecs: Vec<SearchSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub filename: String,
    #[serde(default)]
    pub filetype: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "taxonColumn", default)]
    pub taxon_column: Option<String>,
}

/// An upload names its input either inline (`data`, text only) or by
/// `path`; compressed inputs must come by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadPayload {
    pub filename: String,
    #[serde(default)]
    pub filetype: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub ladderize: bool,
    #[serde(rename = "useHydratedMutations", default)]
    pub use_hydrated_mutations: bool,
    #[serde(default)]
    pub metadata: Option<MetadataPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Upload {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: UploadPayload,
    },
    Query {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        #[serde(default)]
        bounds: Option<Bounds>,
    },
    Search {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        search: SearchSpec,
        #[serde(default)]
        bounds: Option<Bounds>,
    },
    Config {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
    },
    Details {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        node_id: NodeId,
    },
    List {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        node_id: NodeId,
        key: String,
    },
    Nextstrain {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        node_id: NodeId,
        #[serde(default)]
        config: Option<Value>,
    },
    OverallSpectrum {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
    },
    VariationData {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        class: MutationClass,
        #[serde(rename = "ntBounds")]
        nt_bounds: [f64; 2],
        #[serde(default)]
        bounds: Option<Bounds>,
    },
}

impl Request {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Upload { job_id, .. }
            | Self::Query { job_id, .. }
            | Self::Search { job_id, .. }
            | Self::Config { job_id }
            | Self::Details { job_id, .. }
            | Self::List { job_id, .. }
            | Self::Nextstrain { job_id, .. }
            | Self::OverallSpectrum { job_id }
            | Self::VariationData { job_id, .. } => *job_id,
        }
    }

    /// Everything except `upload` needs an ingested dataset.
    pub fn needs_data(&self) -> bool {
        !matches!(self, Self::Upload { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on the last message of a successful job that has no other reply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl StatusMessage {
    pub fn progress(message: impl Into<String>, percentage: Option<f64>) -> Self {
        Self {
            message: Some(message.into()),
            percentage,
            error: None,
            done: false,
        }
    }

    pub fn finished(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            percentage: Some(100.0),
            error: None,
            done: true,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            message: None,
            percentage: None,
            error: Some(error.into()),
            done: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchResultKind {
    Complete,
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: SearchResultKind,
    pub data: Vec<NodeRecord>,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationEntry {
    pub y: [f64; 2],
    pub m: Mutation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationChunk {
    pub class: MutationClass,
    pub entries: Vec<VariationEntry>,
    /// Set on the last chunk of a pass.
    pub complete: bool,
    /// Set when the entries were served from the permanent base-set cache.
    pub cached: bool,
    #[serde(rename = "treenomeReferenceInfo", default)]
    pub reference: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchType {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub method: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorBy {
    #[serde(rename = "colorByOptions")]
    pub color_by_options: Vec<String>,
    #[serde(rename = "prettyColorByOptions")]
    pub pretty_color_by_options: BTreeMap<String, String>,
}

/// Read-only description of an ingested dataset for the rendering layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub num_nodes: usize,
    pub num_tips: usize,
    pub initial_x: f64,
    pub initial_y: f64,
    pub initial_zoom: f64,
    pub genes: Vec<String>,
    #[serde(rename = "rootId")]
    pub root_id: NodeId,
    #[serde(rename = "rootMutations")]
    pub root_mutations: Vec<MutationId>,
    pub name_accessor: String,
    pub x_accessors: Vec<String>,
    pub keys_to_display: Vec<String>,
    pub search_types: Vec<SearchType>,
    #[serde(rename = "colorBy")]
    pub color_by: ColorBy,
    pub mutations: Vec<Mutation>,
    #[serde(rename = "useHydratedMutations")]
    pub use_hydrated_mutations: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status {
        #[serde(rename = "jobId", default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        data: StatusMessage,
    },
    Query {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: QueryResult,
    },
    Search {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: SearchResult,
    },
    Config {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: Map<String, Value>,
    },
    Details {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: NodeRecord,
    },
    List {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: Vec<Option<MetaValue>>,
    },
    Nextstrain {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: Value,
    },
    OverallSpectrum {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: BTreeMap<String, usize>,
    },
    VariationData {
        #[serde(rename = "jobId", default)]
        job_id: Option<JobId>,
        data: VariationChunk,
    },
}

impl Response {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Status { job_id, .. }
            | Self::Query { job_id, .. }
            | Self::Search { job_id, .. }
            | Self::Config { job_id, .. }
            | Self::Details { job_id, .. }
            | Self::List { job_id, .. }
            | Self::Nextstrain { job_id, .. }
            | Self::OverallSpectrum { job_id, .. }
            | Self::VariationData { job_id, .. } => *job_id,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Status { data, .. } => data.error.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req: Request = serde_json::from_value(json!({
            "type": "search",
            "jobId": 7,
            "search": {
                "key": "s1",
                "type": "boolean",
                "boolean_method": "and",
                "subspecs": [
                    {"type": "mutation", "gene": "S", "position": "484", "new_residue": "K"},
                    {"type": "number", "number_method": ">=", "number": 5}
                ]
            },
            "bounds": {"min_x": 0.0, "max_x": 10.0, "min_y": null, "max_y": 3.0, "zoom": [1.0, 2.0], "xType": "x_time"}
        }))
        .unwrap();
        assert_eq!(req.job_id(), Some(7));
        let Request::Search { search, bounds, .. } = req else {
            panic!("expected search request");
        };
        assert_eq!(search.subspecs.len(), 2);
        assert_eq!(
            search.subspecs[0].position.as_ref().and_then(LooseNumber::as_f64),
            Some(484.0)
        );
        let bounds = bounds.unwrap();
        assert_eq!(bounds.x_type, XType::Time);
        assert_eq!(Bounds::component(bounds.min_y), None);
        assert!(!bounds.is_unbounded());
    }

    #[test]
    fn test_node_record_flattens_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("meta_country".to_string(), MetaValue::from("UK"));
        let record = NodeRecord {
            node_id: 3,
            parent_id: 1,
            name: "A".to_string(),
            x_dist: Some(1.5),
            x_time: None,
            y: 20.0,
            num_tips: 1,
            is_tip: true,
            mutations: NodeMutations::Ids(vec![0, 4]),
            metadata,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["meta_country"], json!("UK"));
        assert_eq!(value["mutations"], json!([0, 4]));
        assert!(value.get("x_time").is_none());
    }

    #[test]
    fn test_status_response_carries_error() {
        let resp = Response::Status {
            job_id: None,
            data: StatusMessage::failure("bad file"),
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], json!("status"));
        assert_eq!(value["data"]["error"], json!("bad file"));
        assert_eq!(resp.error(), Some("bad file"));
    }
}
