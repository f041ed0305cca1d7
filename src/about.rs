pub const TAXONIUM_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version_cli_text() -> String {
    format!(
        "Taxonium engine {}\nPhylogenetic tree ingestion, layout and search",
        TAXONIUM_VERSION
    )
}
