pub use taxonium_protocol as protocol;

pub mod about;
pub mod bounds;
pub mod client;
pub mod config;
pub mod dynamic_data;
pub mod error;
pub mod export;
pub mod ingest;
pub mod jsonl;
pub mod layout;
pub mod metadata;
pub mod mutation;
pub mod newick;
pub mod nextstrain;
pub mod node_store;
pub mod search;
pub mod search_controller;
pub mod settings;
pub mod source;
pub mod spatial;
pub mod stdio;
pub mod tree;
pub mod variation;
pub mod worker;
