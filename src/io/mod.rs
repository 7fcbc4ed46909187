//! File formats: compression detection and JSON Lines.

pub mod compression;
pub mod jsonl;
