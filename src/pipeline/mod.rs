//! Mail intake pipeline.
//!
//! Every delivered message flows through:
//! 1. `filter::accept()`: sender allow-list (pure)
//! 2. `ArchivalWriter::archive()`: write-once raw copy, per policy
//! 3. `BodyReducer::reduce()`: markup and boilerplate removal, bounded length
//! 4. `KnowledgeExtractor::extract()`: LLM call with timeout and retry
//! 5. `GraphWriter::commit()`: deduplicated concepts and provenance-tagged edges
//!
//! `IntakeProcessor` sequences the stages and writes each outcome to the
//! audit ledger, which decides whether a redelivered message runs again.

pub mod archive;
pub mod audit;
pub mod extractor;
pub mod filter;
pub mod graph_writer;
pub mod processor;
pub mod reducer;
pub mod types;
pub mod worker;

pub use processor::IntakeProcessor;
