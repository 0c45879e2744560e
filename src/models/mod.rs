// src/models/mod.rs

//! Domain models for the harvester.
//!
//! This module contains the data structures shared by the template
//! manager, the extractor, the storage layer and the controller.

mod checkpoint;
mod config;
mod record;
mod template;

// Re-export all public types
pub use checkpoint::Checkpoint;
pub use config::{
    Config, ExpansionConfig, ExtractionConfig, HarvestConfig, IdentityMismatch, PathsConfig,
    SessionConfig, TargetConfig, TemplateConfig,
};
pub use record::{Author, ExpansionJob, Record};
pub use template::{
    DOC_ID_PARAM, FRIENDLY_NAME_PARAM, QueryIdentity, RequestDescriptor, RequestTemplate,
    VARIABLES_PARAM,
};
