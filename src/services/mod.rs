//! Service layer for the harvester.
//!
//! This module contains the stateless building blocks of a harvest:
//! - Request template handling (`TemplateManager`)
//! - Response tree walking (`tree`)
//! - Record and cursor extraction (`Extractor`)

pub mod extractor;
pub mod template;
pub mod tree;

pub use extractor::{Extraction, Extractor, Fingerprint};
pub use template::TemplateManager;
