// src/lib.rs

//! Resumable feed harvester library

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod transport;
pub mod utils;
