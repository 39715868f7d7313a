//! Multi-tenant accounting document pipeline: OCR, classification, invoice
//! compliance checks, and AI journal-entry suggestion over durable local
//! queues.

pub mod actions;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod model;
pub mod paths;
pub mod queue;
pub mod services;
pub mod store;
pub mod worker;
