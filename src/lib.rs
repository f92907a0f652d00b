// src/lib.rs
//! graph2table library: extracts hierarchical graph API data into
//! relational tables.
//!
//! # Public API
//!
//! The library exposes types organized by concern:
//! - **Error handling**: `AppError`, `GraphErrorKind`, `mask_access_tokens`
//! - **Configuration**: `RunConfig`, `Configuration`, `QueryRow`, `Account`
//! - **Policy**: `ExtractionPolicy` and its column/trigger tables
//! - **API client**: `GraphApi`, `GraphHttpClient`, `QueryDispatcher`
//! - **Flattening**: `FlattenContext`, `TableSet`, `FinalTable`
//! - **Pipeline**: `run`, `sync_action`, `RunSummary`

pub mod api;
pub mod config;
pub mod constants;
pub mod dates;
pub mod error;
pub mod error_recovery;
pub mod flatten;
pub mod insights;
pub mod output;
pub mod pipeline;
pub mod policy;

// --- Error Handling ---
pub use crate::error::{mask_access_tokens, AppError, GraphErrorKind};

// --- Configuration ---
pub use crate::config::{
    AccessToken, Account, CommandLineInput, Configuration, QueryConfig, QueryRow, QueryType,
    RunAction, RunConfig,
};

// --- Policy ---
pub use crate::policy::ExtractionPolicy;

// --- API client ---
pub use crate::api::{
    FetchedRecord, GraphApi, GraphHttpClient, HttpReply, QueryDispatcher, SourceMeta, TokenCache,
    TokenSource,
};

// --- Flattening ---
pub use crate::flatten::{FinalTable, FlattenContext, TableSet};

// --- Pipeline ---
pub use crate::pipeline::{run, run_with_api, sync_action, sync_action_with_api, RunSummary};
