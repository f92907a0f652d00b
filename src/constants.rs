// src/constants.rs
//! Domain constants that define the operational boundaries of the system.
//!
//! Each constant is named for the domain concept it constrains, not its
//! technical role. Tunable policy (retry ceilings, candidate column lists)
//! lives in [`crate::policy::ExtractionPolicy`]; this module holds the
//! values that are fixed properties of the remote protocol.

// ---------------------------------------------------------------------------
// Graph API boundaries
// ---------------------------------------------------------------------------

/// Base URL of the versioned graph endpoint.
pub const GRAPH_API_BASE_URL: &str = "https://graph.facebook.com";

/// API version used when the configuration does not specify one.
pub const DEFAULT_API_VERSION: &str = "v23.0";

/// Page size requested when a query does not configure its own limit.
pub const DEFAULT_PAGE_LIMIT: u32 = 25;

/// Placeholder substituted for access token values in logs and errors.
pub const TOKEN_PLACEHOLDER: &str = "---ACCESS-TOKEN---";

// ---------------------------------------------------------------------------
// Pagination timestamp sanity
// ---------------------------------------------------------------------------

/// A `since` timestamp within this many seconds of now in a `paging.next`
/// URL means the API has run out of historical data and is pointing the
/// cursor at the present. Following it would re-request an empty window.
pub const RECENT_SINCE_THRESHOLD_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Error display
// ---------------------------------------------------------------------------

/// Maximum characters shown when previewing error response bodies.
pub const ERROR_BODY_PREVIEW_LENGTH: usize = 500;
