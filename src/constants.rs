//! Constants used throughout the pooler
//!
//! This module centralizes protocol numbers, buffer sizes and timing values
//! so that they are not scattered as magic numbers.

use std::time::Duration;

/// Buffer size constants
pub mod buffer {
    /// Page size for memory alignment
    const PAGE_SIZE: usize = 4096;

    /// Default read-ahead for each relay side (8KB)
    pub const READAHEAD: usize = 8 * 1024;

    /// Queued outbound bytes that force a flush mid-batch (32KB)
    pub const PIPELINE_FLUSH: usize = 32 * 1024;

    /// Number of read buffers kept for reuse by the relay
    pub const POOL_COUNT: usize = 64;

    /// Largest message accepted from either side (1GB, the backend's own limit)
    pub const MAX_MESSAGE: usize = 1 << 30;

    /// Largest startup packet accepted from a client
    pub const MAX_STARTUP: usize = 10_000;

    const _READAHEAD_ALIGNED: () = assert!(
        READAHEAD.is_multiple_of(PAGE_SIZE),
        "READAHEAD must be page-aligned"
    );

    const _FLUSH_ABOVE_READAHEAD: () = assert!(
        PIPELINE_FLUSH >= READAHEAD,
        "PIPELINE_FLUSH should hold at least one full read"
    );
}

/// Startup-phase protocol codes
pub mod startup {
    /// Protocol version 3.0
    pub const PROTOCOL_V3: i32 = 196_608;
    pub const SSL_REQUEST: i32 = 80_877_103;
    pub const CANCEL_REQUEST: i32 = 80_877_102;
    pub const GSSENC_REQUEST: i32 = 80_877_104;

    /// Total length of a CancelRequest packet
    pub const CANCEL_LEN: usize = 16;
}

/// SQLSTATE codes sent to clients
pub mod sqlstate {
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const UNDEFINED_DATABASE: &str = "3D000";
    pub const TOO_MANY_CONNECTIONS: &str = "53300";
    pub const INVALID_PASSWORD: &str = "28P01";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_OBJECT: &str = "42704";
    pub const SYSTEM_ERROR: &str = "58000";
}

/// Session parameters that are carried from one client to the next backend
///
/// Anything outside this list is left as the backend reports it.
pub const DEPLOYABLE_PARAMS: &[&str] = &[
    "TimeZone",
    "DateStyle",
    "client_encoding",
    "application_name",
    "extra_float_digits",
    "standard_conforming_strings",
    "statement_timeout",
    "search_path",
];

/// Parameters reported to clients before any backend has been seen
pub const DEFAULT_SERVER_PARAMS: &[(&str, &str)] = &[
    ("server_version", "14.0"),
    ("server_encoding", "UTF8"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("integer_datetimes", "on"),
    ("standard_conforming_strings", "on"),
];

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Maintenance tick interval (idle time is counted in ticks)
    pub const TICK: Duration = Duration::from_secs(1);

    /// Wait for each outstanding ReadyForQuery while resetting a server
    pub const RESET_WAIT: Duration = Duration::from_secs(1);

    /// Dial plus handshake budget for a new backend connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Time a client has to send its startup packet
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
}
