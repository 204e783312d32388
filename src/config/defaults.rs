//! Default values for configuration fields
//!
//! This module centralizes all default value functions used in serde deserialization.

use crate::constants::{buffer, timing};
use std::time::Duration;

/// Default listen port
#[inline]
pub fn listen_port() -> u16 {
    6432
}

/// Default backend port
#[inline]
pub fn backend_port() -> u16 {
    5432
}

#[inline]
pub fn backlog() -> u32 {
    128
}

#[inline]
pub fn tick_interval() -> Duration {
    timing::TICK
}

#[inline]
pub fn connect_timeout() -> Duration {
    timing::CONNECT_TIMEOUT
}

#[inline]
pub fn readahead() -> usize {
    buffer::READAHEAD
}

#[inline]
pub fn pipeline_flush() -> usize {
    buffer::PIPELINE_FLUSH
}

#[inline]
pub fn client_fwd_error() -> bool {
    true
}

/// Wait forever for a pooled server
#[inline]
pub fn pool_timeout() -> Duration {
    Duration::ZERO
}

/// Never expire idle servers
#[inline]
pub fn pool_ttl() -> Duration {
    Duration::ZERO
}

#[inline]
pub fn pool_discard() -> bool {
    true
}

#[inline]
pub fn pool_rollback() -> bool {
    true
}

#[inline]
pub fn pool_cancel() -> bool {
    true
}
