//! Blocking client for the systemd unit-transaction API.
//!
//! Groups are realized as transient units (scopes for process groups,
//! slices for hierarchical grouping). Unit creation and removal are
//! asynchronous on the systemd side: both return a job object, and this
//! module blocks on the corresponding job-removal signal before reporting
//! the call complete.

mod client;

pub use client::{prop, Property, SystemdClient};
