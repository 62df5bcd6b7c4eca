//! In-kernel device filtering for managed cgroups.
//!
//! This crate does not assemble BPF programs; it receives pre-built
//! instruction sequences and a license string, loads them as
//! cgroup-device programs and manages the attach lifecycle on a cgroup
//! directory.

pub mod devices;

pub use devices::{load_attach_device_filter, BpfInsn, DeviceFilterGuard};
