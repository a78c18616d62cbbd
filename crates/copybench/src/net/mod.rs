//! Socket plumbing: TCP setup and the Linux zero-copy primitives.

pub mod socket;
#[cfg(target_os = "linux")]
pub mod zerocopy;
