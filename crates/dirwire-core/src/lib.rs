//! dirwire-core: one directory-protocol (LDAP) connection carrying many
//! concurrently outstanding operations.
//!
//! This crate defines:
//! - Wire framing ([`framing::read_frame`]) and envelope helpers ([`ber`])
//! - Per-operation reply channels ([`Request`], [`RequestOptions`])
//! - The connection lifecycle and its reader task ([`Connection`])
//! - The reader pause gate used for in-place stream upgrades ([`PauseGate`])
//! - Scoped release of multi-reply results ([`EnumerationGuard`])
//! - Configuration ([`ConnectionConfig`]) and raw wire tracing ([`WireTrace`])

#![forbid(unsafe_code)]

pub mod ber;
mod config;
mod connection;
mod enumeration;
mod error;
mod frame;
pub mod framing;
mod pause;
mod registry;
mod request;
mod trace;
mod transport;

pub use ber::Control;
pub use config::*;
pub use connection::*;
pub use enumeration::*;
pub use error::*;
pub use frame::*;
pub use pause::*;
pub use registry::*;
pub use request::*;
pub use trace::*;
pub use transport::*;
