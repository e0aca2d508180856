//! # fleet-id
//!
//! Typed identifiers for the entities the reconciler moves around.
//!
//! Every id renders as `{prefix}_{ulid}`:
//!
//! - `ws_01HV4Z2WQXKJNM8GPQY6VBKC3D` (workspace)
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (execution node)
//! - `org_01HV4Z4NYPLTRS0JTUA8XDME5F` (owning organization)
//!
//! Parsing is strict: the prefix must match the type, so a node id can never
//! be handed to something expecting a workspace id.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
