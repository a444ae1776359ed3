//! Substrate capability seam.
//!
//! The kernel packet-filtering facility is an external collaborator; this
//! trait is the whole surface the engine consumes. The native adapter lives
//! out of tree; [`crate::MemorySubstrate`] implements the same contract for
//! tests and the CLI's state-file mode.

use hostwall_core::{CompiledFilter, ExistingFilter};

/// Typed substrate failure.
///
/// Callers react differently per kind (LKG auto-apply vs. hot reload vs.
/// teardown), so the split matters more than the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubstrateError {
    #[error("substrate object already exists: {0}")]
    AlreadyExists(String),
    #[error("substrate object is in use: {0}")]
    InUse(String),
    #[error("substrate object not found: {0}")]
    NotFound(String),
    #[error("substrate access denied: {0}")]
    AccessDenied(String),
    #[error("substrate failure: {0}")]
    Other(String),
}

/// Abstract filtering substrate.
///
/// One session at a time; all mutations happen inside an explicit
/// transaction. The engine, not the substrate, serializes transactions.
pub trait Substrate {
    fn open_session(&mut self) -> Result<(), SubstrateError>;
    fn close_session(&mut self);

    fn provider_exists(&self) -> Result<bool, SubstrateError>;
    fn sublayer_exists(&self) -> Result<bool, SubstrateError>;
    fn create_provider(&mut self) -> Result<(), SubstrateError>;
    fn create_sublayer(&mut self) -> Result<(), SubstrateError>;
    fn delete_provider(&mut self) -> Result<(), SubstrateError>;
    fn delete_sublayer(&mut self) -> Result<(), SubstrateError>;

    /// Snapshot of every filter in this system's sublayer.
    fn enumerate_filters(&self) -> Result<Vec<ExistingFilter>, SubstrateError>;

    fn begin_transaction(&mut self) -> Result<(), SubstrateError>;
    fn commit_transaction(&mut self) -> Result<(), SubstrateError>;
    fn abort_transaction(&mut self) -> Result<(), SubstrateError>;

    /// Create one filter, returning its substrate-native id.
    fn add_filter(&mut self, filter: &CompiledFilter) -> Result<u64, SubstrateError>;
    fn delete_filter(&mut self, native_filter_id: u64) -> Result<(), SubstrateError>;

    /// Resolve an executable path to a native application identity blob.
    fn resolve_process_identity(&self, path: &str) -> Option<Vec<u8>>;
}
