//! In-memory substrate adapter.
//!
//! Faithful to the native contract: session discipline, transactional
//! mutation with snapshot-based abort, `InUse` on deleting a populated
//! sublayer. Carries operation counters and an injectable fault plan so the
//! atomicity and idempotency properties of the engine are testable, and a
//! serializable state image so the CLI can run against a state file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use hostwall_core::{CompiledFilter, ExistingFilter};

use crate::substrate::{Substrate, SubstrateError};

/// One filter as stored by the substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFilter {
    pub native_id: u64,
    pub filter: CompiledFilter,
}

/// Serializable substrate state image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    pub provider_installed: bool,
    pub sublayer_installed: bool,
    pub next_filter_id: u64,
    pub filters: Vec<StoredFilter>,
}

/// Injectable failures, evaluated per transaction.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail the add after this many adds have succeeded in the transaction.
    pub fail_add_after: Option<usize>,
    /// Fail the delete after this many deletes have succeeded in the
    /// transaction.
    pub fail_delete_after: Option<usize>,
    /// Fail every commit.
    pub fail_commit: bool,
    /// Deny every transaction and infrastructure mutation.
    pub access_denied: bool,
}

/// Operation counters, cumulative over the substrate's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounters {
    pub transactions_started: usize,
    pub transactions_committed: usize,
    pub transactions_aborted: usize,
    pub filters_added: usize,
    pub filters_deleted: usize,
}

/// In-memory [`Substrate`] implementation.
#[derive(Debug, Default)]
pub struct MemorySubstrate {
    state: MemoryState,
    snapshot: Option<MemoryState>,
    session_open: bool,
    faults: FaultPlan,
    counters: OpCounters,
    adds_in_txn: usize,
    deletes_in_txn: usize,
    process_identities: HashMap<String, Vec<u8>>,
}

impl MemorySubstrate {
    /// Fresh substrate with nothing installed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Substrate resuming from a previously exported state image.
    #[must_use]
    pub fn from_state(state: MemoryState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Current state image (e.g. for writing back to a state file).
    #[must_use]
    pub const fn state(&self) -> &MemoryState {
        &self.state
    }

    /// Replace the fault plan.
    pub fn set_faults(&mut self, faults: FaultPlan) {
        self.faults = faults;
    }

    /// Lifetime operation counters.
    #[must_use]
    pub const fn counters(&self) -> OpCounters {
        self.counters
    }

    /// Register a path the substrate can resolve to an application identity.
    pub fn register_process_identity(&mut self, path: &str, identity: Vec<u8>) {
        self.process_identities.insert(path.to_string(), identity);
    }

    fn require_session(&self) -> Result<(), SubstrateError> {
        if self.session_open {
            Ok(())
        } else {
            Err(SubstrateError::Other("no open session".to_string()))
        }
    }

    fn require_transaction(&self) -> Result<(), SubstrateError> {
        if self.snapshot.is_some() {
            Ok(())
        } else {
            Err(SubstrateError::Other("no open transaction".to_string()))
        }
    }
}

impl Substrate for MemorySubstrate {
    fn open_session(&mut self) -> Result<(), SubstrateError> {
        if self.session_open {
            return Err(SubstrateError::Other("session already open".to_string()));
        }
        self.session_open = true;
        Ok(())
    }

    fn close_session(&mut self) {
        self.session_open = false;
    }

    fn provider_exists(&self) -> Result<bool, SubstrateError> {
        self.require_session()?;
        Ok(self.state.provider_installed)
    }

    fn sublayer_exists(&self) -> Result<bool, SubstrateError> {
        self.require_session()?;
        Ok(self.state.sublayer_installed)
    }

    fn create_provider(&mut self) -> Result<(), SubstrateError> {
        self.require_session()?;
        if self.faults.access_denied {
            return Err(SubstrateError::AccessDenied("create provider".to_string()));
        }
        if self.state.provider_installed {
            return Err(SubstrateError::AlreadyExists("provider".to_string()));
        }
        self.state.provider_installed = true;
        Ok(())
    }

    fn create_sublayer(&mut self) -> Result<(), SubstrateError> {
        self.require_session()?;
        if self.faults.access_denied {
            return Err(SubstrateError::AccessDenied("create sublayer".to_string()));
        }
        if self.state.sublayer_installed {
            return Err(SubstrateError::AlreadyExists("sublayer".to_string()));
        }
        self.state.sublayer_installed = true;
        Ok(())
    }

    fn delete_provider(&mut self) -> Result<(), SubstrateError> {
        self.require_session()?;
        if !self.state.provider_installed {
            return Err(SubstrateError::NotFound("provider".to_string()));
        }
        self.state.provider_installed = false;
        Ok(())
    }

    fn delete_sublayer(&mut self) -> Result<(), SubstrateError> {
        self.require_session()?;
        if !self.state.sublayer_installed {
            return Err(SubstrateError::NotFound("sublayer".to_string()));
        }
        if !self.state.filters.is_empty() {
            return Err(SubstrateError::InUse(format!(
                "sublayer holds {} filter(s)",
                self.state.filters.len()
            )));
        }
        self.state.sublayer_installed = false;
        Ok(())
    }

    fn enumerate_filters(&self) -> Result<Vec<ExistingFilter>, SubstrateError> {
        self.require_session()?;
        Ok(self
            .state
            .filters
            .iter()
            .map(|stored| ExistingFilter {
                filter_key: stored.filter.filter_key,
                native_filter_id: stored.native_id,
                display_name: stored.filter.display_name.clone(),
            })
            .collect())
    }

    fn begin_transaction(&mut self) -> Result<(), SubstrateError> {
        self.require_session()?;
        if self.faults.access_denied {
            return Err(SubstrateError::AccessDenied("begin transaction".to_string()));
        }
        if self.snapshot.is_some() {
            return Err(SubstrateError::Other(
                "transaction already open".to_string(),
            ));
        }
        self.snapshot = Some(self.state.clone());
        self.adds_in_txn = 0;
        self.deletes_in_txn = 0;
        self.counters.transactions_started += 1;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), SubstrateError> {
        self.require_session()?;
        self.require_transaction()?;
        if self.faults.fail_commit {
            return Err(SubstrateError::Other("injected commit failure".to_string()));
        }
        self.snapshot = None;
        self.counters.transactions_committed += 1;
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<(), SubstrateError> {
        self.require_session()?;
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| SubstrateError::Other("no open transaction".to_string()))?;
        self.state = snapshot;
        self.counters.transactions_aborted += 1;
        Ok(())
    }

    fn add_filter(&mut self, filter: &CompiledFilter) -> Result<u64, SubstrateError> {
        self.require_session()?;
        self.require_transaction()?;
        if self.faults.fail_add_after == Some(self.adds_in_txn) {
            return Err(SubstrateError::Other("injected add failure".to_string()));
        }
        self.state.next_filter_id += 1;
        let native_id = self.state.next_filter_id;
        self.state.filters.push(StoredFilter {
            native_id,
            filter: filter.clone(),
        });
        self.adds_in_txn += 1;
        self.counters.filters_added += 1;
        Ok(native_id)
    }

    fn delete_filter(&mut self, native_filter_id: u64) -> Result<(), SubstrateError> {
        self.require_session()?;
        self.require_transaction()?;
        if self.faults.fail_delete_after == Some(self.deletes_in_txn) {
            return Err(SubstrateError::Other("injected delete failure".to_string()));
        }
        let index = self
            .state
            .filters
            .iter()
            .position(|stored| stored.native_id == native_filter_id)
            .ok_or_else(|| {
                SubstrateError::NotFound(format!("filter {native_filter_id}"))
            })?;
        self.state.filters.remove(index);
        self.deletes_in_txn += 1;
        self.counters.filters_deleted += 1;
        Ok(())
    }

    fn resolve_process_identity(&self, path: &str) -> Option<Vec<u8>> {
        self.process_identities.get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_core::{Action, FilterDirection, FilterKey};

    fn filter(rule_id: &str) -> CompiledFilter {
        CompiledFilter {
            filter_key: FilterKey::derive(rule_id, 0),
            display_name: format!("hostwall {rule_id}#0 [deadbeefdeadbeef]"),
            description: String::new(),
            action: Action::Allow,
            weight: 32768,
            rule_id: rule_id.to_string(),
            protocol: 6,
            direction: FilterDirection::Outbound,
            remote_net: None,
            remote_port: None,
            local_net: None,
            local_port: None,
            process_path: None,
            process_identity: None,
        }
    }

    #[test]
    fn operations_require_an_open_session() {
        let substrate = MemorySubstrate::new();
        assert!(substrate.provider_exists().is_err());
        assert!(substrate.enumerate_filters().is_err());
    }

    #[test]
    fn mutations_require_an_open_transaction() {
        let mut substrate = MemorySubstrate::new();
        substrate.open_session().expect("session");
        assert!(substrate.add_filter(&filter("x")).is_err());
        assert!(substrate.delete_filter(1).is_err());
    }

    #[test]
    fn abort_restores_the_pre_transaction_state() {
        let mut substrate = MemorySubstrate::new();
        substrate.open_session().expect("session");
        substrate.begin_transaction().expect("begin");
        substrate.add_filter(&filter("a")).expect("add");
        substrate.commit_transaction().expect("commit");

        substrate.begin_transaction().expect("begin");
        substrate.add_filter(&filter("b")).expect("add");
        substrate.delete_filter(1).expect("delete");
        substrate.abort_transaction().expect("abort");

        let filters = substrate.enumerate_filters().expect("enumerate");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].native_filter_id, 1);
    }

    #[test]
    fn deleting_a_populated_sublayer_is_in_use() {
        let mut substrate = MemorySubstrate::new();
        substrate.open_session().expect("session");
        substrate.create_provider().expect("provider");
        substrate.create_sublayer().expect("sublayer");
        substrate.begin_transaction().expect("begin");
        substrate.add_filter(&filter("a")).expect("add");
        substrate.commit_transaction().expect("commit");
        assert!(matches!(
            substrate.delete_sublayer(),
            Err(SubstrateError::InUse(_))
        ));
    }

    #[test]
    fn double_create_is_already_exists() {
        let mut substrate = MemorySubstrate::new();
        substrate.open_session().expect("session");
        substrate.create_provider().expect("provider");
        assert!(matches!(
            substrate.create_provider(),
            Err(SubstrateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn state_image_round_trips_through_json() {
        let mut substrate = MemorySubstrate::new();
        substrate.open_session().expect("session");
        substrate.create_provider().expect("provider");
        substrate.create_sublayer().expect("sublayer");
        substrate.begin_transaction().expect("begin");
        substrate.add_filter(&filter("persisted")).expect("add");
        substrate.commit_transaction().expect("commit");

        let image = serde_json::to_string(substrate.state()).expect("serialize");
        let restored: MemoryState = serde_json::from_str(&image).expect("deserialize");
        let mut resumed = MemorySubstrate::from_state(restored);
        resumed.open_session().expect("session");
        assert_eq!(resumed.enumerate_filters().expect("enumerate").len(), 1);
    }
}
