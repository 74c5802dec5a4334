#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use onboard_kernel_contracts::ph1j::{
    AuditEventId, AuditEventInput, AuditPayloadMin, PayloadKey, PayloadValue,
};

use crate::ph1f::{Ph1fStore, StorageError};

/// PH1.J (Audit Engine) runtime wrapper.
///
/// PH1.J is a disciplined append-only writer into PH1.F's `audit_events` ledger.
#[derive(Debug, Default)]
pub struct Ph1jRuntime;

impl Ph1jRuntime {
    pub fn emit(
        store: &mut Ph1fStore,
        input: AuditEventInput,
    ) -> Result<AuditEventId, StorageError> {
        store.append_audit_event(input)
    }

    /// Builds a bounded payload from `(key, value)` pairs. Blank values are skipped.
    pub fn payload(entries: &[(&str, String)]) -> Result<AuditPayloadMin, StorageError> {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            if value.trim().is_empty() {
                continue;
            }
            map.insert(PayloadKey::new(*key)?, PayloadValue::new(value.clone())?);
        }
        Ok(AuditPayloadMin::v1(map)?)
    }
}
