#![forbid(unsafe_code)]

use onboard_kernel_contracts::ph1j::{AuditEvent, AuditEventId, AuditEventInput, CorrelationId};
use onboard_kernel_contracts::ph1psync::{
    BeneficialOwnerRecord, CombinedStateUpdate, PersonId, PersonSyncState, PsyncExternalEdit,
    PsyncGeneration, PsyncSnapshot, RecordKind, SigningOfficerRecord, StateChangeNotice,
};

use crate::ph1f::{Ph1fStore, PsyncWriteRecord, StorageError};

/// Typed repository interface for PH1.PSYNC persistence wiring.
pub trait Ph1PsyncRepo {
    fn load_psync_state_row(&mut self, state: PersonSyncState) -> Result<(), StorageError>;
    fn psync_state_row(&self) -> &PersonSyncState;
    fn apply_psync_external_edit_row(
        &mut self,
        edit: PsyncExternalEdit,
    ) -> Result<PsyncGeneration, StorageError>;
    fn add_psync_signing_officer_row(
        &mut self,
        record: SigningOfficerRecord,
    ) -> Result<PersonId, StorageError>;
    fn add_psync_beneficial_owner_row(
        &mut self,
        record: BeneficialOwnerRecord,
    ) -> Result<PersonId, StorageError>;
    fn apply_psync_combined_update_row(
        &mut self,
        update: &CombinedStateUpdate,
    ) -> Result<PsyncGeneration, StorageError>;
    fn take_psync_notice_row(&mut self) -> Option<StateChangeNotice>;
    fn set_psync_link_flag_row(
        &mut self,
        kind: RecordKind,
        id: &PersonId,
        linked: bool,
    ) -> Result<bool, StorageError>;
    fn psync_snapshot_row(&self) -> &PsyncSnapshot;
    fn refresh_psync_snapshot_row(&mut self, snapshot: PsyncSnapshot);
    fn psync_write_log_rows(&self) -> &[PsyncWriteRecord];
}

/// Typed repository interface for PH1.J audit persistence wiring.
pub trait Ph1jAuditRepo {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError>;
    fn audit_rows(&self) -> &[AuditEvent];
    fn audit_rows_by_correlation(&self, correlation_id: CorrelationId) -> Vec<&AuditEvent>;
    fn audit_rows_by_tenant(&self, tenant_id: &str) -> Vec<&AuditEvent>;
}

impl Ph1PsyncRepo for Ph1fStore {
    fn load_psync_state_row(&mut self, state: PersonSyncState) -> Result<(), StorageError> {
        self.psync_load_state(state)
    }

    fn psync_state_row(&self) -> &PersonSyncState {
        self.psync_state()
    }

    fn apply_psync_external_edit_row(
        &mut self,
        edit: PsyncExternalEdit,
    ) -> Result<PsyncGeneration, StorageError> {
        self.psync_apply_external_edit(edit)
    }

    fn add_psync_signing_officer_row(
        &mut self,
        record: SigningOfficerRecord,
    ) -> Result<PersonId, StorageError> {
        self.psync_add_signing_officer(record)
    }

    fn add_psync_beneficial_owner_row(
        &mut self,
        record: BeneficialOwnerRecord,
    ) -> Result<PersonId, StorageError> {
        self.psync_add_beneficial_owner(record)
    }

    fn apply_psync_combined_update_row(
        &mut self,
        update: &CombinedStateUpdate,
    ) -> Result<PsyncGeneration, StorageError> {
        self.psync_apply_combined_update(update)
    }

    fn take_psync_notice_row(&mut self) -> Option<StateChangeNotice> {
        self.psync_take_notice()
    }

    fn set_psync_link_flag_row(
        &mut self,
        kind: RecordKind,
        id: &PersonId,
        linked: bool,
    ) -> Result<bool, StorageError> {
        self.psync_set_link_flag(kind, id, linked)
    }

    fn psync_snapshot_row(&self) -> &PsyncSnapshot {
        self.psync_snapshot()
    }

    fn refresh_psync_snapshot_row(&mut self, snapshot: PsyncSnapshot) {
        self.psync_refresh_snapshot(snapshot)
    }

    fn psync_write_log_rows(&self) -> &[PsyncWriteRecord] {
        self.psync_write_log()
    }
}

impl Ph1jAuditRepo for Ph1fStore {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError> {
        self.append_audit_event(input)
    }

    fn audit_rows(&self) -> &[AuditEvent] {
        self.audit_events()
    }

    fn audit_rows_by_correlation(&self, correlation_id: CorrelationId) -> Vec<&AuditEvent> {
        self.audit_events_by_correlation(correlation_id)
    }

    fn audit_rows_by_tenant(&self, tenant_id: &str) -> Vec<&AuditEvent> {
        self.audit_events_by_tenant(tenant_id)
    }
}
