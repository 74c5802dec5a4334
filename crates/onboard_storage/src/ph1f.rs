#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};

use onboard_kernel_contracts::ph1j::{AuditEvent, AuditEventId, AuditEventInput, CorrelationId};
use onboard_kernel_contracts::ph1psync::{
    BeneficialOwnerRecord, CombinedStateUpdate, ContactRecord, LinkableRecord, PersonId,
    PersonRecord, PersonSyncState, PsyncExternalEdit, PsyncGeneration, PsyncSnapshot,
    RecordKind, SigningOfficerRecord, StateChangeNotice, UpdateOrigin,
    PSYNC_MAX_RECORDS_PER_COLLECTION,
};
use onboard_kernel_contracts::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    ForeignKeyViolation { table: &'static str, key: String },
    DuplicateKey { table: &'static str, key: String },
    AppendOnlyViolation { table: &'static str },
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

/// One committed write to the person-sync tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncWriteRecord {
    pub generation: PsyncGeneration,
    pub origin: UpdateOrigin,
    pub kinds: Vec<RecordKind>,
}

/// In-memory PH1.F store.
///
/// Person-sync tables: the current merged state, the last-observed snapshot,
/// the pending state-change notice queue and a write log. Every committed
/// write bumps the generation and enqueues exactly one notice.
#[derive(Debug, Clone)]
pub struct Ph1fStore {
    psync_state: PersonSyncState,
    psync_snapshot: PsyncSnapshot,
    psync_notices: VecDeque<StateChangeNotice>,
    psync_write_log: Vec<PsyncWriteRecord>,
    next_psync_generation: u64,
    next_person_seq: u64,

    audit_events: Vec<AuditEvent>,
    next_audit_event_id: u64,
    // (correlation_id, idempotency_key) -> event_id
    audit_idempotency_index: BTreeMap<(CorrelationId, String), AuditEventId>,
}

impl Default for Ph1fStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

const TABLE_SIGNING_OFFICERS: &str = "psync_signing_officers";
const TABLE_BENEFICIAL_OWNERS: &str = "psync_beneficial_owners";

impl Ph1fStore {
    pub fn new_in_memory() -> Self {
        Self {
            psync_state: PersonSyncState::default(),
            psync_snapshot: PsyncSnapshot::default(),
            psync_notices: VecDeque::new(),
            psync_write_log: Vec::new(),
            next_psync_generation: 1,
            next_person_seq: 1,
            audit_events: Vec::new(),
            next_audit_event_id: 1,
            audit_idempotency_index: BTreeMap::new(),
        }
    }

    // ------------------------
    // PH1.PSYNC tables.
    // ------------------------

    pub fn psync_state(&self) -> &PersonSyncState {
        &self.psync_state
    }

    pub fn psync_snapshot(&self) -> &PsyncSnapshot {
        &self.psync_snapshot
    }

    pub fn psync_write_log(&self) -> &[PsyncWriteRecord] {
        &self.psync_write_log
    }

    pub fn psync_pending_notice_count(&self) -> usize {
        self.psync_notices.len()
    }

    /// Generation of the most recent committed write (0 before any write).
    pub fn psync_current_generation(&self) -> PsyncGeneration {
        PsyncGeneration(self.next_psync_generation.saturating_sub(1))
    }

    /// Replaces the whole state at session start. Resets the snapshot and the
    /// notice queue; nothing is enqueued, so the caller bootstraps the snapshot.
    pub fn psync_load_state(&mut self, mut state: PersonSyncState) -> Result<(), StorageError> {
        state.validate()?;
        self.assign_missing_ids(&mut state.signing_officers, &state.beneficial_owners)?;
        self.assign_missing_ids(&mut state.beneficial_owners, &state.signing_officers)?;
        self.psync_state = state;
        self.psync_snapshot = PsyncSnapshot::default();
        self.psync_notices.clear();
        Ok(())
    }

    /// Operator replacement of one whole collection. Id-less records keep the
    /// id stored at the same position; a shrinking collection must carry ids.
    pub fn psync_apply_external_edit(
        &mut self,
        edit: PsyncExternalEdit,
    ) -> Result<PsyncGeneration, StorageError> {
        let kind = edit.kind();
        let mut next = self.psync_state.clone();
        match edit {
            PsyncExternalEdit::Contact(contact) => next.contact = contact,
            PsyncExternalEdit::SigningOfficers(mut officers) => {
                carry_existing_ids(&mut officers, &next.signing_officers)?;
                let owners = next.beneficial_owners.clone();
                self.assign_missing_ids(&mut officers, &owners)?;
                next.signing_officers = officers;
            }
            PsyncExternalEdit::BeneficialOwners(mut owners) => {
                carry_existing_ids(&mut owners, &next.beneficial_owners)?;
                let officers = next.signing_officers.clone();
                self.assign_missing_ids(&mut owners, &officers)?;
                next.beneficial_owners = owners;
            }
        }
        next.validate()?;
        self.psync_state = next;
        Ok(self.commit(UpdateOrigin::External, vec![kind]))
    }

    pub fn psync_edit_contact(
        &mut self,
        edit: impl FnOnce(&mut ContactRecord),
    ) -> Result<PsyncGeneration, StorageError> {
        let mut contact = self.psync_state.contact.clone();
        edit(&mut contact);
        self.psync_apply_external_edit(PsyncExternalEdit::Contact(contact))
    }

    pub fn psync_edit_signing_officer(
        &mut self,
        id: &PersonId,
        edit: impl FnOnce(&mut SigningOfficerRecord),
    ) -> Result<PsyncGeneration, StorageError> {
        let mut officers = self.psync_state.signing_officers.clone();
        let index = position_by_id(&officers, id, TABLE_SIGNING_OFFICERS)?;
        edit(&mut officers[index]);
        self.psync_apply_external_edit(PsyncExternalEdit::SigningOfficers(officers))
    }

    pub fn psync_edit_beneficial_owner(
        &mut self,
        id: &PersonId,
        edit: impl FnOnce(&mut BeneficialOwnerRecord),
    ) -> Result<PsyncGeneration, StorageError> {
        let mut owners = self.psync_state.beneficial_owners.clone();
        let index = position_by_id(&owners, id, TABLE_BENEFICIAL_OWNERS)?;
        edit(&mut owners[index]);
        self.psync_apply_external_edit(PsyncExternalEdit::BeneficialOwners(owners))
    }

    /// Appends an officer, assigning a person id when the record has none.
    pub fn psync_add_signing_officer(
        &mut self,
        mut record: SigningOfficerRecord,
    ) -> Result<PersonId, StorageError> {
        let mut officers = self.psync_state.signing_officers.clone();
        let owners = self.psync_state.beneficial_owners.clone();
        let id = self.prepare_new_record(&mut record, &officers, &owners, TABLE_SIGNING_OFFICERS)?;
        officers.push(record);
        self.psync_apply_external_edit(PsyncExternalEdit::SigningOfficers(officers))?;
        Ok(id)
    }

    pub fn psync_add_beneficial_owner(
        &mut self,
        mut record: BeneficialOwnerRecord,
    ) -> Result<PersonId, StorageError> {
        let mut owners = self.psync_state.beneficial_owners.clone();
        let officers = self.psync_state.signing_officers.clone();
        let id = self.prepare_new_record(&mut record, &owners, &officers, TABLE_BENEFICIAL_OWNERS)?;
        owners.push(record);
        self.psync_apply_external_edit(PsyncExternalEdit::BeneficialOwners(owners))?;
        Ok(id)
    }

    pub fn psync_remove_signing_officer(
        &mut self,
        id: &PersonId,
    ) -> Result<PsyncGeneration, StorageError> {
        let mut officers = self.psync_state.signing_officers.clone();
        let index = position_by_id(&officers, id, TABLE_SIGNING_OFFICERS)?;
        officers.remove(index);
        self.psync_apply_external_edit(PsyncExternalEdit::SigningOfficers(officers))
    }

    pub fn psync_remove_beneficial_owner(
        &mut self,
        id: &PersonId,
    ) -> Result<PsyncGeneration, StorageError> {
        let mut owners = self.psync_state.beneficial_owners.clone();
        let index = position_by_id(&owners, id, TABLE_BENEFICIAL_OWNERS)?;
        owners.remove(index);
        self.psync_apply_external_edit(PsyncExternalEdit::BeneficialOwners(owners))
    }

    /// Commits one propagation pass as a single write tagged `Propagated`.
    pub fn psync_apply_combined_update(
        &mut self,
        update: &CombinedStateUpdate,
    ) -> Result<PsyncGeneration, StorageError> {
        update.validate()?;
        let mut next = self.psync_state.clone();
        update.apply_to(&mut next);
        next.validate()?;
        self.psync_state = next;
        Ok(self.commit(UpdateOrigin::Propagated, update.kinds()))
    }

    pub fn psync_take_notice(&mut self) -> Option<StateChangeNotice> {
        self.psync_notices.pop_front()
    }

    /// Sets or clears the link flag of one officer/owner without enqueuing a
    /// notice. Clearing also suppresses heuristic relinking. Returns whether
    /// the flag or the suppression changed.
    pub fn psync_set_link_flag(
        &mut self,
        kind: RecordKind,
        id: &PersonId,
        linked: bool,
    ) -> Result<bool, StorageError> {
        match kind {
            RecordKind::Contact => Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "psync_set_link_flag.kind",
                    reason: "contact carries no link flag",
                },
            )),
            RecordKind::SigningOfficer => set_link_flag(
                &mut self.psync_state.signing_officers,
                id,
                linked,
                TABLE_SIGNING_OFFICERS,
            ),
            RecordKind::BeneficialOwner => set_link_flag(
                &mut self.psync_state.beneficial_owners,
                id,
                linked,
                TABLE_BENEFICIAL_OWNERS,
            ),
        }
    }

    pub fn psync_refresh_snapshot(&mut self, snapshot: PsyncSnapshot) {
        self.psync_snapshot = snapshot;
    }

    fn commit(&mut self, origin: UpdateOrigin, kinds: Vec<RecordKind>) -> PsyncGeneration {
        let generation = PsyncGeneration(self.next_psync_generation);
        self.next_psync_generation = self.next_psync_generation.saturating_add(1);
        self.psync_write_log.push(PsyncWriteRecord {
            generation,
            origin,
            kinds: kinds.clone(),
        });
        self.psync_notices.push_back(StateChangeNotice {
            generation,
            origin,
            kinds,
        });
        generation
    }

    fn prepare_new_record<R: LinkableRecord, P: PersonRecord>(
        &mut self,
        record: &mut R,
        existing: &[R],
        peers: &[P],
        table: &'static str,
    ) -> Result<PersonId, StorageError> {
        if existing.len() >= PSYNC_MAX_RECORDS_PER_COLLECTION {
            return Err(StorageError::ContractViolation(
                ContractViolation::TooManyItems {
                    field: table,
                    max: PSYNC_MAX_RECORDS_PER_COLLECTION,
                    got: existing.len() + 1,
                },
            ));
        }
        if let Some(id) = record.record_id() {
            if existing.iter().any(|r| r.record_id() == Some(id)) {
                return Err(StorageError::DuplicateKey {
                    table,
                    key: id.as_str().to_string(),
                });
            }
            return Ok(id.clone());
        }
        let id = self.next_person_id(existing, peers)?;
        record.assign_record_id(id.clone());
        Ok(id)
    }

    fn assign_missing_ids<R: LinkableRecord, P: PersonRecord>(
        &mut self,
        records: &mut [R],
        peers: &[P],
    ) -> Result<(), StorageError> {
        for index in 0..records.len() {
            if records[index].record_id().is_none() {
                let id = self.next_person_id(records, peers)?;
                records[index].assign_record_id(id);
            }
        }
        Ok(())
    }

    /// Eager `psn_` id, unused in both dependent collections so that two
    /// unrelated records are never paired by a generated id.
    fn next_person_id<R: PersonRecord, P: PersonRecord>(
        &mut self,
        records: &[R],
        peers: &[P],
    ) -> Result<PersonId, StorageError> {
        loop {
            let id = PersonId::new(format!("psn_{:04}", self.next_person_seq))?;
            self.next_person_seq = self.next_person_seq.saturating_add(1);
            let taken = records.iter().any(|r| r.record_id() == Some(&id))
                || peers.iter().any(|r| r.record_id() == Some(&id))
                || self.psync_state.contact.person_id.as_ref() == Some(&id);
            if !taken {
                return Ok(id);
            }
        }
    }

    // ------------------------
    // PH1.J audit ledger (append-only).
    // ------------------------

    pub(crate) fn append_audit_event(
        &mut self,
        input: AuditEventInput,
    ) -> Result<AuditEventId, StorageError> {
        input.validate()?;

        if let Some(k) = &input.idempotency_key {
            if let Some(existing) = self
                .audit_idempotency_index
                .get(&(input.correlation_id, k.clone()))
            {
                return Ok(*existing);
            }
        }

        let event_id = AuditEventId(self.next_audit_event_id);
        self.next_audit_event_id = self.next_audit_event_id.saturating_add(1);

        let ev = AuditEvent::from_input_v1(event_id, input)?;
        if let Some(k) = &ev.idempotency_key {
            self.audit_idempotency_index
                .insert((ev.correlation_id, k.clone()), ev.event_id);
        }
        self.audit_events.push(ev);
        Ok(event_id)
    }

    pub fn audit_events(&self) -> &[AuditEvent] {
        &self.audit_events
    }

    pub fn attempt_overwrite_audit_event(
        &mut self,
        _event_id: AuditEventId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "audit_events",
        })
    }

    pub fn audit_events_by_correlation(&self, correlation_id: CorrelationId) -> Vec<&AuditEvent> {
        self.audit_events
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect()
    }

    pub fn audit_events_by_tenant(&self, tenant_id: &str) -> Vec<&AuditEvent> {
        self.audit_events
            .iter()
            .filter(|e| e.tenant_id.as_deref() == Some(tenant_id))
            .collect()
    }
}

fn position_by_id<R: PersonRecord>(
    records: &[R],
    id: &PersonId,
    table: &'static str,
) -> Result<usize, StorageError> {
    records
        .iter()
        .position(|r| r.record_id() == Some(id))
        .ok_or_else(|| StorageError::ForeignKeyViolation {
            table,
            key: id.as_str().to_string(),
        })
}

fn carry_existing_ids<R: LinkableRecord>(
    incoming: &mut [R],
    existing: &[R],
) -> Result<(), StorageError> {
    if incoming.iter().all(|r| r.record_id().is_some()) {
        return Ok(());
    }
    if incoming.len() < existing.len() && existing.iter().any(|r| r.record_id().is_some()) {
        return Err(StorageError::ContractViolation(
            ContractViolation::InvalidValue {
                field: "psync_external_edit.records",
                reason: "records must carry their id when the collection shrinks",
            },
        ));
    }
    for index in 0..incoming.len() {
        if incoming[index].record_id().is_some() {
            continue;
        }
        let Some(id) = existing.get(index).and_then(|r| r.record_id()).cloned() else {
            continue;
        };
        if incoming.iter().all(|r| r.record_id() != Some(&id)) {
            incoming[index].assign_record_id(id);
        }
    }
    Ok(())
}

fn set_link_flag<R: LinkableRecord>(
    records: &mut [R],
    id: &PersonId,
    linked: bool,
    table: &'static str,
) -> Result<bool, StorageError> {
    let index = position_by_id(records, id, table)?;
    let record = &mut records[index];
    let suppression_changed = record.link_suppressed() == linked;
    record.set_link_suppressed(!linked);
    let flag_changed = record.set_linked_to_contact(linked);
    Ok(flag_changed || suppression_changed)
}
