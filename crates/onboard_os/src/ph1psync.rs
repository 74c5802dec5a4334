#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use onboard_engines::ph1psync::{
    reason_codes as engine_reason_codes, Ph1PsyncRuntime, LINK_FLAG_FIELD,
};
use onboard_kernel_contracts::ph1j::{
    AuditEngine, AuditEventInput, AuditEventType, AuditSeverity, CorrelationId, TurnId,
};
use onboard_kernel_contracts::ph1psync::{
    record_key, LinkMatchBasis, PersonId, Ph1PsyncRequest, Ph1PsyncResponse, PsyncCapabilityId,
    PsyncExternalEdit, PsyncGeneration, PsyncPropagateOk, PsyncPropagateRequest, PsyncRefuse,
    PsyncSnapshot, PsyncSnapshotBuildRequest, RecordKind, StateChangeNotice, UpdateOrigin,
};
use onboard_kernel_contracts::{ContractViolation, MonotonicTimeNs, ReasonCodeId, Validate};
use onboard_storage::ph1f::{Ph1fStore, StorageError};
use onboard_storage::ph1j::Ph1jRuntime;

pub mod reason_codes {
    use onboard_kernel_contracts::ReasonCodeId;

    // PH1.PSYNC OS wiring reason-code namespace. Values are placeholders until registry lock.
    pub const PH1_PSYNC_DEFERRED_GUARD_HELD: ReasonCodeId = ReasonCodeId(0x5053_0101);
    pub const PH1_PSYNC_LINK_CHANGED: ReasonCodeId = ReasonCodeId(0x5053_0102);
    pub const PH1_PSYNC_LOW_CONFIDENCE_LINK: ReasonCodeId = ReasonCodeId(0x5053_0103);
    pub const PH1_PSYNC_AMBIGUOUS_MATCH: ReasonCodeId = ReasonCodeId(0x5053_0104);
    pub const PH1_PSYNC_INTERNAL_PIPELINE_ERROR: ReasonCodeId = ReasonCodeId(0x5053_01F1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1PsyncWiringConfig {
    pub sync_enabled: bool,
    pub max_pump_steps: u16,
}

impl Ph1PsyncWiringConfig {
    pub fn mvp_v1(sync_enabled: bool) -> Self {
        Self {
            sync_enabled,
            max_pump_steps: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncTurnContext {
    pub correlation_id: CorrelationId,
    pub turn_id: TurnId,
    pub now: MonotonicTimeNs,
    pub tenant_id: Option<String>,
}

impl PsyncTurnContext {
    pub fn v1(
        correlation_id: CorrelationId,
        turn_id: TurnId,
        now: MonotonicTimeNs,
        tenant_id: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let ctx = Self {
            correlation_id,
            turn_id,
            now,
            tenant_id,
        };
        ctx.validate()?;
        Ok(ctx)
    }
}

impl Validate for PsyncTurnContext {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.correlation_id.validate()?;
        self.turn_id.validate()?;
        if self.now.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "psync_turn_context.now",
                reason: "must be > 0",
            });
        }
        if let Some(tenant_id) = &self.tenant_id {
            if tenant_id.trim().is_empty() || tenant_id.len() > 64 {
                return Err(ContractViolation::InvalidValue {
                    field: "psync_turn_context.tenant_id",
                    reason: "must be 1..=64 chars when provided",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncPropagationBundle {
    pub correlation_id: CorrelationId,
    pub turn_id: TurnId,
    pub trigger_generation: PsyncGeneration,
    pub write_generation: PsyncGeneration,
    pub propagate: PsyncPropagateOk,
    pub notification: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsyncWiringOutcome {
    NotInvokedDisabled,
    SkippedUnchanged {
        kind: RecordKind,
    },
    Deferred {
        kind: RecordKind,
        held_generation: PsyncGeneration,
    },
    EchoAbsorbed {
        generation: PsyncGeneration,
    },
    NoPeerChange {
        kind: RecordKind,
    },
    Propagated(PsyncPropagationBundle),
    Refused(PsyncRefuse),
}

pub trait Ph1PsyncEngine {
    fn run(&self, req: &Ph1PsyncRequest) -> Ph1PsyncResponse;
}

impl Ph1PsyncEngine for Ph1PsyncRuntime {
    fn run(&self, req: &Ph1PsyncRequest) -> Ph1PsyncResponse {
        Ph1PsyncRuntime::run(self, req)
    }
}

/// Held at the generation of the engine's own write until its `Propagated`
/// notice is seen. External kinds noticed meanwhile are re-detected on release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReentrancyGuard {
    held: Option<PsyncGeneration>,
    deferred: BTreeSet<RecordKind>,
}

impl ReentrancyGuard {
    pub fn held(&self) -> Option<PsyncGeneration> {
        self.held
    }

    fn hold(&mut self, generation: PsyncGeneration) {
        self.held = Some(generation);
    }

    fn release(&mut self) -> Vec<RecordKind> {
        self.held = None;
        let deferred = std::mem::take(&mut self.deferred);
        deferred.into_iter().collect()
    }

    fn defer(&mut self, kind: RecordKind) {
        self.deferred.insert(kind);
    }
}

#[derive(Debug, Clone)]
pub struct Ph1PsyncWiring<E>
where
    E: Ph1PsyncEngine,
{
    config: Ph1PsyncWiringConfig,
    engine: E,
    guard: ReentrancyGuard,
}

impl<E> Ph1PsyncWiring<E>
where
    E: Ph1PsyncEngine,
{
    pub fn new(config: Ph1PsyncWiringConfig, engine: E) -> Result<Self, ContractViolation> {
        if config.max_pump_steps == 0 || config.max_pump_steps > 4096 {
            return Err(ContractViolation::InvalidValue {
                field: "ph1psync_wiring_config.max_pump_steps",
                reason: "must be within 1..=4096",
            });
        }
        Ok(Self {
            config,
            engine,
            guard: ReentrancyGuard::default(),
        })
    }

    pub fn guard_held(&self) -> Option<PsyncGeneration> {
        self.guard.held()
    }

    pub fn bootstrap(&mut self, store: &mut Ph1fStore) -> Result<(), StorageError> {
        let snapshot = self.build_snapshot(store)?;
        store.psync_refresh_snapshot(snapshot);
        self.guard = ReentrancyGuard::default();
        Ok(())
    }

    pub fn run_edit(
        &mut self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        edit: PsyncExternalEdit,
    ) -> Result<Vec<PsyncWiringOutcome>, StorageError> {
        store.psync_apply_external_edit(edit)?;
        self.pump(store, ctx)
    }

    pub fn pump(
        &mut self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
    ) -> Result<Vec<PsyncWiringOutcome>, StorageError> {
        ctx.validate()?;
        let mut outcomes = Vec::new();
        for _ in 0..self.config.max_pump_steps {
            match store.psync_take_notice() {
                Some(notice) => outcomes.extend(self.handle_notice(store, ctx, &notice)?),
                None if self.guard.held().is_some() => {
                    let trigger = store.psync_current_generation();
                    for kind in self.guard.release() {
                        outcomes.push(self.detect(store, ctx, kind, trigger)?);
                    }
                }
                None => break,
            }
        }
        Ok(outcomes)
    }

    pub fn handle_notice(
        &mut self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        notice: &StateChangeNotice,
    ) -> Result<Vec<PsyncWiringOutcome>, StorageError> {
        ctx.validate()?;
        if !self.config.sync_enabled {
            return Ok(vec![PsyncWiringOutcome::NotInvokedDisabled]);
        }

        let mut outcomes = Vec::new();
        match notice.origin {
            UpdateOrigin::Propagated => {
                outcomes.push(PsyncWiringOutcome::EchoAbsorbed {
                    generation: notice.generation,
                });
                if self.guard.held() == Some(notice.generation) {
                    for kind in self.guard.release() {
                        outcomes.push(self.detect(store, ctx, kind, notice.generation)?);
                    }
                }
            }
            UpdateOrigin::External => {
                if let Some(held_generation) = self.guard.held() {
                    for kind in &notice.kinds {
                        self.guard.defer(*kind);
                        self.audit(
                            store,
                            ctx,
                            AuditEventType::PsyncDeferred,
                            AuditSeverity::Info,
                            reason_codes::PH1_PSYNC_DEFERRED_GUARD_HELD,
                            &[
                                ("source_kind", kind.as_str().to_string()),
                                ("held_generation", held_generation.0.to_string()),
                            ],
                            None,
                        )?;
                        outcomes.push(PsyncWiringOutcome::Deferred {
                            kind: *kind,
                            held_generation,
                        });
                    }
                } else {
                    for kind in &notice.kinds {
                        outcomes.push(self.detect(store, ctx, *kind, notice.generation)?);
                    }
                }
            }
        }
        Ok(outcomes)
    }

    pub fn link_person(
        &mut self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        kind: RecordKind,
        id: &PersonId,
    ) -> Result<bool, StorageError> {
        self.set_link(store, ctx, kind, id, true)
    }

    pub fn unlink_person(
        &mut self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        kind: RecordKind,
        id: &PersonId,
    ) -> Result<bool, StorageError> {
        self.set_link(store, ctx, kind, id, false)
    }

    fn set_link(
        &mut self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        kind: RecordKind,
        id: &PersonId,
        linked: bool,
    ) -> Result<bool, StorageError> {
        ctx.validate()?;
        let changed = store.psync_set_link_flag(kind, id, linked)?;
        if !changed {
            return Ok(false);
        }

        // Mirror the flag into the observed snapshot so it is not seen as an edit.
        let key = record_key(Some(id), 0);
        let fresh = self.build_snapshot(store)?;
        let mut observed = store.psync_snapshot().clone();
        if let Some(value) = fresh.collection(kind).field(&key, LINK_FLAG_FIELD) {
            observed
                .collection_mut(kind)
                .records
                .entry(key.clone())
                .or_default()
                .insert(LINK_FLAG_FIELD.to_string(), value.to_string());
        }
        store.psync_refresh_snapshot(observed);

        self.audit(
            store,
            ctx,
            AuditEventType::PsyncLinkChanged,
            AuditSeverity::Info,
            reason_codes::PH1_PSYNC_LINK_CHANGED,
            &[
                ("target_kind", kind.as_str().to_string()),
                ("record_key", key),
                ("linked", linked.to_string()),
            ],
            None,
        )?;
        Ok(true)
    }

    fn build_snapshot(&self, store: &Ph1fStore) -> Result<PsyncSnapshot, StorageError> {
        let req = Ph1PsyncRequest::SnapshotBuild(PsyncSnapshotBuildRequest::v1(
            store.psync_state().clone(),
        )?);
        let resp = self.engine.run(&req);
        resp.validate()?;
        match resp {
            Ph1PsyncResponse::SnapshotBuildOk(ok) => Ok(ok.snapshot),
            _ => Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "ph1psync_wiring.snapshot_build",
                    reason: "engine did not return a snapshot",
                },
            )),
        }
    }

    fn detect(
        &mut self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        kind: RecordKind,
        trigger_generation: PsyncGeneration,
    ) -> Result<PsyncWiringOutcome, StorageError> {
        let req = Ph1PsyncRequest::Propagate(PsyncPropagateRequest::v1(
            kind,
            store.psync_state().clone(),
            store.psync_snapshot().clone(),
        )?);
        let resp = self.engine.run(&req);
        resp.validate()?;

        let ok = match resp {
            Ph1PsyncResponse::Refuse(refuse) => return Ok(PsyncWiringOutcome::Refused(refuse)),
            Ph1PsyncResponse::PropagateOk(ok) => ok,
            Ph1PsyncResponse::SnapshotBuildOk(_) | Ph1PsyncResponse::ResolveLinksOk(_) => {
                return Ok(PsyncWiringOutcome::Refused(PsyncRefuse::v1(
                    PsyncCapabilityId::Propagate,
                    reason_codes::PH1_PSYNC_INTERNAL_PIPELINE_ERROR,
                    "unexpected response for propagate request".to_string(),
                )?))
            }
        };

        self.audit_link_quality(store, ctx, &ok)?;

        let Some(update) = ok.update.clone() else {
            let unchanged = ok.reason_code == engine_reason_codes::PH1_PSYNC_OK_SNAPSHOT_UNCHANGED;
            store.psync_refresh_snapshot(ok.post_snapshot);
            return Ok(if unchanged {
                PsyncWiringOutcome::SkippedUnchanged { kind }
            } else {
                PsyncWiringOutcome::NoPeerChange { kind }
            });
        };

        self.guard.hold(PsyncGeneration(
            store.psync_current_generation().0.saturating_add(1),
        ));
        let write_generation = match store.psync_apply_combined_update(&update) {
            Ok(generation) => generation,
            Err(err) => {
                self.guard.release();
                return Err(err);
            }
        };
        self.guard.hold(write_generation);
        store.psync_refresh_snapshot(ok.post_snapshot.clone());

        self.audit(
            store,
            ctx,
            AuditEventType::PsyncPropagated,
            AuditSeverity::Info,
            ok.reason_code,
            &[
                ("source_kind", kind.as_str().to_string()),
                ("generation", write_generation.0.to_string()),
                ("touched_records", ok.touched.len().to_string()),
                ("deferred_fields", ok.deferred_fields.to_string()),
                ("cascade", ok.cascade_applied.to_string()),
                ("snapshot_digest", ok.post_snapshot_digest.clone()),
            ],
            Some(format!("psync_propagated_{}", write_generation.0)),
        )?;

        let notification = sync_notification(kind, &ok);
        Ok(PsyncWiringOutcome::Propagated(PsyncPropagationBundle {
            correlation_id: ctx.correlation_id,
            turn_id: ctx.turn_id,
            trigger_generation,
            write_generation,
            propagate: ok,
            notification,
        }))
    }

    fn audit_link_quality(
        &self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        ok: &PsyncPropagateOk,
    ) -> Result<(), StorageError> {
        for ambiguous in &ok.ambiguous_matches {
            self.audit(
                store,
                ctx,
                AuditEventType::PsyncAmbiguousMatch,
                AuditSeverity::Warn,
                reason_codes::PH1_PSYNC_AMBIGUOUS_MATCH,
                &[
                    ("source_kind", ok.source.as_str().to_string()),
                    ("target_kind", ambiguous.target_kind.as_str().to_string()),
                    ("match_count", ambiguous.match_count.to_string()),
                    ("applied", ambiguous.applied.to_string()),
                ],
                None,
            )?;
        }
        for touched in ok
            .touched
            .iter()
            .filter(|t| t.basis == Some(LinkMatchBasis::Heuristic))
        {
            self.audit(
                store,
                ctx,
                AuditEventType::PsyncLowConfidenceLink,
                AuditSeverity::Warn,
                reason_codes::PH1_PSYNC_LOW_CONFIDENCE_LINK,
                &[
                    ("source_kind", ok.source.as_str().to_string()),
                    ("target_kind", touched.kind.as_str().to_string()),
                    ("record_key", touched.record_key.clone()),
                    ("match_basis", LinkMatchBasis::Heuristic.as_str().to_string()),
                ],
                None,
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        store: &mut Ph1fStore,
        ctx: &PsyncTurnContext,
        event_type: AuditEventType,
        severity: AuditSeverity,
        reason_code: ReasonCodeId,
        entries: &[(&str, String)],
        idempotency_key: Option<String>,
    ) -> Result<(), StorageError> {
        let payload_min = Ph1jRuntime::payload(entries)?;
        let ev = AuditEventInput::v1(
            ctx.now,
            ctx.tenant_id.clone(),
            AuditEngine::Ph1Psync,
            event_type,
            reason_code,
            severity,
            ctx.correlation_id,
            ctx.turn_id,
            payload_min,
            idempotency_key,
        )
        .map_err(StorageError::ContractViolation)?;
        Ph1jRuntime::emit(store, ev)?;
        Ok(())
    }
}

fn sync_notification(source: RecordKind, ok: &PsyncPropagateOk) -> String {
    let source = match source {
        RecordKind::Contact => "contact",
        RecordKind::SigningOfficer => "signing officer",
        RecordKind::BeneficialOwner => "beneficial owner",
    };
    let records = ok.touched.len();
    let noun = if records == 1 { "record" } else { "records" };
    format!("Person details synchronized from {source}: {records} linked {noun} updated.")
}
