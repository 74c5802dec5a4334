#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const PH1J_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(pub u128);

impl Validate for CorrelationId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "correlation_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TurnId(pub u64);

impl Validate for TurnId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "turn_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuditEventId(pub u64);

impl Validate for AuditEventId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuditEngine {
    Ph1Psync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEventType {
    PsyncPropagated,
    PsyncDeferred,
    PsyncLowConfidenceLink,
    PsyncAmbiguousMatch,
    PsyncLinkChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditSeverity {
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PayloadKey(String);

fn is_ascii_lower_snake_key(s: &str) -> bool {
    let b = s.as_bytes();
    match b.first() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    b.iter()
        .skip(1)
        .all(|&c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_')
}

impl PayloadKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let key = Self(key.into());
        key.validate()?;
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be <= 64 chars",
            });
        }
        if !is_ascii_lower_snake_key(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadValue(String);

impl PayloadValue {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = Self(value.into());
        value.validate()?;
        Ok(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadValue {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must be <= 256 chars",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditPayloadMin {
    pub schema_version: SchemaVersion,
    pub entries: BTreeMap<PayloadKey, PayloadValue>,
}

impl AuditPayloadMin {
    pub fn empty_v1() -> Self {
        Self {
            schema_version: PH1J_CONTRACT_VERSION,
            entries: BTreeMap::new(),
        }
    }

    pub fn v1(entries: BTreeMap<PayloadKey, PayloadValue>) -> Result<Self, ContractViolation> {
        let p = Self {
            schema_version: PH1J_CONTRACT_VERSION,
            entries,
        };
        p.validate()?;
        Ok(p)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Validate for AuditPayloadMin {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1J_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_payload_min.schema_version",
                reason: "must match PH1J_CONTRACT_VERSION",
            });
        }
        if self.entries.len() > 16 {
            return Err(ContractViolation::TooManyItems {
                field: "audit_payload_min.entries",
                max: 16,
                got: self.entries.len(),
            });
        }
        let mut total_bytes: usize = 0;
        for (k, v) in &self.entries {
            k.validate()?;
            v.validate()?;
            total_bytes = total_bytes.saturating_add(k.as_str().len());
            total_bytes = total_bytes.saturating_add(v.as_str().len());
            if total_bytes > 2048 {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_payload_min",
                    reason: "total payload size must be <= 2048 bytes",
                });
            }
        }
        Ok(())
    }
}

fn allowed_payload_keys_for_event(event_type: AuditEventType) -> &'static [&'static str] {
    match event_type {
        AuditEventType::PsyncPropagated => &[
            "source_kind",
            "generation",
            "touched_records",
            "deferred_fields",
            "cascade",
            "snapshot_digest",
        ],
        AuditEventType::PsyncDeferred => &["source_kind", "held_generation"],
        AuditEventType::PsyncLowConfidenceLink => {
            &["source_kind", "target_kind", "record_key", "match_basis"]
        }
        AuditEventType::PsyncAmbiguousMatch => {
            &["source_kind", "target_kind", "match_count", "applied"]
        }
        AuditEventType::PsyncLinkChanged => &["target_kind", "record_key", "linked"],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEventInput {
    pub schema_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub tenant_id: Option<String>,
    pub engine: AuditEngine,
    pub event_type: AuditEventType,
    pub reason_code: ReasonCodeId,
    pub severity: AuditSeverity,
    pub correlation_id: CorrelationId,
    pub turn_id: TurnId,
    pub payload_min: AuditPayloadMin,
    /// Optional key to detect duplicate emissions deterministically.
    pub idempotency_key: Option<String>,
}

impl AuditEventInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        created_at: MonotonicTimeNs,
        tenant_id: Option<String>,
        engine: AuditEngine,
        event_type: AuditEventType,
        reason_code: ReasonCodeId,
        severity: AuditSeverity,
        correlation_id: CorrelationId,
        turn_id: TurnId,
        payload_min: AuditPayloadMin,
        idempotency_key: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: PH1J_CONTRACT_VERSION,
            created_at,
            tenant_id,
            engine,
            event_type,
            reason_code,
            severity,
            correlation_id,
            turn_id,
            payload_min,
            idempotency_key,
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for AuditEventInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1J_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.schema_version",
                reason: "must match PH1J_CONTRACT_VERSION",
            });
        }
        validate_event_common(
            "audit_event_input.created_at",
            "audit_event_input.tenant_id",
            "audit_event_input.reason_code",
            "audit_event_input.payload_min.entries",
            "audit_event_input.idempotency_key",
            EventCommon {
                created_at: self.created_at,
                tenant_id: self.tenant_id.as_deref(),
                event_type: self.event_type,
                reason_code: self.reason_code,
                correlation_id: self.correlation_id,
                turn_id: self.turn_id,
                payload_min: &self.payload_min,
                idempotency_key: self.idempotency_key.as_deref(),
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub schema_version: SchemaVersion,
    pub event_id: AuditEventId,
    pub created_at: MonotonicTimeNs,
    pub tenant_id: Option<String>,
    pub engine: AuditEngine,
    pub event_type: AuditEventType,
    pub reason_code: ReasonCodeId,
    pub severity: AuditSeverity,
    pub correlation_id: CorrelationId,
    pub turn_id: TurnId,
    pub payload_min: AuditPayloadMin,
    pub idempotency_key: Option<String>,
}

impl AuditEvent {
    pub fn from_input_v1(
        event_id: AuditEventId,
        input: AuditEventInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let e = Self {
            schema_version: PH1J_CONTRACT_VERSION,
            event_id,
            created_at: input.created_at,
            tenant_id: input.tenant_id,
            engine: input.engine,
            event_type: input.event_type,
            reason_code: input.reason_code,
            severity: input.severity,
            correlation_id: input.correlation_id,
            turn_id: input.turn_id,
            payload_min: input.payload_min,
            idempotency_key: input.idempotency_key,
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for AuditEvent {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1J_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event.schema_version",
                reason: "must match PH1J_CONTRACT_VERSION",
            });
        }
        self.event_id.validate()?;
        validate_event_common(
            "audit_event.created_at",
            "audit_event.tenant_id",
            "audit_event.reason_code",
            "audit_event.payload_min.entries",
            "audit_event.idempotency_key",
            EventCommon {
                created_at: self.created_at,
                tenant_id: self.tenant_id.as_deref(),
                event_type: self.event_type,
                reason_code: self.reason_code,
                correlation_id: self.correlation_id,
                turn_id: self.turn_id,
                payload_min: &self.payload_min,
                idempotency_key: self.idempotency_key.as_deref(),
            },
        )
    }
}

struct EventCommon<'a> {
    created_at: MonotonicTimeNs,
    tenant_id: Option<&'a str>,
    event_type: AuditEventType,
    reason_code: ReasonCodeId,
    correlation_id: CorrelationId,
    turn_id: TurnId,
    payload_min: &'a AuditPayloadMin,
    idempotency_key: Option<&'a str>,
}

fn validate_event_common(
    created_at_field: &'static str,
    tenant_field: &'static str,
    reason_code_field: &'static str,
    payload_field: &'static str,
    idempotency_field: &'static str,
    e: EventCommon<'_>,
) -> Result<(), ContractViolation> {
    if e.created_at.0 == 0 {
        return Err(ContractViolation::InvalidValue {
            field: created_at_field,
            reason: "must be > 0",
        });
    }
    if let Some(t) = e.tenant_id {
        if t.trim().is_empty() || t.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: tenant_field,
                reason: "must be 1..=64 chars when provided",
            });
        }
    }
    if e.reason_code.0 == 0 {
        return Err(ContractViolation::InvalidValue {
            field: reason_code_field,
            reason: "must be > 0",
        });
    }
    e.correlation_id.validate()?;
    e.turn_id.validate()?;
    e.payload_min.validate()?;
    let allowed = allowed_payload_keys_for_event(e.event_type);
    for k in e.payload_min.entries.keys() {
        if !allowed.contains(&k.as_str()) {
            return Err(ContractViolation::InvalidValue {
                field: payload_field,
                reason: "contains unapproved key for this event_type",
            });
        }
    }
    if let Some(k) = e.idempotency_key {
        if k.trim().is_empty() || k.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: idempotency_field,
                reason: "must be 1..=128 chars when provided",
            });
        }
    }
    Ok(())
}
