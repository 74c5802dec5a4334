#![forbid(unsafe_code)]

use onboard_kernel_contracts::ph1j::{
    AuditEngine, AuditEventId, AuditEventInput, AuditEventType, AuditSeverity, CorrelationId,
    TurnId,
};
use onboard_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use onboard_storage::ph1f::{Ph1fStore, StorageError};
use onboard_storage::ph1j::Ph1jRuntime;
use onboard_storage::repo::Ph1jAuditRepo;

fn link_changed_input(
    tenant: &str,
    correlation_id: u128,
    idempotency_key: Option<&str>,
) -> AuditEventInput {
    AuditEventInput::v1(
        MonotonicTimeNs(10),
        Some(tenant.to_string()),
        AuditEngine::Ph1Psync,
        AuditEventType::PsyncLinkChanged,
        ReasonCodeId(0x5053_0101),
        AuditSeverity::Info,
        CorrelationId(correlation_id),
        TurnId(1),
        Ph1jRuntime::payload(&[
            ("target_kind", "SIGNING_OFFICER".to_string()),
            ("record_key", "id:p1".to_string()),
            ("linked", "true".to_string()),
        ])
        .unwrap(),
        idempotency_key.map(str::to_string),
    )
    .unwrap()
}

#[test]
fn at_j_db_01_tenant_isolation_enforced() {
    let mut s = Ph1fStore::new_in_memory();
    s.append_audit_row(link_changed_input("tenant_a", 100, Some("idem_a")))
        .unwrap();
    s.append_audit_row(link_changed_input("tenant_b", 100, Some("idem_b")))
        .unwrap();

    assert_eq!(s.audit_rows_by_tenant("tenant_a").len(), 1);
    assert_eq!(s.audit_rows_by_tenant("tenant_b").len(), 1);
    assert_eq!(s.audit_rows_by_correlation(CorrelationId(100)).len(), 2);
}

#[test]
fn at_j_db_02_append_only_enforced() {
    let mut s = Ph1fStore::new_in_memory();
    let id = s
        .append_audit_row(link_changed_input("tenant_a", 7, None))
        .unwrap();
    assert!(matches!(
        s.attempt_overwrite_audit_event(id),
        Err(StorageError::AppendOnlyViolation {
            table: "audit_events"
        })
    ));
    assert_eq!(s.audit_rows().len(), 1);
}

#[test]
fn at_j_db_03_idempotency_dedupe_returns_original_event() {
    let mut s = Ph1fStore::new_in_memory();
    let first = Ph1jRuntime::emit(&mut s, link_changed_input("tenant_a", 9, Some("k1"))).unwrap();
    let retry = Ph1jRuntime::emit(&mut s, link_changed_input("tenant_a", 9, Some("k1"))).unwrap();
    assert_eq!(first, retry);
    assert_eq!(first, AuditEventId(1));
    assert_eq!(s.audit_rows().len(), 1);

    // Same key under another correlation is a distinct event.
    Ph1jRuntime::emit(&mut s, link_changed_input("tenant_a", 10, Some("k1"))).unwrap();
    assert_eq!(s.audit_rows().len(), 2);
}

#[test]
fn at_j_db_04_payload_helper_skips_blank_values_and_rejects_bad_keys() {
    let payload = Ph1jRuntime::payload(&[
        ("target_kind", "BENEFICIAL_OWNER".to_string()),
        ("record_key", "  ".to_string()),
    ])
    .unwrap();
    assert_eq!(payload.entries.len(), 1);
    assert_eq!(payload.get("target_kind"), Some("BENEFICIAL_OWNER"));

    assert!(matches!(
        Ph1jRuntime::payload(&[("Bad Key", "x".to_string())]),
        Err(StorageError::ContractViolation(_))
    ));
}
