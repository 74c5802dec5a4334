#![forbid(unsafe_code)]

use onboard_kernel_contracts::ph1psync::{
    BeneficialOwnerRecord, CombinedStateUpdate, ContactRecord, PersonId, PersonSyncState,
    PsyncExternalEdit, PsyncGeneration, RecordKind, SigningOfficerRecord, UpdateOrigin,
};
use onboard_kernel_contracts::ContractViolation;
use onboard_storage::ph1f::{Ph1fStore, StorageError};
use onboard_storage::repo::Ph1PsyncRepo;

fn pid(id: &str) -> PersonId {
    PersonId::new(id).unwrap()
}

fn seeded_store() -> Ph1fStore {
    let mut s = Ph1fStore::new_in_memory();
    s.load_psync_state_row(PersonSyncState {
        contact: ContactRecord {
            person_id: Some(pid("p1")),
            first_name: "Ján".to_string(),
            last_name: "Novák".to_string(),
            email: "jan@x.sk".to_string(),
            ..Default::default()
        },
        signing_officers: vec![SigningOfficerRecord {
            id: Some(pid("p1")),
            first_name: "Ján".to_string(),
            last_name: "Novák".to_string(),
            ..Default::default()
        }],
        beneficial_owners: vec![BeneficialOwnerRecord {
            id: Some(pid("p1")),
            first_name: "Ján".to_string(),
            last_name: "Novák".to_string(),
            ..Default::default()
        }],
    })
    .unwrap();
    s
}

#[test]
fn at_psync_db_01_external_edit_enqueues_one_tagged_notice() {
    let mut s = seeded_store();
    let generation = s
        .psync_edit_signing_officer(&pid("p1"), |o| o.birth_date = "1991-02-02".to_string())
        .unwrap();

    let notice = s.take_psync_notice_row().unwrap();
    assert_eq!(notice.generation, generation);
    assert_eq!(notice.origin, UpdateOrigin::External);
    assert_eq!(notice.kinds, vec![RecordKind::SigningOfficer]);
    assert!(s.take_psync_notice_row().is_none());
    assert_eq!(s.psync_state_row().signing_officers[0].birth_date, "1991-02-02");
}

#[test]
fn at_psync_db_02_combined_update_is_a_single_propagated_write() {
    let mut s = seeded_store();
    let mut contact = s.psync_state_row().contact.clone();
    contact.last_name = "Horák".to_string();
    let mut owners = s.psync_state_row().beneficial_owners.clone();
    owners[0].last_name = "Horák".to_string();

    let generation = s
        .apply_psync_combined_update_row(&CombinedStateUpdate {
            contact: Some(contact),
            signing_officers: None,
            beneficial_owners: Some(owners),
        })
        .unwrap();

    let log = s.psync_write_log_rows();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].generation, generation);
    assert_eq!(log[0].origin, UpdateOrigin::Propagated);
    assert_eq!(
        log[0].kinds,
        vec![RecordKind::Contact, RecordKind::BeneficialOwner]
    );
    assert_eq!(s.psync_state_row().contact.last_name, "Horák");
    assert_eq!(s.psync_current_generation(), generation);
}

#[test]
fn at_psync_db_03_empty_combined_update_is_rejected_without_a_write() {
    let mut s = seeded_store();
    let err = s
        .apply_psync_combined_update_row(&CombinedStateUpdate::default())
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert!(s.psync_write_log_rows().is_empty());
    assert_eq!(s.psync_current_generation(), PsyncGeneration(0));
}

#[test]
fn at_psync_db_04_added_records_get_eager_ids_and_duplicates_fail() {
    let mut s = seeded_store();
    let id = s
        .add_psync_signing_officer_row(SigningOfficerRecord::default())
        .unwrap();
    assert!(id.as_str().starts_with("psn_"));
    assert_eq!(
        s.psync_state_row().signing_officers[1].id.as_ref(),
        Some(&id)
    );

    let dup = s
        .add_psync_beneficial_owner_row(BeneficialOwnerRecord {
            id: Some(pid("p1")),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(
        dup,
        StorageError::DuplicateKey {
            table: "psync_beneficial_owners",
            key: "p1".to_string(),
        }
    );
}

#[test]
fn at_psync_db_05_unknown_record_is_a_foreign_key_violation() {
    let mut s = seeded_store();
    assert!(matches!(
        s.psync_remove_beneficial_owner(&pid("ghost")),
        Err(StorageError::ForeignKeyViolation {
            table: "psync_beneficial_owners",
            ..
        })
    ));
    assert!(matches!(
        s.set_psync_link_flag_row(RecordKind::SigningOfficer, &pid("ghost"), true),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_psync_db_06_link_flag_write_is_silent_and_unlink_suppresses() {
    let mut s = seeded_store();
    assert!(s
        .set_psync_link_flag_row(RecordKind::BeneficialOwner, &pid("p1"), true)
        .unwrap());
    assert!(!s
        .set_psync_link_flag_row(RecordKind::BeneficialOwner, &pid("p1"), true)
        .unwrap());
    assert!(s
        .set_psync_link_flag_row(RecordKind::BeneficialOwner, &pid("p1"), false)
        .unwrap());

    let owner = &s.psync_state_row().beneficial_owners[0];
    assert!(!owner.linked_to_contact);
    assert!(owner.link_suppressed);
    assert!(s.take_psync_notice_row().is_none());
    assert!(s.psync_write_log_rows().is_empty());
}

#[test]
fn at_psync_db_07_invalid_collection_edit_leaves_state_untouched() {
    let mut s = seeded_store();
    let before = s.psync_state_row().clone();
    let err = s
        .apply_psync_external_edit_row(PsyncExternalEdit::SigningOfficers(vec![
            SigningOfficerRecord {
                id: Some(pid("p9")),
                ..Default::default()
            },
            SigningOfficerRecord {
                id: Some(pid("p9")),
                ..Default::default()
            },
        ]))
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::ContractViolation(ContractViolation::InvalidValue { .. })
    ));
    assert_eq!(s.psync_state_row(), &before);
    assert!(s.take_psync_notice_row().is_none());
}

#[test]
fn at_psync_db_08_remove_then_edit_contact_commits_in_generation_order() {
    let mut s = seeded_store();
    let g1 = s.psync_remove_signing_officer(&pid("p1")).unwrap();
    let g2 = s
        .psync_edit_contact(|c| c.phone = "900123456".to_string())
        .unwrap();
    assert!(g2 > g1);
    assert!(s.psync_state_row().signing_officers.is_empty());
    let kinds: Vec<RecordKind> = std::iter::from_fn(|| s.take_psync_notice_row())
        .flat_map(|n| n.kinds)
        .collect();
    assert_eq!(kinds, vec![RecordKind::SigningOfficer, RecordKind::Contact]);
}

#[test]
fn at_psync_db_09_id_less_collection_edit_keeps_stored_ids() {
    let mut s = Ph1fStore::new_in_memory();
    s.load_psync_state_row(PersonSyncState {
        signing_officers: vec![
            SigningOfficerRecord {
                first_name: "Ján".to_string(),
                ..Default::default()
            },
            SigningOfficerRecord {
                first_name: "Karol".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    })
    .unwrap();
    let ids: Vec<Option<PersonId>> = s
        .psync_state_row()
        .signing_officers
        .iter()
        .map(|o| o.id.clone())
        .collect();
    assert!(ids.iter().all(Option::is_some));

    // Same records resent without ids, second one renamed, one appended.
    s.apply_psync_external_edit_row(PsyncExternalEdit::SigningOfficers(vec![
        SigningOfficerRecord {
            first_name: "Ján".to_string(),
            ..Default::default()
        },
        SigningOfficerRecord {
            first_name: "Karolína".to_string(),
            ..Default::default()
        },
        SigningOfficerRecord::default(),
    ]))
    .unwrap();
    let officers = &s.psync_state_row().signing_officers;
    assert_eq!(officers[0].id, ids[0]);
    assert_eq!(officers[1].id, ids[1]);
    assert!(officers[2].id.is_some());
    assert_ne!(officers[2].id, ids[0]);
    assert_ne!(officers[2].id, ids[1]);

    // Dropping a record without ids cannot say which one went.
    let before = s.psync_state_row().clone();
    let err = s
        .apply_psync_external_edit_row(PsyncExternalEdit::SigningOfficers(vec![
            SigningOfficerRecord::default(),
        ]))
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert_eq!(s.psync_state_row(), &before);
}
