#![forbid(unsafe_code)]

use onboard_engines::ph1psync::{build_snapshot, resolve_links, Ph1PsyncConfig, Ph1PsyncRuntime};
use onboard_kernel_contracts::ph1j::{CorrelationId, TurnId};
use onboard_kernel_contracts::ph1psync::{
    AnchorIdentity, BeneficialOwnerRecord, ContactRecord, PersonSyncState, PsyncExternalEdit,
    RecordKind, SigningOfficerRecord,
};
use onboard_kernel_contracts::{MonotonicTimeNs, Validate};
use onboard_os::ph1psync::{
    Ph1PsyncWiring, Ph1PsyncWiringConfig, PsyncTurnContext, PsyncWiringOutcome,
};
use onboard_storage::ph1f::Ph1fStore;
use serde_json::{json, Value};

pub const HEURISTICS_ENV_VAR: &str = "ONBOARD_PSYNC_HEURISTICS";

/// `0`, `off`, `false` and `no` disable name/email matching; anything else keeps the default.
pub fn engine_config_from_env_value(raw: Option<&str>) -> Ph1PsyncConfig {
    let mut config = Ph1PsyncConfig::mvp_v1();
    if let Some(raw) = raw {
        if matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "0" | "off" | "false" | "no"
        ) {
            config.heuristic_matching = false;
        }
    }
    config
}

pub fn execute_psync_command(
    config: Ph1PsyncConfig,
    subcommand: &str,
    state_json: &str,
    kind: Option<&str>,
    edit_json: Option<&str>,
) -> Result<String, String> {
    let state = parse_state(state_json)?;
    match subcommand {
        "snapshot" => {
            let snapshot =
                build_snapshot(&state).map_err(|e| format!("failed to build snapshot: {e}"))?;
            to_pretty(&json!({
                "contact": snapshot.contact,
                "signingOfficers": snapshot.signing_officers,
                "beneficialOwners": snapshot.beneficial_owners,
            }))
        }
        "resolve" => {
            let anchors = [AnchorIdentity::from_contact(&state.contact)];
            let resolution = resolve_links(&state, &anchors, config.heuristic_matching);
            to_pretty(&json!(resolution))
        }
        "edit" => {
            let raw_kind = kind.ok_or_else(|| "missing record kind".to_string())?;
            let kind = RecordKind::parse(raw_kind).ok_or_else(|| {
                format!("unknown record kind '{raw_kind}'. expected one of: contact, officer, owner")
            })?;
            let edit_json = edit_json.ok_or_else(|| "missing edit payload".to_string())?;
            let edit = parse_edit(kind, edit_json)?;
            run_edit(config, state, edit)
        }
        _ => Err(format!(
            "unknown psync subcommand: {subcommand}. expected one of: snapshot, resolve, edit"
        )),
    }
}

fn run_edit(
    config: Ph1PsyncConfig,
    state: PersonSyncState,
    edit: PsyncExternalEdit,
) -> Result<String, String> {
    let mut store = Ph1fStore::new_in_memory();
    store
        .psync_load_state(state)
        .map_err(|e| format!("failed to load state: {e:?}"))?;
    let mut wiring = Ph1PsyncWiring::new(
        Ph1PsyncWiringConfig::mvp_v1(true),
        Ph1PsyncRuntime::new(config),
    )
    .map_err(|e| format!("invalid wiring config: {e:?}"))?;
    wiring
        .bootstrap(&mut store)
        .map_err(|e| format!("failed to snapshot state: {e:?}"))?;

    let ctx = PsyncTurnContext::v1(CorrelationId(1), TurnId(1), MonotonicTimeNs(1), None)
        .map_err(|e| format!("invalid turn context: {e:?}"))?;
    let outcomes = wiring
        .run_edit(&mut store, &ctx, edit)
        .map_err(|e| format!("edit failed: {e:?}"))?;

    let notifications: Vec<&str> = outcomes
        .iter()
        .filter_map(|o| match o {
            PsyncWiringOutcome::Propagated(bundle) => Some(bundle.notification.as_str()),
            _ => None,
        })
        .collect();
    let outcome_lines: Vec<String> = outcomes.iter().map(describe_outcome).collect();
    to_pretty(&json!({
        "state": store.psync_state(),
        "notifications": notifications,
        "outcomes": outcome_lines,
    }))
}

fn describe_outcome(outcome: &PsyncWiringOutcome) -> String {
    match outcome {
        PsyncWiringOutcome::NotInvokedDisabled => "NOT_INVOKED_DISABLED".to_string(),
        PsyncWiringOutcome::SkippedUnchanged { kind } => format!("UNCHANGED {}", kind.as_str()),
        PsyncWiringOutcome::Deferred {
            kind,
            held_generation,
        } => format!("DEFERRED {} held={}", kind.as_str(), held_generation.0),
        PsyncWiringOutcome::EchoAbsorbed { generation } => {
            format!("ECHO_ABSORBED generation={}", generation.0)
        }
        PsyncWiringOutcome::NoPeerChange { kind } => format!("NO_PEER_CHANGE {}", kind.as_str()),
        PsyncWiringOutcome::Propagated(bundle) => format!(
            "PROPAGATED {} generation={} touched={} deferred_fields={}",
            bundle.propagate.source.as_str(),
            bundle.write_generation.0,
            bundle.propagate.touched.len(),
            bundle.propagate.deferred_fields
        ),
        PsyncWiringOutcome::Refused(refuse) => {
            format!("REFUSED reason=0x{:08X} {}", refuse.reason_code.0, refuse.message)
        }
    }
}

fn parse_state(raw: &str) -> Result<PersonSyncState, String> {
    let state: PersonSyncState =
        serde_json::from_str(raw).map_err(|e| format!("invalid state json: {e}"))?;
    state
        .validate()
        .map_err(|e| format!("invalid state: {e:?}"))?;
    Ok(state)
}

fn parse_edit(kind: RecordKind, raw: &str) -> Result<PsyncExternalEdit, String> {
    let invalid = |e: serde_json::Error| format!("invalid {} edit json: {e}", kind.as_str());
    Ok(match kind {
        RecordKind::Contact => {
            PsyncExternalEdit::Contact(serde_json::from_str::<ContactRecord>(raw).map_err(invalid)?)
        }
        RecordKind::SigningOfficer => PsyncExternalEdit::SigningOfficers(
            serde_json::from_str::<Vec<SigningOfficerRecord>>(raw).map_err(invalid)?,
        ),
        RecordKind::BeneficialOwner => PsyncExternalEdit::BeneficialOwners(
            serde_json::from_str::<Vec<BeneficialOwnerRecord>>(raw).map_err(invalid)?,
        ),
    })
}

fn to_pretty(value: &Value) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to render output: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: &str = r#"{
        "contact": {"firstName": "Ján", "lastName": "Novák", "email": "jan@x.sk"},
        "signingOfficers": [
            {"id": "p1", "firstName": "Ján", "lastName": "Novák", "email": "jan@x.sk", "linkedToContact": true}
        ],
        "beneficialOwners": [
            {"id": "b1", "firstName": "Jan", "lastName": "Novak"}
        ]
    }"#;

    #[test]
    fn at_psync_cli_01_contact_edit_reaches_linked_officer() {
        let out = execute_psync_command(
            Ph1PsyncConfig::mvp_v1(),
            "edit",
            STATE,
            Some("contact"),
            Some(r#"{"firstName": "Peter", "lastName": "Novák", "email": "jan@x.sk"}"#),
        )
        .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["state"]["signingOfficers"][0]["firstName"], "Peter");
        assert_eq!(v["state"]["beneficialOwners"][0]["firstName"], "Jan");
        assert_eq!(v["notifications"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn at_psync_cli_02_resolve_respects_heuristics_switch() {
        let on = execute_psync_command(
            engine_config_from_env_value(None),
            "resolve",
            STATE,
            None,
            None,
        )
        .unwrap();
        let off = execute_psync_command(
            engine_config_from_env_value(Some("off")),
            "resolve",
            STATE,
            None,
            None,
        )
        .unwrap();
        let on: Value = serde_json::from_str(&on).unwrap();
        let off: Value = serde_json::from_str(&off).unwrap();
        assert_eq!(on["officerLinks"][0]["basis"], "LINK_FLAG");
        assert_eq!(off["officerLinks"].as_array().unwrap().len(), 1);
        assert!(off["ownerLinks"].as_array().unwrap().is_empty());
    }

    #[test]
    fn at_psync_cli_03_bad_input_is_reported_not_panicked() {
        assert!(execute_psync_command(Ph1PsyncConfig::mvp_v1(), "edit", "{", None, None)
            .unwrap_err()
            .starts_with("invalid state json"));
        assert!(
            execute_psync_command(Ph1PsyncConfig::mvp_v1(), "edit", STATE, Some("board"), Some("{}"))
                .unwrap_err()
                .starts_with("unknown record kind")
        );
        assert!(execute_psync_command(Ph1PsyncConfig::mvp_v1(), "merge", STATE, None, None)
            .unwrap_err()
            .starts_with("unknown psync subcommand"));
    }

    #[test]
    fn at_psync_cli_04_snapshot_lists_watched_fields_per_record() {
        let out =
            execute_psync_command(Ph1PsyncConfig::mvp_v1(), "snapshot", STATE, None, None).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["contact"]["records"]["contact"]["firstName"], "\"Ján\"");
        assert_eq!(
            v["signingOfficers"]["records"]["id:p1"]["linkedToContact"],
            "true"
        );
    }

    #[test]
    fn at_psync_cli_05_id_less_edit_of_unlinked_officer_leaves_owner_untouched() {
        let state = r#"{
            "contact": {"firstName": "Ján", "lastName": "Novák", "email": "jan@x.sk"},
            "signingOfficers": [
                {"firstName": "Ján", "lastName": "Novák", "email": "jan@x.sk", "linkedToContact": true},
                {"firstName": "Karol", "lastName": "Malý", "email": "karol@y.sk"}
            ],
            "beneficialOwners": [
                {"firstName": "Ján", "lastName": "Novák", "birthDate": "1990-01-01", "linkedToContact": true}
            ]
        }"#;
        let edit = r#"[
            {"firstName": "Ján", "lastName": "Novák", "email": "jan@x.sk", "linkedToContact": true},
            {"firstName": "Karolína", "lastName": "Malý", "email": "karol@y.sk"}
        ]"#;
        let out = execute_psync_command(
            Ph1PsyncConfig::mvp_v1(),
            "edit",
            state,
            Some("officer"),
            Some(edit),
        )
        .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["state"]["beneficialOwners"][0]["birthDate"], "1990-01-01");
        assert_eq!(v["state"]["signingOfficers"][0]["birthDate"], "");
        assert_eq!(v["state"]["signingOfficers"][1]["firstName"], "Karolína");
        assert!(v["notifications"].as_array().unwrap().is_empty());
        assert_eq!(v["outcomes"][0], "NO_PEER_CHANGE SIGNING_OFFICER");
    }
}
