#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use onboard_kernel_contracts::ph1psync::{
    record_key, AmbiguousMatch, AnchorIdentity, BeneficialOwnerRecord, CollectionSnapshot,
    CombinedStateUpdate, ContactRecord, FieldValue, LinkMatchBasis, LinkResolution,
    LinkableRecord, PersonField, PersonId, PersonRecord, PersonSyncState, Ph1PsyncRequest,
    Ph1PsyncResponse, PsyncCapabilityId, PsyncPropagateOk, PsyncPropagateRequest,
    PsyncRefuse, PsyncResolveLinksOk, PsyncResolveLinksRequest, PsyncSnapshot,
    PsyncSnapshotBuildOk, PsyncSnapshotBuildRequest, RecordKind, RecordSnapshot,
    ResolvedLink, SigningOfficerRecord, TouchedRecord, PH1PSYNC_CONTRACT_VERSION,
    PSYNC_MAX_RECORDS_PER_COLLECTION,
};
use onboard_kernel_contracts::{ReasonCodeId, Validate};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

pub mod reason_codes {
    use onboard_kernel_contracts::ReasonCodeId;

    // PH1.PSYNC reason-code namespace. Values are placeholders until global registry lock.
    pub const PH1_PSYNC_OK_SNAPSHOT_BUILD: ReasonCodeId = ReasonCodeId(0x5053_0001);
    pub const PH1_PSYNC_OK_RESOLVE_LINKS: ReasonCodeId = ReasonCodeId(0x5053_0002);
    pub const PH1_PSYNC_OK_PROPAGATED: ReasonCodeId = ReasonCodeId(0x5053_0003);
    pub const PH1_PSYNC_OK_NO_PEER_CHANGE: ReasonCodeId = ReasonCodeId(0x5053_0004);
    pub const PH1_PSYNC_OK_SNAPSHOT_UNCHANGED: ReasonCodeId = ReasonCodeId(0x5053_0005);

    pub const PH1_PSYNC_INPUT_SCHEMA_INVALID: ReasonCodeId = ReasonCodeId(0x5053_00F1);
    pub const PH1_PSYNC_BUDGET_EXCEEDED: ReasonCodeId = ReasonCodeId(0x5053_00F2);
    pub const PH1_PSYNC_INTERNAL_PIPELINE_ERROR: ReasonCodeId = ReasonCodeId(0x5053_00F3);
}

pub const CONTACT_RECORD_KEY: &str = "contact";
pub const LINK_FLAG_FIELD: &str = "linkedToContact";

pub mod field_map {
    use onboard_kernel_contracts::ph1psync::{PersonField, RecordKind};

    const CONTACT_BASIC: &[PersonField] = &[
        PersonField::FirstName,
        PersonField::LastName,
        PersonField::Email,
        PersonField::Phone,
        PersonField::PhonePrefix,
    ];
    const OWNER_BASIC: &[PersonField] = &[PersonField::FirstName, PersonField::LastName];
    const LEGAL_IDENTITY: &[PersonField] = &[
        PersonField::BirthDate,
        PersonField::BirthPlace,
        PersonField::BirthNumber,
        PersonField::Citizenship,
        PersonField::PermanentAddress,
        PersonField::IsPoliticallyExposed,
    ];

    pub fn basic_fields(kind: RecordKind) -> &'static [PersonField] {
        match kind {
            RecordKind::Contact | RecordKind::SigningOfficer => CONTACT_BASIC,
            RecordKind::BeneficialOwner => OWNER_BASIC,
        }
    }

    pub fn extended_fields(kind: RecordKind) -> &'static [PersonField] {
        match kind {
            RecordKind::Contact => &[],
            RecordKind::SigningOfficer | RecordKind::BeneficialOwner => LEGAL_IDENTITY,
        }
    }

    pub fn watched_fields(kind: RecordKind) -> Vec<PersonField> {
        PersonField::ALL
            .into_iter()
            .filter(|f| basic_fields(kind).contains(f) || extended_fields(kind).contains(f))
            .collect()
    }

    pub fn shared_fields(a: RecordKind, b: RecordKind) -> Vec<PersonField> {
        let b_fields = watched_fields(b);
        watched_fields(a)
            .into_iter()
            .filter(|f| b_fields.contains(f))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1PsyncConfig {
    pub max_records_per_collection: u8,
    pub heuristic_matching: bool,
    pub apply_to_ambiguous_matches: bool,
}

impl Ph1PsyncConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_records_per_collection: PSYNC_MAX_RECORDS_PER_COLLECTION as u8,
            heuristic_matching: true,
            apply_to_ambiguous_matches: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ph1PsyncRuntime {
    config: Ph1PsyncConfig,
}

impl Ph1PsyncRuntime {
    pub fn new(config: Ph1PsyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Ph1PsyncConfig {
        self.config
    }

    pub fn run(&self, req: &Ph1PsyncRequest) -> Ph1PsyncResponse {
        if req.validate().is_err() {
            return self.refuse(
                capability_from_request(req),
                reason_codes::PH1_PSYNC_INPUT_SCHEMA_INVALID,
                "psync request failed contract validation",
            );
        }

        let state = match req {
            Ph1PsyncRequest::SnapshotBuild(r) => &r.state,
            Ph1PsyncRequest::ResolveLinks(r) => &r.state,
            Ph1PsyncRequest::Propagate(r) => &r.state,
        };
        let budget = self.config.max_records_per_collection as usize;
        if state.signing_officers.len() > budget || state.beneficial_owners.len() > budget {
            return self.refuse(
                capability_from_request(req),
                reason_codes::PH1_PSYNC_BUDGET_EXCEEDED,
                "record collection budget exceeded",
            );
        }

        match req {
            Ph1PsyncRequest::SnapshotBuild(r) => self.run_snapshot_build(r),
            Ph1PsyncRequest::ResolveLinks(r) => self.run_resolve_links(r),
            Ph1PsyncRequest::Propagate(r) => self.run_propagate(r),
        }
    }

    fn run_snapshot_build(&self, req: &PsyncSnapshotBuildRequest) -> Ph1PsyncResponse {
        let snapshot = match build_snapshot(&req.state) {
            Ok(snapshot) => snapshot,
            Err(_) => {
                return self.refuse(
                    PsyncCapabilityId::SnapshotBuild,
                    reason_codes::PH1_PSYNC_INTERNAL_PIPELINE_ERROR,
                    "failed to serialize watched fields",
                )
            }
        };
        match PsyncSnapshotBuildOk::v1(reason_codes::PH1_PSYNC_OK_SNAPSHOT_BUILD, snapshot) {
            Ok(ok) => Ph1PsyncResponse::SnapshotBuildOk(ok),
            Err(_) => self.refuse(
                PsyncCapabilityId::SnapshotBuild,
                reason_codes::PH1_PSYNC_INTERNAL_PIPELINE_ERROR,
                "failed to construct snapshot build output",
            ),
        }
    }

    fn run_resolve_links(&self, req: &PsyncResolveLinksRequest) -> Ph1PsyncResponse {
        let mut anchors = vec![AnchorIdentity::from_contact(&req.state.contact)];
        if let Some(previous) = &req.previous_anchor {
            anchors.push(previous.clone());
        }
        let mut resolution = resolve_links(&req.state, &anchors, self.config.heuristic_matching);
        self.settle_ambiguity(&mut resolution);

        match PsyncResolveLinksOk::v1(reason_codes::PH1_PSYNC_OK_RESOLVE_LINKS, resolution) {
            Ok(ok) => Ph1PsyncResponse::ResolveLinksOk(ok),
            Err(_) => self.refuse(
                PsyncCapabilityId::ResolveLinks,
                reason_codes::PH1_PSYNC_INTERNAL_PIPELINE_ERROR,
                "failed to construct link resolution output",
            ),
        }
    }

    fn run_propagate(&self, req: &PsyncPropagateRequest) -> Ph1PsyncResponse {
        match self.propagate(req) {
            Ok(ok) => Ph1PsyncResponse::PropagateOk(ok),
            Err(_) => self.refuse(
                PsyncCapabilityId::Propagate,
                reason_codes::PH1_PSYNC_INTERNAL_PIPELINE_ERROR,
                "propagation pass failed to produce a valid update",
            ),
        }
    }

    fn propagate(&self, req: &PsyncPropagateRequest) -> Result<PsyncPropagateOk, PassError> {
        let source_snapshot = collection_snapshot(req.source, &req.state)?;
        if &source_snapshot == req.previous_snapshot.collection(req.source) {
            let digest = snapshot_digest_hex(&source_snapshot)?;
            return Ok(PsyncPropagateOk::v1(
                reason_codes::PH1_PSYNC_OK_SNAPSHOT_UNCHANGED,
                req.source,
                None,
                req.previous_snapshot.clone(),
                digest,
                Vec::new(),
                0,
                Vec::new(),
                false,
            )?);
        }

        let mut pass = PropagationPass::new(self, req);
        match req.source {
            RecordKind::Contact => {
                let resolution = pass.resolve_against_anchor();
                pass.run_contact_fanout(&resolution)?;
            }
            RecordKind::SigningOfficer => {
                pass.run_peer_source::<SigningOfficerRecord, BeneficialOwnerRecord>()?;
                pass.run_cascade()?;
            }
            RecordKind::BeneficialOwner => {
                pass.run_peer_source::<BeneficialOwnerRecord, SigningOfficerRecord>()?;
                pass.run_cascade()?;
            }
        }
        pass.finish()
    }

    fn settle_ambiguity(&self, resolution: &mut LinkResolution) -> Vec<AmbiguousMatch> {
        let mut ambiguous = Vec::new();
        for kind in [RecordKind::SigningOfficer, RecordKind::BeneficialOwner] {
            let count = resolution.heuristic_count(kind);
            if count < 2 {
                continue;
            }
            let applied = self.config.apply_to_ambiguous_matches;
            if !applied {
                let links = match kind {
                    RecordKind::SigningOfficer => &mut resolution.officer_links,
                    _ => &mut resolution.owner_links,
                };
                links.retain(|link| !link.basis.is_low_confidence());
            }
            ambiguous.push(AmbiguousMatch {
                target_kind: kind,
                match_count: u8::try_from(count).unwrap_or(u8::MAX),
                applied,
            });
        }
        ambiguous
    }

    fn refuse(
        &self,
        capability_id: PsyncCapabilityId,
        reason_code: ReasonCodeId,
        message: &'static str,
    ) -> Ph1PsyncResponse {
        Ph1PsyncResponse::Refuse(PsyncRefuse {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            capability_id,
            reason_code,
            message: message.to_string(),
        })
    }
}

fn capability_from_request(req: &Ph1PsyncRequest) -> PsyncCapabilityId {
    match req {
        Ph1PsyncRequest::SnapshotBuild(_) => PsyncCapabilityId::SnapshotBuild,
        Ph1PsyncRequest::ResolveLinks(_) => PsyncCapabilityId::ResolveLinks,
        Ph1PsyncRequest::Propagate(_) => PsyncCapabilityId::Propagate,
    }
}

#[derive(Debug)]
enum PassError {
    Serialize,
    Contract,
}

impl From<serde_json::Error> for PassError {
    fn from(_: serde_json::Error) -> Self {
        PassError::Serialize
    }
}

impl From<onboard_kernel_contracts::ContractViolation> for PassError {
    fn from(_: onboard_kernel_contracts::ContractViolation) -> Self {
        PassError::Contract
    }
}

pub fn normalize_identity_text(raw: &str) -> String {
    raw.trim().nfc().collect::<String>().to_lowercase()
}

fn same_identity_text(a: &str, b: &str) -> bool {
    let a = normalize_identity_text(a);
    !a.is_empty() && a == normalize_identity_text(b)
}

fn same_full_name(a: (&str, &str), b: (&str, &str)) -> bool {
    let a = (normalize_identity_text(a.0), normalize_identity_text(a.1));
    let b = (normalize_identity_text(b.0), normalize_identity_text(b.1));
    !(a.0.is_empty() && a.1.is_empty()) && a == b
}

fn snapshot_text(record: Option<&RecordSnapshot>, field: PersonField) -> Option<String> {
    record
        .and_then(|r| r.get(field.as_str()))
        .and_then(|raw| serde_json::from_str::<String>(raw).ok())
}

fn snapshot_name(record: Option<&RecordSnapshot>) -> Option<(String, String)> {
    Some((
        snapshot_text(record, PersonField::FirstName)?,
        snapshot_text(record, PersonField::LastName)?,
    ))
}

trait PersonCollection: LinkableRecord + Clone {
    fn of(state: &PersonSyncState) -> &[Self];

    fn of_mut(state: &mut PersonSyncState) -> &mut Vec<Self>;

    fn matches_anchor_heuristically(
        &self,
        previous: Option<&RecordSnapshot>,
        anchor: &AnchorIdentity,
    ) -> bool;
}

impl PersonCollection for SigningOfficerRecord {
    fn of(state: &PersonSyncState) -> &[Self] {
        &state.signing_officers
    }

    fn of_mut(state: &mut PersonSyncState) -> &mut Vec<Self> {
        &mut state.signing_officers
    }

    fn matches_anchor_heuristically(
        &self,
        previous: Option<&RecordSnapshot>,
        anchor: &AnchorIdentity,
    ) -> bool {
        same_identity_text(&self.email, &anchor.email)
            || snapshot_text(previous, PersonField::Email)
                .is_some_and(|email| same_identity_text(&email, &anchor.email))
    }
}

impl PersonCollection for BeneficialOwnerRecord {
    fn of(state: &PersonSyncState) -> &[Self] {
        &state.beneficial_owners
    }

    fn of_mut(state: &mut PersonSyncState) -> &mut Vec<Self> {
        &mut state.beneficial_owners
    }

    fn matches_anchor_heuristically(
        &self,
        previous: Option<&RecordSnapshot>,
        anchor: &AnchorIdentity,
    ) -> bool {
        let anchor_name = (anchor.first_name.as_str(), anchor.last_name.as_str());
        same_full_name(self.full_name(), anchor_name)
            || snapshot_name(previous)
                .is_some_and(|(first, last)| same_full_name((first.as_str(), last.as_str()), anchor_name))
    }
}

fn resolve_collection<R: PersonCollection>(
    records: &[R],
    anchors: &[AnchorIdentity],
    heuristics: bool,
) -> Vec<ResolvedLink> {
    let anchor_id = anchors.first().and_then(|a| a.person_id.as_ref());
    records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let basis = if record.record_id().is_some() && record.record_id() == anchor_id {
                LinkMatchBasis::PersonId
            } else if record.linked_to_contact() {
                LinkMatchBasis::LinkFlag
            } else if heuristics
                && !record.link_suppressed()
                && anchors
                    .iter()
                    .any(|anchor| record.matches_anchor_heuristically(None, anchor))
            {
                LinkMatchBasis::Heuristic
            } else {
                return None;
            };
            Some(ResolvedLink {
                index,
                record_key: record_key(record.record_id(), index),
                basis,
            })
        })
        .collect()
}

/// Resolves which officers and owners denote the anchor person.
///
/// `anchors[0]` is the current contact; further anchors are earlier values of
/// the same contact and only take part in heuristic matching. Every record is
/// compared directly against the anchors, never against another record.
pub fn resolve_links(
    state: &PersonSyncState,
    anchors: &[AnchorIdentity],
    heuristics: bool,
) -> LinkResolution {
    LinkResolution {
        officer_links: resolve_collection(&state.signing_officers, anchors, heuristics),
        owner_links: resolve_collection(&state.beneficial_owners, anchors, heuristics),
    }
}

fn watched_snapshot<R: PersonRecord>(record: &R) -> Result<RecordSnapshot, serde_json::Error> {
    let mut fields = BTreeMap::new();
    for field in field_map::watched_fields(R::KIND) {
        if let Some(value) = record.field_value(field) {
            fields.insert(field.as_str().to_string(), serde_json::to_string(&value)?);
        }
    }
    let id_field = match R::KIND {
        RecordKind::Contact => "personId",
        _ => "id",
    };
    fields.insert(id_field.to_string(), serde_json::to_string(&record.record_id())?);
    Ok(fields)
}

fn linkable_snapshot<R: LinkableRecord>(record: &R) -> Result<RecordSnapshot, serde_json::Error> {
    let mut fields = watched_snapshot(record)?;
    fields.insert(
        LINK_FLAG_FIELD.to_string(),
        serde_json::to_string(&record.linked_to_contact())?,
    );
    Ok(fields)
}

pub fn contact_snapshot(contact: &ContactRecord) -> Result<CollectionSnapshot, serde_json::Error> {
    let mut records = BTreeMap::new();
    records.insert(CONTACT_RECORD_KEY.to_string(), watched_snapshot(contact)?);
    Ok(CollectionSnapshot { records })
}

pub fn records_snapshot<R: LinkableRecord>(
    records: &[R],
) -> Result<CollectionSnapshot, serde_json::Error> {
    let mut out = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        out.insert(
            record_key(record.record_id(), index),
            linkable_snapshot(record)?,
        );
    }
    Ok(CollectionSnapshot { records: out })
}

pub fn collection_snapshot(
    kind: RecordKind,
    state: &PersonSyncState,
) -> Result<CollectionSnapshot, serde_json::Error> {
    match kind {
        RecordKind::Contact => contact_snapshot(&state.contact),
        RecordKind::SigningOfficer => records_snapshot(&state.signing_officers),
        RecordKind::BeneficialOwner => records_snapshot(&state.beneficial_owners),
    }
}

pub fn build_snapshot(state: &PersonSyncState) -> Result<PsyncSnapshot, serde_json::Error> {
    Ok(PsyncSnapshot {
        contact: collection_snapshot(RecordKind::Contact, state)?,
        signing_officers: collection_snapshot(RecordKind::SigningOfficer, state)?,
        beneficial_owners: collection_snapshot(RecordKind::BeneficialOwner, state)?,
    })
}

pub fn snapshot_digest_hex(collection: &CollectionSnapshot) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(collection)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

pub fn anchor_from_snapshot(snapshot: &PsyncSnapshot) -> Option<AnchorIdentity> {
    let record = snapshot.contact.records.get(CONTACT_RECORD_KEY)?;
    let text = |field| snapshot_text(Some(record), field).unwrap_or_default();
    let person_id = record
        .get("personId")
        .and_then(|raw| serde_json::from_str::<Option<PersonId>>(raw).ok())
        .flatten();
    Some(AnchorIdentity {
        person_id,
        first_name: text(PersonField::FirstName),
        last_name: text(PersonField::LastName),
        email: text(PersonField::Email),
    })
}

fn shared_values<S: PersonRecord>(source: &S, target: RecordKind) -> Vec<(PersonField, FieldValue)> {
    field_map::shared_fields(S::KIND, target)
        .into_iter()
        .filter_map(|field| source.field_value(field).map(|value| (field, value)))
        .collect()
}

/// Copies `values` into `target`, skipping fields that carry an unobserved
/// edit: the pre-pass value differs from the snapshot entry in `guard`.
fn write_fields<T: PersonRecord>(
    target: &mut T,
    before: Option<&T>,
    guard: Option<&CollectionSnapshot>,
    key: &str,
    values: &[(PersonField, FieldValue)],
    deferred: &mut u16,
) -> Result<Vec<String>, serde_json::Error> {
    let mut written = Vec::new();
    for (field, value) in values {
        if target.field_value(*field).as_ref() == Some(value) {
            continue;
        }
        if let (Some(guard), Some(before)) = (guard, before) {
            let observed = guard.field(key, field.as_str());
            if let (Some(observed), Some(current)) = (observed, before.field_value(*field)) {
                if serde_json::to_string(&current)? != observed {
                    *deferred = deferred.saturating_add(1);
                    continue;
                }
            }
        }
        if target.set_field_value(*field, value) {
            written.push(field.as_str().to_string());
        }
    }
    Ok(written)
}

struct PropagationPass<'a> {
    runtime: &'a Ph1PsyncRuntime,
    source: RecordKind,
    before: &'a PersonSyncState,
    previous: &'a PsyncSnapshot,
    next: PersonSyncState,
    touched: BTreeMap<(RecordKind, String), TouchedRecord>,
    ambiguous: Vec<AmbiguousMatch>,
    deferred_fields: u16,
    cascade_applied: bool,
}

impl<'a> PropagationPass<'a> {
    fn new(runtime: &'a Ph1PsyncRuntime, req: &'a PsyncPropagateRequest) -> Self {
        Self {
            runtime,
            source: req.source,
            before: &req.state,
            previous: &req.previous_snapshot,
            next: req.state.clone(),
            touched: BTreeMap::new(),
            ambiguous: Vec::new(),
            deferred_fields: 0,
            cascade_applied: false,
        }
    }

    fn guard_for(&self, kind: RecordKind) -> Option<&'a CollectionSnapshot> {
        (kind != self.source).then(|| self.previous.collection(kind))
    }

    fn touch(
        &mut self,
        kind: RecordKind,
        key: &str,
        fields: Vec<String>,
        basis: Option<LinkMatchBasis>,
    ) {
        if fields.is_empty() {
            return;
        }
        let entry = self
            .touched
            .entry((kind, key.to_string()))
            .or_insert_with(|| TouchedRecord {
                kind,
                record_key: key.to_string(),
                fields: Vec::new(),
                basis,
            });
        for field in fields {
            if !entry.fields.contains(&field) {
                entry.fields.push(field);
            }
        }
    }

    fn resolve_against_anchor(&mut self) -> LinkResolution {
        let mut anchors = vec![AnchorIdentity::from_contact(&self.next.contact)];
        let pre_pass = AnchorIdentity::from_contact(&self.before.contact);
        let observed = anchor_from_snapshot(self.previous);
        for anchor in [Some(pre_pass), observed].into_iter().flatten() {
            if !anchors.contains(&anchor) {
                anchors.push(anchor);
            }
        }
        let mut resolution = resolve_links(
            &self.next,
            &anchors,
            self.runtime.config.heuristic_matching,
        );
        let ambiguous = self.runtime.settle_ambiguity(&mut resolution);
        self.ambiguous.extend(ambiguous);
        resolution
    }

    fn run_contact_fanout(&mut self, resolution: &LinkResolution) -> Result<(), serde_json::Error> {
        let contact = self.next.contact.clone();

        let officer_values = shared_values(&contact, RecordKind::SigningOfficer);
        let guard = self.guard_for(RecordKind::SigningOfficer);
        for link in &resolution.officer_links {
            let before = self.before.signing_officers.get(link.index);
            let Some(target) = self.next.signing_officers.get_mut(link.index) else {
                continue;
            };
            let mut fields = write_fields(
                target,
                before,
                guard,
                &link.record_key,
                &officer_values,
                &mut self.deferred_fields,
            )?;
            if target.set_linked_to_contact(true) {
                fields.push(LINK_FLAG_FIELD.to_string());
            }
            self.touch(
                RecordKind::SigningOfficer,
                &link.record_key,
                fields,
                Some(link.basis),
            );
        }

        let owner_values = shared_values(&contact, RecordKind::BeneficialOwner);
        let guard = self.guard_for(RecordKind::BeneficialOwner);
        for link in &resolution.owner_links {
            let before = self.before.beneficial_owners.get(link.index);
            let Some(target) = self.next.beneficial_owners.get_mut(link.index) else {
                continue;
            };
            let mut fields = write_fields(
                target,
                before,
                guard,
                &link.record_key,
                &owner_values,
                &mut self.deferred_fields,
            )?;
            if target.set_linked_to_contact(true) {
                fields.push(LINK_FLAG_FIELD.to_string());
            }
            self.touch(
                RecordKind::BeneficialOwner,
                &link.record_key,
                fields,
                Some(link.basis),
            );
        }
        Ok(())
    }

    fn run_peer_source<S, T>(&mut self) -> Result<(), serde_json::Error>
    where
        S: PersonCollection,
        T: PersonCollection,
    {
        let previous: &'a PsyncSnapshot = self.previous;
        let observed = previous.collection(S::KIND);
        let sources: Vec<S> = S::of(self.before).to_vec();
        for (index, source) in sources.iter().enumerate() {
            let key = record_key(source.record_id(), index);
            let previous_record = observed.records.get(&key);
            if previous_record == Some(&linkable_snapshot(source)?) {
                continue;
            }

            let peer_values = shared_values(source, T::KIND);
            let guard = self.guard_for(T::KIND);
            for (peer_index, basis) in paired_peers(source, previous_record, T::of(self.before)) {
                let before = T::of(self.before).get(peer_index);
                let peer_key = record_key(before.and_then(|r| r.record_id()), peer_index);
                let Some(target) = T::of_mut(&mut self.next).get_mut(peer_index) else {
                    continue;
                };
                let fields = write_fields(
                    target,
                    before,
                    guard,
                    &peer_key,
                    &peer_values,
                    &mut self.deferred_fields,
                )?;
                self.touch(T::KIND, &peer_key, fields, Some(basis));
            }

            if let Some(basis) = anchor_basis(source, previous_record, &self.before.contact) {
                let contact_values = shared_values(source, RecordKind::Contact);
                let guard = self.guard_for(RecordKind::Contact);
                let fields = write_fields(
                    &mut self.next.contact,
                    Some(&self.before.contact),
                    guard,
                    CONTACT_RECORD_KEY,
                    &contact_values,
                    &mut self.deferred_fields,
                )?;
                self.touch(RecordKind::Contact, CONTACT_RECORD_KEY, fields, Some(basis));
            }
        }
        Ok(())
    }

    fn run_cascade(&mut self) -> Result<(), serde_json::Error> {
        if self.next.contact == self.before.contact {
            return Ok(());
        }
        let resolution = self.resolve_against_anchor();
        self.run_contact_fanout(&resolution)?;
        self.cascade_applied = true;
        Ok(())
    }

    fn post_snapshot(&self) -> Result<PsyncSnapshot, serde_json::Error> {
        let mut post = self.previous.clone();
        *post.collection_mut(self.source) = collection_snapshot(self.source, &self.next)?;
        for touched in self.touched.values() {
            if touched.kind == self.source {
                continue;
            }
            let Some(current) = current_record_snapshot(&self.next, touched.kind, &touched.record_key)?
            else {
                continue;
            };
            let entry = post
                .collection_mut(touched.kind)
                .records
                .entry(touched.record_key.clone())
                .or_default();
            for field in &touched.fields {
                if let Some(value) = current.get(field) {
                    entry.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(post)
    }

    fn finish(self) -> Result<PsyncPropagateOk, PassError> {
        let post_snapshot = self.post_snapshot()?;
        let digest = snapshot_digest_hex(post_snapshot.collection(self.source))?;
        let update = CombinedStateUpdate::diff(self.before, &self.next);
        let touched: Vec<TouchedRecord> = self.touched.into_values().collect();
        let (update, reason_code) = if update.is_empty() {
            (None, reason_codes::PH1_PSYNC_OK_NO_PEER_CHANGE)
        } else {
            (Some(update), reason_codes::PH1_PSYNC_OK_PROPAGATED)
        };
        Ok(PsyncPropagateOk::v1(
            reason_code,
            self.source,
            update,
            post_snapshot,
            digest,
            touched,
            self.deferred_fields,
            self.ambiguous,
            self.cascade_applied,
        )?)
    }
}

fn current_record_snapshot(
    state: &PersonSyncState,
    kind: RecordKind,
    key: &str,
) -> Result<Option<RecordSnapshot>, serde_json::Error> {
    match kind {
        RecordKind::Contact => Ok(Some(watched_snapshot(&state.contact)?)),
        RecordKind::SigningOfficer => find_by_key(&state.signing_officers, key),
        RecordKind::BeneficialOwner => find_by_key(&state.beneficial_owners, key),
    }
}

fn find_by_key<R: LinkableRecord>(
    records: &[R],
    key: &str,
) -> Result<Option<RecordSnapshot>, serde_json::Error> {
    for (index, record) in records.iter().enumerate() {
        if record_key(record.record_id(), index) == key {
            return Ok(Some(linkable_snapshot(record)?));
        }
    }
    Ok(None)
}

fn paired_peers<S: LinkableRecord, T: LinkableRecord>(
    source: &S,
    previous: Option<&RecordSnapshot>,
    peers: &[T],
) -> Vec<(usize, LinkMatchBasis)> {
    if let Some(id) = source.record_id() {
        let by_id: Vec<_> = peers
            .iter()
            .enumerate()
            .filter(|(_, peer)| peer.record_id() == Some(id))
            .map(|(index, _)| (index, LinkMatchBasis::PersonId))
            .collect();
        if !by_id.is_empty() {
            return by_id;
        }
    }
    if !source.linked_to_contact() {
        return Vec::new();
    }
    let previous_name = snapshot_name(previous);
    peers
        .iter()
        .enumerate()
        .filter(|(_, peer)| {
            peer.linked_to_contact()
                && (same_full_name(peer.full_name(), source.full_name())
                    || previous_name
                        .as_ref()
                        .is_some_and(|(f, l)| same_full_name(peer.full_name(), (f.as_str(), l.as_str()))))
        })
        .map(|(index, _)| (index, LinkMatchBasis::LinkFlag))
        .collect()
}

fn anchor_basis<S: PersonCollection>(
    source: &S,
    previous: Option<&RecordSnapshot>,
    contact: &ContactRecord,
) -> Option<LinkMatchBasis> {
    if source.record_id().is_some() && source.record_id() == contact.person_id.as_ref() {
        return Some(LinkMatchBasis::PersonId);
    }
    if source.linked_to_contact()
        && source.matches_anchor_heuristically(previous, &AnchorIdentity::from_contact(contact))
    {
        return Some(LinkMatchBasis::LinkFlag);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use onboard_kernel_contracts::ph1psync::{
        PostalAddress, PsyncPropagateRequest, PsyncResolveLinksRequest,
        PsyncSnapshotBuildRequest,
    };

    fn runtime() -> Ph1PsyncRuntime {
        Ph1PsyncRuntime::new(Ph1PsyncConfig::mvp_v1())
    }

    fn pid(id: &str) -> Option<PersonId> {
        Some(PersonId::new(id).unwrap())
    }

    fn contact(first: &str, last: &str, email: &str) -> ContactRecord {
        ContactRecord {
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: email.to_string(),
            phone: "900123456".to_string(),
            phone_prefix: "+421".to_string(),
            ..Default::default()
        }
    }

    fn officer(id: Option<PersonId>, first: &str, last: &str, email: &str) -> SigningOfficerRecord {
        SigningOfficerRecord {
            id,
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: email.to_string(),
            ..Default::default()
        }
    }

    fn owner(id: Option<PersonId>, first: &str, last: &str) -> BeneficialOwnerRecord {
        BeneficialOwnerRecord {
            id,
            first_name: first.to_string(),
            last_name: last.to_string(),
            ..Default::default()
        }
    }

    fn propagate(
        rt: &Ph1PsyncRuntime,
        source: RecordKind,
        state: &PersonSyncState,
        previous: &PsyncSnapshot,
    ) -> PsyncPropagateOk {
        let req = Ph1PsyncRequest::Propagate(
            PsyncPropagateRequest::v1(source, state.clone(), previous.clone()).unwrap(),
        );
        match rt.run(&req) {
            Ph1PsyncResponse::PropagateOk(ok) => ok,
            other => panic!("expected PropagateOk, got {other:?}"),
        }
    }

    fn applied(state: &PersonSyncState, ok: &PsyncPropagateOk) -> PersonSyncState {
        let mut out = state.clone();
        if let Some(update) = &ok.update {
            update.apply_to(&mut out);
        }
        out
    }

    #[test]
    fn at_psync_01_field_map_is_total_and_shares_expected_fields() {
        assert!(field_map::extended_fields(RecordKind::Contact).is_empty());
        assert_eq!(
            field_map::shared_fields(RecordKind::Contact, RecordKind::BeneficialOwner),
            vec![PersonField::FirstName, PersonField::LastName]
        );
        assert_eq!(
            field_map::shared_fields(RecordKind::SigningOfficer, RecordKind::Contact).len(),
            5
        );
        assert_eq!(
            field_map::shared_fields(RecordKind::SigningOfficer, RecordKind::BeneficialOwner).len(),
            8
        );
        for kind in RecordKind::ALL {
            assert!(!field_map::watched_fields(kind).is_empty());
        }
    }

    #[test]
    fn at_psync_02_contact_rename_reaches_linked_officer_only_on_basic_fields() {
        let rt = runtime();
        let mut linked = officer(pid("p1"), "Ján", "Novák", "jan@x.sk");
        linked.linked_to_contact = true;
        linked.birth_date = "1990-01-01".to_string();
        let mut state = PersonSyncState {
            contact: contact("Ján", "Novák", "jan@x.sk"),
            signing_officers: vec![linked],
            ..Default::default()
        };
        let snapshot = build_snapshot(&state).unwrap();

        state.contact.first_name = "Peter".to_string();
        let ok = propagate(&rt, RecordKind::Contact, &state, &snapshot);
        assert_eq!(ok.reason_code, reason_codes::PH1_PSYNC_OK_PROPAGATED);
        let next = applied(&state, &ok);
        assert_eq!(next.signing_officers[0].first_name, "Peter");
        assert_eq!(next.signing_officers[0].birth_date, "1990-01-01");
        assert_eq!(ok.update.as_ref().unwrap().kinds(), vec![RecordKind::SigningOfficer]);
    }

    #[test]
    fn at_psync_03_officer_birth_date_reaches_owner_with_same_id_not_contact() {
        let rt = runtime();
        let mut officer_p1 = officer(pid("p1"), "Ján", "Novák", "");
        officer_p1.birth_date = "1990-01-01".to_string();
        let mut state = PersonSyncState {
            contact: contact("Mária", "Veselá", "maria@x.sk"),
            signing_officers: vec![officer_p1],
            beneficial_owners: vec![owner(pid("p1"), "Ján", "Novák")],
        };
        let snapshot = build_snapshot(&state).unwrap();

        state.signing_officers[0].birth_date = "1991-02-02".to_string();
        let ok = propagate(&rt, RecordKind::SigningOfficer, &state, &snapshot);
        let next = applied(&state, &ok);
        assert_eq!(next.beneficial_owners[0].birth_date, "1991-02-02");
        assert_eq!(next.contact, state.contact);
        assert!(!ok.cascade_applied);
    }

    #[test]
    fn at_psync_04_anchor_owner_rename_reaches_contact_and_linked_officer() {
        let rt = runtime();
        let mut anchor_contact = contact("Ján", "Novák", "jan@x.sk");
        anchor_contact.person_id = pid("p1");
        let mut linked = officer(pid("p2"), "Ján", "Novák", "jan@x.sk");
        linked.linked_to_contact = true;
        let mut state = PersonSyncState {
            contact: anchor_contact,
            signing_officers: vec![linked],
            beneficial_owners: vec![owner(pid("p1"), "Ján", "Novák")],
        };
        let snapshot = build_snapshot(&state).unwrap();

        state.beneficial_owners[0].last_name = "Horák".to_string();
        let ok = propagate(&rt, RecordKind::BeneficialOwner, &state, &snapshot);
        let next = applied(&state, &ok);
        assert_eq!(next.contact.last_name, "Horák");
        assert_eq!(next.signing_officers[0].last_name, "Horák");
        assert!(next.beneficial_owners[0].linked_to_contact);
        assert!(ok.cascade_applied);
        assert_eq!(ok.update.as_ref().unwrap().kinds(), RecordKind::ALL.to_vec());
    }

    #[test]
    fn at_psync_05_unlinked_new_officer_edit_changes_nothing_else() {
        let rt = runtime();
        let mut state = PersonSyncState {
            contact: contact("Ján", "Novák", "jan@x.sk"),
            beneficial_owners: vec![owner(pid("p1"), "Ján", "Novák")],
            ..Default::default()
        };
        state
            .signing_officers
            .push(officer(None, "Karol", "Malý", "karol@y.sk"));
        let snapshot = build_snapshot(&state).unwrap();

        state.signing_officers[0].first_name = "Karolína".to_string();
        let ok = propagate(&rt, RecordKind::SigningOfficer, &state, &snapshot);
        assert_eq!(ok.reason_code, reason_codes::PH1_PSYNC_OK_NO_PEER_CHANGE);
        assert!(ok.update.is_none());
        assert!(ok.touched.is_empty());
        assert_eq!(
            ok.post_snapshot.signing_officers,
            records_snapshot(&state.signing_officers).unwrap()
        );
    }

    #[test]
    fn at_psync_06_duplicate_named_owners_both_follow_anchor_rename() {
        let rt = runtime();
        let mut state = PersonSyncState {
            contact: contact("Eva", "Malá", "eva@x.sk"),
            beneficial_owners: vec![owner(None, "Eva", "Malá"), owner(None, "Eva", "Malá")],
            ..Default::default()
        };
        let snapshot = build_snapshot(&state).unwrap();

        state.contact.first_name = "Eva-Maria".to_string();
        let ok = propagate(&rt, RecordKind::Contact, &state, &snapshot);
        let next = applied(&state, &ok);
        assert!(next
            .beneficial_owners
            .iter()
            .all(|o| o.first_name == "Eva-Maria" && o.linked_to_contact));
        assert_eq!(
            ok.ambiguous_matches,
            vec![AmbiguousMatch {
                target_kind: RecordKind::BeneficialOwner,
                match_count: 2,
                applied: true,
            }]
        );
        assert!(ok
            .touched
            .iter()
            .all(|t| t.basis == Some(LinkMatchBasis::Heuristic)));
    }

    #[test]
    fn at_psync_07_ambiguous_matches_can_be_held_back_by_config() {
        let rt = Ph1PsyncRuntime::new(Ph1PsyncConfig {
            apply_to_ambiguous_matches: false,
            ..Ph1PsyncConfig::mvp_v1()
        });
        let mut state = PersonSyncState {
            contact: contact("Eva", "Malá", "eva@x.sk"),
            beneficial_owners: vec![owner(None, "Eva", "Malá"), owner(None, "Eva", "Malá")],
            ..Default::default()
        };
        let snapshot = build_snapshot(&state).unwrap();

        state.contact.first_name = "Eva-Maria".to_string();
        let ok = propagate(&rt, RecordKind::Contact, &state, &snapshot);
        assert!(ok.update.is_none());
        assert_eq!(ok.ambiguous_matches.len(), 1);
        assert!(!ok.ambiguous_matches[0].applied);
    }

    #[test]
    fn at_psync_08_second_pass_without_new_edit_is_a_no_op() {
        let rt = runtime();
        let mut linked = officer(pid("p1"), "Ján", "Novák", "jan@x.sk");
        linked.linked_to_contact = true;
        let mut state = PersonSyncState {
            contact: contact("Ján", "Novák", "jan@x.sk"),
            signing_officers: vec![linked],
            beneficial_owners: vec![owner(pid("p1"), "Ján", "Novák")],
        };
        let snapshot = build_snapshot(&state).unwrap();
        state.contact.email = "jan.novak@x.sk".to_string();

        let first = propagate(&rt, RecordKind::Contact, &state, &snapshot);
        let next = applied(&state, &first);
        for kind in RecordKind::ALL {
            let again = propagate(&rt, kind, &next, &first.post_snapshot);
            assert_eq!(
                again.reason_code,
                reason_codes::PH1_PSYNC_OK_SNAPSHOT_UNCHANGED,
                "{kind:?} re-detected the engine's own write"
            );
            assert!(again.update.is_none());
        }
    }

    #[test]
    fn at_psync_09_irrelevant_field_edit_does_not_trigger() {
        let rt = runtime();
        let mut state = PersonSyncState {
            contact: contact("Ján", "Novák", "jan@x.sk"),
            signing_officers: vec![officer(pid("p1"), "Ján", "Novák", "jan@x.sk")],
            beneficial_owners: vec![owner(pid("p1"), "Ján", "Novák")],
        };
        let snapshot = build_snapshot(&state).unwrap();

        state.signing_officers[0].id_document_number = "EA123456".to_string();
        state.beneficial_owners[0].ownership_share_bp = 2_500;
        for kind in [RecordKind::SigningOfficer, RecordKind::BeneficialOwner] {
            let ok = propagate(&rt, kind, &state, &snapshot);
            assert_eq!(ok.reason_code, reason_codes::PH1_PSYNC_OK_SNAPSHOT_UNCHANGED);
        }
    }

    #[test]
    fn at_psync_10_pending_operator_edit_is_not_overwritten_and_propagates_later() {
        let rt = runtime();
        let mut linked = officer(pid("p1"), "Ján", "Novák", "jan@x.sk");
        linked.linked_to_contact = true;
        linked.phone = "900123456".to_string();
        let mut state = PersonSyncState {
            contact: contact("Ján", "Novák", "jan@x.sk"),
            signing_officers: vec![linked],
            ..Default::default()
        };
        let snapshot = build_snapshot(&state).unwrap();

        // Both collections edited before either was observed.
        state.signing_officers[0].phone = "911000111".to_string();
        state.contact.phone = "944555666".to_string();

        let first = propagate(&rt, RecordKind::Contact, &state, &snapshot);
        assert_eq!(first.deferred_fields, 1);
        let next = applied(&state, &first);
        assert_eq!(next.signing_officers[0].phone, "911000111");

        let second = propagate(&rt, RecordKind::SigningOfficer, &next, &first.post_snapshot);
        let converged = applied(&next, &second);
        assert_eq!(converged.contact.phone, "911000111");
        assert_eq!(second.deferred_fields, 0);
    }

    #[test]
    fn at_psync_11_heuristic_officer_match_normalizes_email_and_is_low_confidence() {
        let rt = runtime();
        let state = PersonSyncState {
            contact: contact("Ján", "Novák", "Jan@X.sk "),
            signing_officers: vec![officer(pid("p7"), "J", "N", "jan@x.sk")],
            ..Default::default()
        };
        let req = Ph1PsyncRequest::ResolveLinks(
            PsyncResolveLinksRequest::v1(state.clone(), None).unwrap(),
        );
        let Ph1PsyncResponse::ResolveLinksOk(ok) = rt.run(&req) else {
            panic!("expected ResolveLinksOk");
        };
        assert_eq!(ok.resolution.officer_links.len(), 1);
        assert_eq!(ok.resolution.officer_links[0].basis, LinkMatchBasis::Heuristic);

        let off = Ph1PsyncRuntime::new(Ph1PsyncConfig {
            heuristic_matching: false,
            ..Ph1PsyncConfig::mvp_v1()
        });
        let Ph1PsyncResponse::ResolveLinksOk(ok) = off.run(&req) else {
            panic!("expected ResolveLinksOk");
        };
        assert!(ok.resolution.officer_links.is_empty());
    }

    #[test]
    fn at_psync_12_decomposed_diacritics_match_composed_names() {
        // "Ján" written with a combining acute accent.
        let decomposed = "Ja\u{301}n";
        assert!(same_full_name((decomposed, "Novák"), ("Ján", "NOVÁK")));
        assert!(!same_full_name(("", ""), ("", "")));
        assert!(!same_identity_text("  ", "  "));
    }

    #[test]
    fn at_psync_13_suppressed_record_does_not_relink_by_name() {
        let mut suppressed = owner(None, "Eva", "Malá");
        suppressed.link_suppressed = true;
        let state = PersonSyncState {
            contact: contact("Eva", "Malá", "eva@x.sk"),
            beneficial_owners: vec![suppressed],
            ..Default::default()
        };
        let resolution = resolve_links(
            &state,
            &[AnchorIdentity::from_contact(&state.contact)],
            true,
        );
        assert!(resolution.owner_links.is_empty());
    }

    #[test]
    fn at_psync_14_owner_extended_fields_reach_officer_by_flag_and_name() {
        let rt = runtime();
        let mut linked_officer = officer(pid("o1"), "Ján", "Novák", "jan@x.sk");
        linked_officer.linked_to_contact = true;
        let mut linked_owner = owner(pid("b1"), "Ján", "Novák");
        linked_owner.linked_to_contact = true;
        let mut state = PersonSyncState {
            contact: contact("Ján", "Novák", "jan@x.sk"),
            signing_officers: vec![linked_officer],
            beneficial_owners: vec![linked_owner],
        };
        let snapshot = build_snapshot(&state).unwrap();

        state.beneficial_owners[0].permanent_address = PostalAddress {
            street: "Hlavná 1".to_string(),
            city: "Nitra".to_string(),
            postal_code: "94901".to_string(),
            country: "SK".to_string(),
        };
        state.beneficial_owners[0].is_politically_exposed = true;
        let ok = propagate(&rt, RecordKind::BeneficialOwner, &state, &snapshot);
        let next = applied(&state, &ok);
        assert_eq!(next.signing_officers[0].permanent_address.city, "Nitra");
        assert!(next.signing_officers[0].is_politically_exposed);
        assert_eq!(ok.touched.len(), 1);
        assert_eq!(ok.touched[0].basis, Some(LinkMatchBasis::LinkFlag));
    }

    #[test]
    fn at_psync_15_snapshot_build_and_digest_are_deterministic() {
        let rt = runtime();
        let state = PersonSyncState {
            contact: contact("Ján", "Novák", "jan@x.sk"),
            signing_officers: vec![officer(None, "A", "B", "")],
            ..Default::default()
        };
        let req = Ph1PsyncRequest::SnapshotBuild(PsyncSnapshotBuildRequest::v1(state).unwrap());
        let Ph1PsyncResponse::SnapshotBuildOk(ok) = rt.run(&req) else {
            panic!("expected SnapshotBuildOk");
        };
        assert!(ok.snapshot.signing_officers.records.contains_key("idx:0"));
        assert!(ok.snapshot.signing_officers.field("idx:0", "idDocumentNumber").is_none());
        let a = snapshot_digest_hex(&ok.snapshot.signing_officers).unwrap();
        let b = snapshot_digest_hex(&ok.snapshot.signing_officers.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn at_psync_16_over_budget_collection_is_refused() {
        let rt = Ph1PsyncRuntime::new(Ph1PsyncConfig {
            max_records_per_collection: 1,
            ..Ph1PsyncConfig::mvp_v1()
        });
        let state = PersonSyncState {
            signing_officers: vec![officer(None, "A", "B", ""), officer(None, "C", "D", "")],
            ..Default::default()
        };
        let req = Ph1PsyncRequest::SnapshotBuild(PsyncSnapshotBuildRequest::v1(state).unwrap());
        let Ph1PsyncResponse::Refuse(refuse) = rt.run(&req) else {
            panic!("expected Refuse");
        };
        assert_eq!(refuse.reason_code, reason_codes::PH1_PSYNC_BUDGET_EXCEEDED);
        assert_eq!(refuse.capability_id, PsyncCapabilityId::SnapshotBuild);
    }

    #[test]
    fn at_psync_17_previous_snapshot_anchor_is_recovered() {
        let mut anchor = contact("Ján", "Novák", "jan@x.sk");
        anchor.person_id = pid("p1");
        let state = PersonSyncState {
            contact: anchor,
            ..Default::default()
        };
        let snapshot = build_snapshot(&state).unwrap();
        let recovered = anchor_from_snapshot(&snapshot).unwrap();
        assert_eq!(recovered, AnchorIdentity::from_contact(&state.contact));
    }
}
