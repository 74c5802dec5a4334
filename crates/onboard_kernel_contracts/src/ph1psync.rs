#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::common::validate_free_text;
use crate::{ContractViolation, ReasonCodeId, SchemaVersion, Validate};

pub const PH1PSYNC_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const PSYNC_MAX_RECORDS_PER_COLLECTION: usize = 64;

const PSYNC_MAX_TEXT_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Contact,
    SigningOfficer,
    BeneficialOwner,
}

impl RecordKind {
    /// Dependency order of the sync graph: the anchor first, then its dependents.
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Contact,
        RecordKind::SigningOfficer,
        RecordKind::BeneficialOwner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Contact => "CONTACT",
            RecordKind::SigningOfficer => "SIGNING_OFFICER",
            RecordKind::BeneficialOwner => "BENEFICIAL_OWNER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CONTACT" => Some(RecordKind::Contact),
            "SIGNING_OFFICER" | "OFFICER" => Some(RecordKind::SigningOfficer),
            "BENEFICIAL_OWNER" | "OWNER" => Some(RecordKind::BeneficialOwner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonId(String);

impl PersonId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PersonId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "person_id",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "person_id",
                reason: "must be <= 64 chars",
            });
        }
        if !self.0.chars().all(|c| c.is_ascii_graphic()) {
            return Err(ContractViolation::InvalidValue {
                field: "person_id",
                reason: "must be printable ASCII without spaces",
            });
        }
        Ok(())
    }
}

/// Stable snapshot key for a record: its person id, or its position when it has none yet.
pub fn record_key(id: Option<&PersonId>, index: usize) -> String {
    match id {
        Some(id) => format!("id:{}", id.as_str()),
        None => format!("idx:{index}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PersonField {
    FirstName,
    LastName,
    Email,
    Phone,
    PhonePrefix,
    BirthDate,
    BirthPlace,
    BirthNumber,
    Citizenship,
    PermanentAddress,
    IsPoliticallyExposed,
}

impl PersonField {
    pub const ALL: [PersonField; 11] = [
        PersonField::FirstName,
        PersonField::LastName,
        PersonField::Email,
        PersonField::Phone,
        PersonField::PhonePrefix,
        PersonField::BirthDate,
        PersonField::BirthPlace,
        PersonField::BirthNumber,
        PersonField::Citizenship,
        PersonField::PermanentAddress,
        PersonField::IsPoliticallyExposed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PersonField::FirstName => "firstName",
            PersonField::LastName => "lastName",
            PersonField::Email => "email",
            PersonField::Phone => "phone",
            PersonField::PhonePrefix => "phonePrefix",
            PersonField::BirthDate => "birthDate",
            PersonField::BirthPlace => "birthPlace",
            PersonField::BirthNumber => "birthNumber",
            PersonField::Citizenship => "citizenship",
            PersonField::PermanentAddress => "permanentAddress",
            PersonField::IsPoliticallyExposed => "isPoliticallyExposed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostalAddress {
    pub street: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
}

impl Validate for PostalAddress {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_free_text(
            "postal_address.street",
            &self.street,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text("postal_address.city", &self.city, PSYNC_MAX_TEXT_LEN)?;
        validate_free_text("postal_address.postal_code", &self.postal_code, 16)?;
        validate_free_text("postal_address.country", &self.country, 64)?;
        Ok(())
    }
}

/// One propagatable value, shaped after the field it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Text(String),
    Address(PostalAddress),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

fn set_text(slot: &mut String, value: &FieldValue) -> bool {
    match value {
        FieldValue::Text(v) if slot != v => {
            slot.clone_from(v);
            true
        }
        _ => false,
    }
}

fn set_flag(slot: &mut bool, value: &FieldValue) -> bool {
    match value {
        FieldValue::Flag(v) if slot != v => {
            *slot = *v;
            true
        }
        _ => false,
    }
}

fn set_address(slot: &mut PostalAddress, value: &FieldValue) -> bool {
    match value {
        FieldValue::Address(v) if slot != v => {
            slot.clone_from(v);
            true
        }
        _ => false,
    }
}

/// Uniform field access over the three record shapes.
///
/// `field_value` returns `None` for fields the shape does not carry, and
/// `set_field_value` ignores them (returning `false`), so callers can walk any
/// field list without knowing the concrete record type.
pub trait PersonRecord {
    const KIND: RecordKind;

    fn record_id(&self) -> Option<&PersonId>;

    fn field_value(&self, field: PersonField) -> Option<FieldValue>;

    /// Writes `value` if the shape carries `field` and the value differs. Returns whether it changed.
    fn set_field_value(&mut self, field: PersonField, value: &FieldValue) -> bool;
}

/// Officer and owner records can be linked to the contact anchor.
pub trait LinkableRecord: PersonRecord {
    fn linked_to_contact(&self) -> bool;

    fn set_linked_to_contact(&mut self, linked: bool) -> bool;

    fn link_suppressed(&self) -> bool;

    fn set_link_suppressed(&mut self, suppressed: bool);

    fn assign_record_id(&mut self, id: PersonId);

    fn full_name(&self) -> (&str, &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactRecord {
    pub person_id: Option<PersonId>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub phone_prefix: String,
}

impl PersonRecord for ContactRecord {
    const KIND: RecordKind = RecordKind::Contact;

    fn record_id(&self) -> Option<&PersonId> {
        self.person_id.as_ref()
    }

    fn field_value(&self, field: PersonField) -> Option<FieldValue> {
        let text = match field {
            PersonField::FirstName => &self.first_name,
            PersonField::LastName => &self.last_name,
            PersonField::Email => &self.email,
            PersonField::Phone => &self.phone,
            PersonField::PhonePrefix => &self.phone_prefix,
            _ => return None,
        };
        Some(FieldValue::Text(text.clone()))
    }

    fn set_field_value(&mut self, field: PersonField, value: &FieldValue) -> bool {
        match field {
            PersonField::FirstName => set_text(&mut self.first_name, value),
            PersonField::LastName => set_text(&mut self.last_name, value),
            PersonField::Email => set_text(&mut self.email, value),
            PersonField::Phone => set_text(&mut self.phone, value),
            PersonField::PhonePrefix => set_text(&mut self.phone_prefix, value),
            _ => false,
        }
    }
}

impl Validate for ContactRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(id) = &self.person_id {
            id.validate()?;
        }
        validate_free_text(
            "contact_record.first_name",
            &self.first_name,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text(
            "contact_record.last_name",
            &self.last_name,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text("contact_record.email", &self.email, PSYNC_MAX_TEXT_LEN)?;
        validate_free_text("contact_record.phone", &self.phone, 32)?;
        validate_free_text("contact_record.phone_prefix", &self.phone_prefix, 8)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SigningOfficerRecord {
    pub id: Option<PersonId>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub phone_prefix: String,
    pub birth_date: String,
    pub birth_place: String,
    pub birth_number: String,
    pub citizenship: String,
    pub permanent_address: PostalAddress,
    pub is_politically_exposed: bool,
    pub linked_to_contact: bool,
    pub link_suppressed: bool,
    pub id_document_number: String,
}

impl PersonRecord for SigningOfficerRecord {
    const KIND: RecordKind = RecordKind::SigningOfficer;

    fn record_id(&self) -> Option<&PersonId> {
        self.id.as_ref()
    }

    fn field_value(&self, field: PersonField) -> Option<FieldValue> {
        let text = match field {
            PersonField::FirstName => &self.first_name,
            PersonField::LastName => &self.last_name,
            PersonField::Email => &self.email,
            PersonField::Phone => &self.phone,
            PersonField::PhonePrefix => &self.phone_prefix,
            PersonField::BirthDate => &self.birth_date,
            PersonField::BirthPlace => &self.birth_place,
            PersonField::BirthNumber => &self.birth_number,
            PersonField::Citizenship => &self.citizenship,
            PersonField::PermanentAddress => {
                return Some(FieldValue::Address(self.permanent_address.clone()))
            }
            PersonField::IsPoliticallyExposed => {
                return Some(FieldValue::Flag(self.is_politically_exposed))
            }
        };
        Some(FieldValue::Text(text.clone()))
    }

    fn set_field_value(&mut self, field: PersonField, value: &FieldValue) -> bool {
        match field {
            PersonField::FirstName => set_text(&mut self.first_name, value),
            PersonField::LastName => set_text(&mut self.last_name, value),
            PersonField::Email => set_text(&mut self.email, value),
            PersonField::Phone => set_text(&mut self.phone, value),
            PersonField::PhonePrefix => set_text(&mut self.phone_prefix, value),
            PersonField::BirthDate => set_text(&mut self.birth_date, value),
            PersonField::BirthPlace => set_text(&mut self.birth_place, value),
            PersonField::BirthNumber => set_text(&mut self.birth_number, value),
            PersonField::Citizenship => set_text(&mut self.citizenship, value),
            PersonField::PermanentAddress => set_address(&mut self.permanent_address, value),
            PersonField::IsPoliticallyExposed => set_flag(&mut self.is_politically_exposed, value),
        }
    }
}

impl LinkableRecord for SigningOfficerRecord {
    fn linked_to_contact(&self) -> bool {
        self.linked_to_contact
    }

    fn set_linked_to_contact(&mut self, linked: bool) -> bool {
        let changed = self.linked_to_contact != linked;
        self.linked_to_contact = linked;
        changed
    }

    fn link_suppressed(&self) -> bool {
        self.link_suppressed
    }

    fn set_link_suppressed(&mut self, suppressed: bool) {
        self.link_suppressed = suppressed;
    }

    fn assign_record_id(&mut self, id: PersonId) {
        self.id = Some(id);
    }

    fn full_name(&self) -> (&str, &str) {
        (&self.first_name, &self.last_name)
    }
}

impl Validate for SigningOfficerRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(id) = &self.id {
            id.validate()?;
        }
        validate_free_text(
            "signing_officer_record.first_name",
            &self.first_name,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text(
            "signing_officer_record.last_name",
            &self.last_name,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text(
            "signing_officer_record.email",
            &self.email,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text("signing_officer_record.phone", &self.phone, 32)?;
        validate_free_text("signing_officer_record.phone_prefix", &self.phone_prefix, 8)?;
        validate_free_text("signing_officer_record.birth_date", &self.birth_date, 32)?;
        validate_free_text(
            "signing_officer_record.birth_place",
            &self.birth_place,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text("signing_officer_record.birth_number", &self.birth_number, 32)?;
        validate_free_text("signing_officer_record.citizenship", &self.citizenship, 64)?;
        validate_free_text(
            "signing_officer_record.id_document_number",
            &self.id_document_number,
            64,
        )?;
        self.permanent_address.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeneficialOwnerRecord {
    pub id: Option<PersonId>,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: String,
    pub birth_place: String,
    pub birth_number: String,
    pub citizenship: String,
    pub permanent_address: PostalAddress,
    pub is_politically_exposed: bool,
    pub linked_to_contact: bool,
    pub link_suppressed: bool,
    /// Ownership share in basis points (0..=10000).
    pub ownership_share_bp: u16,
    pub id_document_number: String,
}

impl PersonRecord for BeneficialOwnerRecord {
    const KIND: RecordKind = RecordKind::BeneficialOwner;

    fn record_id(&self) -> Option<&PersonId> {
        self.id.as_ref()
    }

    fn field_value(&self, field: PersonField) -> Option<FieldValue> {
        let text = match field {
            PersonField::FirstName => &self.first_name,
            PersonField::LastName => &self.last_name,
            PersonField::BirthDate => &self.birth_date,
            PersonField::BirthPlace => &self.birth_place,
            PersonField::BirthNumber => &self.birth_number,
            PersonField::Citizenship => &self.citizenship,
            PersonField::PermanentAddress => {
                return Some(FieldValue::Address(self.permanent_address.clone()))
            }
            PersonField::IsPoliticallyExposed => {
                return Some(FieldValue::Flag(self.is_politically_exposed))
            }
            PersonField::Email | PersonField::Phone | PersonField::PhonePrefix => return None,
        };
        Some(FieldValue::Text(text.clone()))
    }

    fn set_field_value(&mut self, field: PersonField, value: &FieldValue) -> bool {
        match field {
            PersonField::FirstName => set_text(&mut self.first_name, value),
            PersonField::LastName => set_text(&mut self.last_name, value),
            PersonField::BirthDate => set_text(&mut self.birth_date, value),
            PersonField::BirthPlace => set_text(&mut self.birth_place, value),
            PersonField::BirthNumber => set_text(&mut self.birth_number, value),
            PersonField::Citizenship => set_text(&mut self.citizenship, value),
            PersonField::PermanentAddress => set_address(&mut self.permanent_address, value),
            PersonField::IsPoliticallyExposed => set_flag(&mut self.is_politically_exposed, value),
            PersonField::Email | PersonField::Phone | PersonField::PhonePrefix => false,
        }
    }
}

impl LinkableRecord for BeneficialOwnerRecord {
    fn linked_to_contact(&self) -> bool {
        self.linked_to_contact
    }

    fn set_linked_to_contact(&mut self, linked: bool) -> bool {
        let changed = self.linked_to_contact != linked;
        self.linked_to_contact = linked;
        changed
    }

    fn link_suppressed(&self) -> bool {
        self.link_suppressed
    }

    fn set_link_suppressed(&mut self, suppressed: bool) {
        self.link_suppressed = suppressed;
    }

    fn assign_record_id(&mut self, id: PersonId) {
        self.id = Some(id);
    }

    fn full_name(&self) -> (&str, &str) {
        (&self.first_name, &self.last_name)
    }
}

impl Validate for BeneficialOwnerRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(id) = &self.id {
            id.validate()?;
        }
        validate_free_text(
            "beneficial_owner_record.first_name",
            &self.first_name,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text(
            "beneficial_owner_record.last_name",
            &self.last_name,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text("beneficial_owner_record.birth_date", &self.birth_date, 32)?;
        validate_free_text(
            "beneficial_owner_record.birth_place",
            &self.birth_place,
            PSYNC_MAX_TEXT_LEN,
        )?;
        validate_free_text(
            "beneficial_owner_record.birth_number",
            &self.birth_number,
            32,
        )?;
        validate_free_text("beneficial_owner_record.citizenship", &self.citizenship, 64)?;
        validate_free_text(
            "beneficial_owner_record.id_document_number",
            &self.id_document_number,
            64,
        )?;
        if self.ownership_share_bp > 10_000 {
            return Err(ContractViolation::InvalidValue {
                field: "beneficial_owner_record.ownership_share_bp",
                reason: "must be <= 10000",
            });
        }
        self.permanent_address.validate()?;
        Ok(())
    }
}

/// The merged state object exchanged with the form layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersonSyncState {
    pub contact: ContactRecord,
    pub signing_officers: Vec<SigningOfficerRecord>,
    pub beneficial_owners: Vec<BeneficialOwnerRecord>,
}

impl Validate for PersonSyncState {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.contact.validate()?;
        validate_collection(
            "person_sync_state.signing_officers",
            &self.signing_officers,
        )?;
        validate_collection(
            "person_sync_state.beneficial_owners",
            &self.beneficial_owners,
        )?;
        Ok(())
    }
}

fn validate_collection<R>(field: &'static str, records: &[R]) -> Result<(), ContractViolation>
where
    R: PersonRecord + Validate,
{
    if records.len() > PSYNC_MAX_RECORDS_PER_COLLECTION {
        return Err(ContractViolation::TooManyItems {
            field,
            max: PSYNC_MAX_RECORDS_PER_COLLECTION,
            got: records.len(),
        });
    }
    let mut seen = BTreeSet::new();
    for record in records {
        record.validate()?;
        if let Some(id) = record.record_id() {
            if !seen.insert(id.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "record ids must be unique within a collection",
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PsyncGeneration(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    External,
    Propagated,
}

impl UpdateOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateOrigin::External => "EXTERNAL",
            UpdateOrigin::Propagated => "PROPAGATED",
        }
    }
}

/// One observed write to the state, as delivered to the watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeNotice {
    pub generation: PsyncGeneration,
    pub origin: UpdateOrigin,
    pub kinds: Vec<RecordKind>,
}

/// An operator's direct replacement of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsyncExternalEdit {
    Contact(ContactRecord),
    SigningOfficers(Vec<SigningOfficerRecord>),
    BeneficialOwners(Vec<BeneficialOwnerRecord>),
}

impl PsyncExternalEdit {
    pub fn kind(&self) -> RecordKind {
        match self {
            PsyncExternalEdit::Contact(_) => RecordKind::Contact,
            PsyncExternalEdit::SigningOfficers(_) => RecordKind::SigningOfficer,
            PsyncExternalEdit::BeneficialOwners(_) => RecordKind::BeneficialOwner,
        }
    }
}

/// One batched write covering every collection a propagation pass touched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CombinedStateUpdate {
    pub contact: Option<ContactRecord>,
    pub signing_officers: Option<Vec<SigningOfficerRecord>>,
    pub beneficial_owners: Option<Vec<BeneficialOwnerRecord>>,
}

impl CombinedStateUpdate {
    /// Carries only the collections that differ between `before` and `after`.
    pub fn diff(before: &PersonSyncState, after: &PersonSyncState) -> Self {
        Self {
            contact: (before.contact != after.contact).then(|| after.contact.clone()),
            signing_officers: (before.signing_officers != after.signing_officers)
                .then(|| after.signing_officers.clone()),
            beneficial_owners: (before.beneficial_owners != after.beneficial_owners)
                .then(|| after.beneficial_owners.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contact.is_none() && self.signing_officers.is_none() && self.beneficial_owners.is_none()
    }

    pub fn kinds(&self) -> Vec<RecordKind> {
        let mut kinds = Vec::new();
        if self.contact.is_some() {
            kinds.push(RecordKind::Contact);
        }
        if self.signing_officers.is_some() {
            kinds.push(RecordKind::SigningOfficer);
        }
        if self.beneficial_owners.is_some() {
            kinds.push(RecordKind::BeneficialOwner);
        }
        kinds
    }

    pub fn apply_to(&self, state: &mut PersonSyncState) {
        if let Some(contact) = &self.contact {
            state.contact.clone_from(contact);
        }
        if let Some(officers) = &self.signing_officers {
            state.signing_officers.clone_from(officers);
        }
        if let Some(owners) = &self.beneficial_owners {
            state.beneficial_owners.clone_from(owners);
        }
    }
}

impl Validate for CombinedStateUpdate {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "combined_state_update",
                reason: "must carry at least one collection",
            });
        }
        if let Some(contact) = &self.contact {
            contact.validate()?;
        }
        if let Some(officers) = &self.signing_officers {
            validate_collection("combined_state_update.signing_officers", officers)?;
        }
        if let Some(owners) = &self.beneficial_owners {
            validate_collection("combined_state_update.beneficial_owners", owners)?;
        }
        Ok(())
    }
}

/// Serialized watched fields of one record, keyed by field name.
pub type RecordSnapshot = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CollectionSnapshot {
    pub records: BTreeMap<String, RecordSnapshot>,
}

impl CollectionSnapshot {
    pub fn field(&self, record_key: &str, field: &str) -> Option<&str> {
        self.records
            .get(record_key)
            .and_then(|record| record.get(field))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PsyncSnapshot {
    pub contact: CollectionSnapshot,
    pub signing_officers: CollectionSnapshot,
    pub beneficial_owners: CollectionSnapshot,
}

impl PsyncSnapshot {
    pub fn collection(&self, kind: RecordKind) -> &CollectionSnapshot {
        match kind {
            RecordKind::Contact => &self.contact,
            RecordKind::SigningOfficer => &self.signing_officers,
            RecordKind::BeneficialOwner => &self.beneficial_owners,
        }
    }

    pub fn collection_mut(&mut self, kind: RecordKind) -> &mut CollectionSnapshot {
        match kind {
            RecordKind::Contact => &mut self.contact,
            RecordKind::SigningOfficer => &mut self.signing_officers,
            RecordKind::BeneficialOwner => &mut self.beneficial_owners,
        }
    }
}

/// The identity values of the contact that heuristic matching compares against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnchorIdentity {
    pub person_id: Option<PersonId>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl AnchorIdentity {
    pub fn from_contact(contact: &ContactRecord) -> Self {
        Self {
            person_id: contact.person_id.clone(),
            first_name: contact.first_name.clone(),
            last_name: contact.last_name.clone(),
            email: contact.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkMatchBasis {
    PersonId,
    LinkFlag,
    Heuristic,
}

impl LinkMatchBasis {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkMatchBasis::PersonId => "PERSON_ID",
            LinkMatchBasis::LinkFlag => "LINK_FLAG",
            LinkMatchBasis::Heuristic => "HEURISTIC",
        }
    }

    pub fn is_low_confidence(self) -> bool {
        self == LinkMatchBasis::Heuristic
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLink {
    pub index: usize,
    pub record_key: String,
    pub basis: LinkMatchBasis,
}

/// The officers and owners resolved as the same person as the contact anchor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResolution {
    pub officer_links: Vec<ResolvedLink>,
    pub owner_links: Vec<ResolvedLink>,
}

impl LinkResolution {
    pub fn links_for(&self, kind: RecordKind) -> &[ResolvedLink] {
        match kind {
            RecordKind::Contact => &[],
            RecordKind::SigningOfficer => &self.officer_links,
            RecordKind::BeneficialOwner => &self.owner_links,
        }
    }

    pub fn officers<'a>(&self, state: &'a PersonSyncState) -> Vec<&'a SigningOfficerRecord> {
        self.officer_links
            .iter()
            .filter_map(|link| state.signing_officers.get(link.index))
            .collect()
    }

    pub fn owners<'a>(&self, state: &'a PersonSyncState) -> Vec<&'a BeneficialOwnerRecord> {
        self.owner_links
            .iter()
            .filter_map(|link| state.beneficial_owners.get(link.index))
            .collect()
    }

    pub fn heuristic_count(&self, kind: RecordKind) -> usize {
        self.links_for(kind)
            .iter()
            .filter(|link| link.basis.is_low_confidence())
            .count()
    }
}

/// Two or more records of one collection matched the anchor by name/email alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmbiguousMatch {
    pub target_kind: RecordKind,
    pub match_count: u8,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedRecord {
    pub kind: RecordKind,
    pub record_key: String,
    pub fields: Vec<String>,
    pub basis: Option<LinkMatchBasis>,
}

impl Validate for TouchedRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.record_key.trim().is_empty() || self.record_key.len() > 80 {
            return Err(ContractViolation::InvalidValue {
                field: "touched_record.record_key",
                reason: "must be 1..=80 chars",
            });
        }
        if self.fields.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "touched_record.fields",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PsyncCapabilityId {
    SnapshotBuild,
    ResolveLinks,
    Propagate,
}

impl PsyncCapabilityId {
    pub fn as_str(self) -> &'static str {
        match self {
            PsyncCapabilityId::SnapshotBuild => "PSYNC_SNAPSHOT_BUILD",
            PsyncCapabilityId::ResolveLinks => "PSYNC_RESOLVE_LINKS",
            PsyncCapabilityId::Propagate => "PSYNC_PROPAGATE",
        }
    }
}

fn validate_schema(
    field: &'static str,
    schema_version: SchemaVersion,
) -> Result<(), ContractViolation> {
    if schema_version != PH1PSYNC_CONTRACT_VERSION {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must match PH1PSYNC_CONTRACT_VERSION",
        });
    }
    Ok(())
}

fn validate_reason_code(
    field: &'static str,
    reason_code: ReasonCodeId,
) -> Result<(), ContractViolation> {
    if reason_code.0 == 0 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be > 0",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncSnapshotBuildRequest {
    pub schema_version: SchemaVersion,
    pub state: PersonSyncState,
}

impl PsyncSnapshotBuildRequest {
    pub fn v1(state: PersonSyncState) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            state,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for PsyncSnapshotBuildRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_schema(
            "psync_snapshot_build_request.schema_version",
            self.schema_version,
        )?;
        self.state.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncResolveLinksRequest {
    pub schema_version: SchemaVersion,
    pub state: PersonSyncState,
    pub previous_anchor: Option<AnchorIdentity>,
}

impl PsyncResolveLinksRequest {
    pub fn v1(
        state: PersonSyncState,
        previous_anchor: Option<AnchorIdentity>,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            state,
            previous_anchor,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for PsyncResolveLinksRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_schema(
            "psync_resolve_links_request.schema_version",
            self.schema_version,
        )?;
        self.state.validate()?;
        if let Some(anchor) = &self.previous_anchor {
            if let Some(id) = &anchor.person_id {
                id.validate()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncPropagateRequest {
    pub schema_version: SchemaVersion,
    pub source: RecordKind,
    pub state: PersonSyncState,
    pub previous_snapshot: PsyncSnapshot,
}

impl PsyncPropagateRequest {
    pub fn v1(
        source: RecordKind,
        state: PersonSyncState,
        previous_snapshot: PsyncSnapshot,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            source,
            state,
            previous_snapshot,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for PsyncPropagateRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_schema(
            "psync_propagate_request.schema_version",
            self.schema_version,
        )?;
        self.state.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ph1PsyncRequest {
    SnapshotBuild(PsyncSnapshotBuildRequest),
    ResolveLinks(PsyncResolveLinksRequest),
    Propagate(PsyncPropagateRequest),
}

impl Validate for Ph1PsyncRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            Ph1PsyncRequest::SnapshotBuild(r) => r.validate(),
            Ph1PsyncRequest::ResolveLinks(r) => r.validate(),
            Ph1PsyncRequest::Propagate(r) => r.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncSnapshotBuildOk {
    pub schema_version: SchemaVersion,
    pub reason_code: ReasonCodeId,
    pub snapshot: PsyncSnapshot,
}

impl PsyncSnapshotBuildOk {
    pub fn v1(reason_code: ReasonCodeId, snapshot: PsyncSnapshot) -> Result<Self, ContractViolation> {
        let ok = Self {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            reason_code,
            snapshot,
        };
        ok.validate()?;
        Ok(ok)
    }
}

impl Validate for PsyncSnapshotBuildOk {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_schema("psync_snapshot_build_ok.schema_version", self.schema_version)?;
        validate_reason_code("psync_snapshot_build_ok.reason_code", self.reason_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncResolveLinksOk {
    pub schema_version: SchemaVersion,
    pub reason_code: ReasonCodeId,
    pub resolution: LinkResolution,
}

impl PsyncResolveLinksOk {
    pub fn v1(
        reason_code: ReasonCodeId,
        resolution: LinkResolution,
    ) -> Result<Self, ContractViolation> {
        let ok = Self {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            reason_code,
            resolution,
        };
        ok.validate()?;
        Ok(ok)
    }
}

impl Validate for PsyncResolveLinksOk {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_schema("psync_resolve_links_ok.schema_version", self.schema_version)?;
        validate_reason_code("psync_resolve_links_ok.reason_code", self.reason_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncPropagateOk {
    pub schema_version: SchemaVersion,
    pub reason_code: ReasonCodeId,
    pub source: RecordKind,
    pub update: Option<CombinedStateUpdate>,
    pub post_snapshot: PsyncSnapshot,
    pub post_snapshot_digest: String,
    pub touched: Vec<TouchedRecord>,
    pub deferred_fields: u16,
    pub ambiguous_matches: Vec<AmbiguousMatch>,
    pub cascade_applied: bool,
}

impl PsyncPropagateOk {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        reason_code: ReasonCodeId,
        source: RecordKind,
        update: Option<CombinedStateUpdate>,
        post_snapshot: PsyncSnapshot,
        post_snapshot_digest: String,
        touched: Vec<TouchedRecord>,
        deferred_fields: u16,
        ambiguous_matches: Vec<AmbiguousMatch>,
        cascade_applied: bool,
    ) -> Result<Self, ContractViolation> {
        let ok = Self {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            reason_code,
            source,
            update,
            post_snapshot,
            post_snapshot_digest,
            touched,
            deferred_fields,
            ambiguous_matches,
            cascade_applied,
        };
        ok.validate()?;
        Ok(ok)
    }
}

impl Validate for PsyncPropagateOk {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_schema("psync_propagate_ok.schema_version", self.schema_version)?;
        validate_reason_code("psync_propagate_ok.reason_code", self.reason_code)?;
        if self.post_snapshot_digest.len() != 64
            || !self
                .post_snapshot_digest
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        {
            return Err(ContractViolation::InvalidValue {
                field: "psync_propagate_ok.post_snapshot_digest",
                reason: "must be 64 hex chars",
            });
        }
        if let Some(update) = &self.update {
            update.validate()?;
        }
        if self.update.is_some() == self.touched.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "psync_propagate_ok.update",
                reason: "must be present exactly when records were touched",
            });
        }
        for touched in &self.touched {
            touched.validate()?;
        }
        if self.touched.len() > PSYNC_MAX_RECORDS_PER_COLLECTION * 3 {
            return Err(ContractViolation::TooManyItems {
                field: "psync_propagate_ok.touched",
                max: PSYNC_MAX_RECORDS_PER_COLLECTION * 3,
                got: self.touched.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncRefuse {
    pub schema_version: SchemaVersion,
    pub capability_id: PsyncCapabilityId,
    pub reason_code: ReasonCodeId,
    pub message: String,
}

impl PsyncRefuse {
    pub fn v1(
        capability_id: PsyncCapabilityId,
        reason_code: ReasonCodeId,
        message: String,
    ) -> Result<Self, ContractViolation> {
        let refuse = Self {
            schema_version: PH1PSYNC_CONTRACT_VERSION,
            capability_id,
            reason_code,
            message,
        };
        refuse.validate()?;
        Ok(refuse)
    }
}

impl Validate for PsyncRefuse {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_schema("psync_refuse.schema_version", self.schema_version)?;
        validate_reason_code("psync_refuse.reason_code", self.reason_code)?;
        if self.message.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "psync_refuse.message",
                reason: "must not be empty",
            });
        }
        validate_free_text("psync_refuse.message", &self.message, 256)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ph1PsyncResponse {
    SnapshotBuildOk(PsyncSnapshotBuildOk),
    ResolveLinksOk(PsyncResolveLinksOk),
    PropagateOk(PsyncPropagateOk),
    Refuse(PsyncRefuse),
}

impl Validate for Ph1PsyncResponse {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            Ph1PsyncResponse::SnapshotBuildOk(r) => r.validate(),
            Ph1PsyncResponse::ResolveLinksOk(r) => r.validate(),
            Ph1PsyncResponse::PropagateOk(r) => r.validate(),
            Ph1PsyncResponse::Refuse(r) => r.validate(),
        }
    }
}
