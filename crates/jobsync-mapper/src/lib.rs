//! Decoding of remote job order payloads and mapping into the local listing schema.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use jobsync_core::{
    ExternalId, ListingDraft, ListingStatus, MetadataMap, RemoteAddress, RemoteJobRecord,
    TaxonomyNamespace, CUSTOM_FIELD_COUNT,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobsync-mapper";

pub mod keys {
    pub const JOB_ORDER_ID: &str = "_job_jobOrderID";
    pub const COMPANY_DESCRIPTION: &str = "_company_description";
    pub const START_DATE: &str = "_start_date";
    pub const DATE_END: &str = "_date_end";
    pub const DURATION_WEEKS: &str = "_duration_weeks";
    pub const EMPLOYMENT_TYPE: &str = "_employment_type";
    pub const YEARS_REQUIRED: &str = "_years_required";
    pub const TRAVEL_REQUIREMENTS: &str = "_travel_requirements";
    pub const CERTIFICATION_LIST: &str = "_certification_list";
    pub const SKILL_LIST: &str = "_skill_list";
    pub const EXTERNAL_CATEGORY_ID: &str = "_job_externalCategoryID";
    pub const BENEFITS: &str = "_job_benefits";
    pub const EDUCATION_DEGREE: &str = "_job_educationDegree";
    pub const HOURS_OF_OPERATION: &str = "_job_hoursOfOperation";
    pub const SALARY: &str = "_job_salary";
    pub const SALARY_UNIT: &str = "_job_salaryUnit";
    pub const TAX_RATE: &str = "_job_taxRate";
    pub const TAX_STATUS: &str = "_job_taxStatus";
    pub const JOB_TRAVEL_REQUIREMENTS: &str = "_job_travelRequirements";
    pub const WILL_RELOCATE: &str = "_job_willRelocate";
    pub const LOCATION: &str = "_job_location";
    pub const ADDRESS_STATE: &str = "_job_address_state";
    pub const ADDRESS_CITY: &str = "_job_address_city";

    pub fn custom_text(index: usize) -> String {
        format!("_custom_text_{index}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has unparsable date `{value}`")]
    InvalidDate { field: &'static str, value: String },
    #[error("malformed job order payload: {0}")]
    Decode(String),
}

/// Output of the mapper for one remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedListing {
    pub draft: ListingDraft,
    pub metadata: MetadataMap,
    pub region: Option<String>,
    pub employment_type: Option<String>,
}

impl MappedListing {
    pub fn external_id(&self) -> ExternalId {
        self.draft.external_id
    }

    pub fn classification(&self, namespace: TaxonomyNamespace) -> Option<&str> {
        match namespace {
            TaxonomyNamespace::Region => self.region.as_deref(),
            TaxonomyNamespace::EmploymentType => self.employment_type.as_deref(),
        }
    }
}

/// Best-effort external id of an undecoded payload, used to attribute failures.
pub fn peek_external_id(value: &JsonValue) -> Option<ExternalId> {
    value.get("jobOrderID").and_then(json_external_id)
}

fn json_external_id(value: &JsonValue) -> Option<ExternalId> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Textual form of a scalar as the remote sent it. `null` is treated as absent.
fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn field_text(object: &JsonMap<String, JsonValue>, key: &str) -> Option<String> {
    object.get(key).and_then(json_text)
}

fn json_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_i64().is_some_and(|v| v != 0),
        JsonValue::String(s) => matches!(s.trim(), "1" | "true" | "TRUE" | "True"),
        _ => false,
    }
}

fn is_address_like(object: &JsonMap<String, JsonValue>) -> bool {
    ["address1", "city", "state"]
        .iter()
        .any(|key| object.contains_key(*key))
}

/// The first structured entry of the address sub-record that is an address object.
fn first_address_object(value: &JsonValue) -> Option<&JsonMap<String, JsonValue>> {
    match value {
        JsonValue::Object(object) if is_address_like(object) => Some(object),
        JsonValue::Object(object) => object
            .values()
            .filter_map(JsonValue::as_object)
            .find(|inner| is_address_like(inner)),
        JsonValue::Array(entries) => entries
            .iter()
            .filter_map(JsonValue::as_object)
            .find(|inner| is_address_like(inner)),
        _ => None,
    }
}

fn decode_address(value: &JsonValue) -> Option<RemoteAddress> {
    let object = first_address_object(value)?;
    Some(RemoteAddress {
        address1: field_text(object, "address1"),
        city: field_text(object, "city"),
        state: field_text(object, "state"),
    })
}

/// Decode one `find-multiple` payload into a typed record, failing fast on missing required fields.
pub fn decode_job_order(value: &JsonValue) -> Result<RemoteJobRecord, MappingError> {
    let object = value
        .as_object()
        .ok_or_else(|| MappingError::Decode(format!("expected an object, got {value}")))?;

    let external_id = match object.get("jobOrderID") {
        None | Some(JsonValue::Null) => return Err(MappingError::MissingField("jobOrderID")),
        Some(raw) => json_external_id(raw)
            .ok_or_else(|| MappingError::Decode(format!("jobOrderID is not an integer: {raw}")))?,
    };
    let title = field_text(object, "title").ok_or(MappingError::MissingField("title"))?;
    let date_added = field_text(object, "dateAdded")
        .filter(|s| !s.trim().is_empty())
        .ok_or(MappingError::MissingField("dateAdded"))?;

    let mut custom_fields: [Option<String>; CUSTOM_FIELD_COUNT] = Default::default();
    for (idx, slot) in custom_fields.iter_mut().enumerate() {
        *slot = field_text(object, &format!("correlatedCustomInt{}", idx + 1));
    }

    Ok(RemoteJobRecord {
        external_id,
        title,
        description: field_text(object, "description").unwrap_or_default(),
        public_description: field_text(object, "publicDescription"),
        // Records come from an `isOpen=1` query; only an explicit flag marks them closed.
        is_open: object.get("isOpen").map(json_truthy).unwrap_or(true),
        date_added,
        start_date: field_text(object, "startDate"),
        date_end: field_text(object, "dateEnd"),
        duration_weeks: field_text(object, "durationWeeks"),
        employment_type: field_text(object, "employmentType"),
        custom_fields,
        address: object.get("address").and_then(decode_address),
        salary: field_text(object, "salary"),
        salary_unit: field_text(object, "salaryUnit"),
        tax_rate: field_text(object, "taxRate"),
        tax_status: field_text(object, "taxStatus"),
        years_required: field_text(object, "yearsRequired"),
        certification_list: field_text(object, "certificationList"),
        skill_list: field_text(object, "skillList"),
        travel_requirements: field_text(object, "travelRequirements"),
        benefits: field_text(object, "benefits"),
        education_degree: field_text(object, "educationDegree"),
        hours_of_operation: field_text(object, "hoursOfOperation"),
        external_category_id: field_text(object, "externalCategoryID"),
        will_relocate: field_text(object, "willRelocate"),
    })
}

/// Parse a remote date value.
///
/// Accepted forms: epoch milliseconds (digits only), RFC 3339, `YYYY-MM-DDTHH:MM:SS[.fff]`
/// and `YYYY-MM-DD HH:MM:SS` (both read as UTC), and `YYYY-MM-DD` (UTC midnight).
/// Blank input is `Ok(None)`.
pub fn parse_remote_timestamp(
    field: &'static str,
    raw: &str,
) -> Result<Option<DateTime<Utc>>, MappingError> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || MappingError::InvalidDate {
        field,
        value: value.to_string(),
    };

    if value.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = value.parse().map_err(|_| invalid())?;
        return DateTime::from_timestamp_millis(millis).map(Some).ok_or_else(invalid);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Some(naive.and_utc()))
            .ok_or_else(invalid);
    }
    Err(invalid())
}

fn unix_seconds_text(field: &'static str, raw: Option<&str>) -> Result<String, MappingError> {
    match raw {
        Some(raw) => Ok(parse_remote_timestamp(field, raw)?
            .map(|dt| dt.timestamp().to_string())
            .unwrap_or_default()),
        None => Ok(String::new()),
    }
}

fn classification_value(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Map one remote record into a listing draft, its metadata, and its classification values.
pub fn map_record(record: &RemoteJobRecord) -> Result<MappedListing, MappingError> {
    let published_at = parse_remote_timestamp("dateAdded", &record.date_added)?
        .ok_or(MappingError::MissingField("dateAdded"))?;

    let draft = ListingDraft {
        external_id: record.external_id,
        title: record.title.clone(),
        body: record.description.clone(),
        published_at,
        status: ListingStatus::Publish,
    };

    let mut metadata = MetadataMap::new();
    let mut put = |key: &str, value: String| {
        metadata.insert(key.to_string(), value);
    };

    put(keys::JOB_ORDER_ID, record.external_id.to_string());
    put(keys::COMPANY_DESCRIPTION, text(&record.public_description));
    put(
        keys::START_DATE,
        unix_seconds_text("startDate", record.start_date.as_deref())?,
    );
    put(
        keys::DATE_END,
        unix_seconds_text("dateEnd", record.date_end.as_deref())?,
    );
    put(keys::DURATION_WEEKS, text(&record.duration_weeks));
    put(keys::EMPLOYMENT_TYPE, text(&record.employment_type));
    for (idx, value) in record.custom_fields.iter().enumerate() {
        put(&keys::custom_text(idx + 1), text(value));
    }
    put(keys::YEARS_REQUIRED, text(&record.years_required));
    put(keys::TRAVEL_REQUIREMENTS, text(&record.travel_requirements));
    put(keys::CERTIFICATION_LIST, text(&record.certification_list));
    put(keys::SKILL_LIST, text(&record.skill_list));
    put(keys::EXTERNAL_CATEGORY_ID, text(&record.external_category_id));
    put(keys::BENEFITS, text(&record.benefits));
    put(keys::EDUCATION_DEGREE, text(&record.education_degree));
    put(keys::HOURS_OF_OPERATION, text(&record.hours_of_operation));
    put(keys::SALARY, text(&record.salary));
    put(keys::SALARY_UNIT, text(&record.salary_unit));
    put(keys::TAX_RATE, text(&record.tax_rate));
    put(keys::TAX_STATUS, text(&record.tax_status));
    put(keys::JOB_TRAVEL_REQUIREMENTS, text(&record.travel_requirements));
    put(keys::WILL_RELOCATE, text(&record.will_relocate));

    if let Some(address) = &record.address {
        put(keys::LOCATION, text(&address.address1));
        put(keys::ADDRESS_STATE, text(&address.state));
        put(keys::ADDRESS_CITY, text(&address.city));
    }

    Ok(MappedListing {
        draft,
        metadata,
        region: classification_value(record.address.as_ref().and_then(|a| a.state.as_deref())),
        employment_type: classification_value(record.employment_type.as_deref()),
    })
}

/// Decode and map in one step.
pub fn map_payload(value: &JsonValue) -> Result<MappedListing, MappingError> {
    map_record(&decode_job_order(value)?)
}
