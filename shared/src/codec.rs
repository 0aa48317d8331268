//! Conversion between the `endpoints`/`frontends` wire payloads and typed records.
//!
//! On the wire an `endpoints` value is a JSON array of flat objects with
//! hyphenated keys. Internally the same keys use underscores. Only the known
//! vocabulary is renamed; anything else passes through untouched.

use std::collections::BTreeMap;
use serde::Serialize;
use serde_json::{Map, Value};
use crate::error::{EndpointError, Result};
use crate::protocol::{BACKEND_IP, BACKEND_PORT, CHECK_TYPE, FRONTEND_PORT, SERVICE_NAME};
use crate::types::{BackendRegistration, FrontendResponse, PartitionEndpoint, ServiceRequest};

/// One flat key/value entry of an `endpoints` payload
pub type Record = Map<String, Value>;

const VOCABULARY: [&str; 5] = [SERVICE_NAME, FRONTEND_PORT, CHECK_TYPE, BACKEND_PORT, BACKEND_IP];

pub fn to_internal_key(key: &str) -> String {
    if VOCABULARY.contains(&key) {
        key.replace('-', "_")
    } else {
        key.to_string()
    }
}

pub fn to_wire_key(key: &str) -> String {
    VOCABULARY
        .iter()
        .find(|wire| wire.replace('-', "_") == key)
        .map(|wire| wire.to_string())
        .unwrap_or_else(|| key.to_string())
}

/// Rename every key of a wire record to its internal spelling.
pub fn internalize(record: &Record) -> Record {
    record
        .iter()
        .map(|(k, v)| (to_internal_key(k), v.clone()))
        .collect()
}

/// Rename every key of an internal record to its wire spelling.
pub fn externalize(record: &Record) -> Record {
    record
        .iter()
        .map(|(k, v)| (to_wire_key(k), v.clone()))
        .collect()
}

/// Encode records as a JSON array with keys sorted inside every object.
pub fn encode(records: &[Record]) -> Result<String> {
    let sorted: Vec<BTreeMap<&String, &Value>> =
        records.iter().map(|r| r.iter().collect()).collect();
    Ok(serde_json::to_string(&sorted)?)
}

/// Decode an `endpoints` payload. Absent or blank data means "nothing
/// published yet" and decodes to an empty list.
pub fn decode(wire: Option<&str>) -> Result<Vec<Record>> {
    let Some(wire) = wire.map(str::trim).filter(|w| !w.is_empty()) else {
        return Ok(Vec::new());
    };

    let value: Value = serde_json::from_str(wire)
        .map_err(|e| EndpointError::MalformedRecord(e.to_string()))?;

    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| match item {
                Value::Object(record) => Ok(record),
                other => Err(EndpointError::MalformedRecord(format!(
                    "entry {} is not an object: {}",
                    idx, other
                ))),
            })
            .collect(),
        other => Err(EndpointError::MalformedRecord(format!(
            "expected an array of records, found {}",
            other
        ))),
    }
}

/// Encode a `frontends` response. Map keys are ordered, so output is stable.
pub fn encode_response(response: &FrontendResponse) -> Result<String> {
    Ok(serde_json::to_string(response)?)
}

/// Decode a `frontends` response. Services or partitions published as
/// `null` (not yet ready) are skipped.
pub fn decode_response(wire: Option<&str>) -> Result<FrontendResponse> {
    let Some(wire) = wire.map(str::trim).filter(|w| !w.is_empty()) else {
        return Ok(FrontendResponse::new());
    };

    let raw: BTreeMap<String, Option<BTreeMap<String, Option<PartitionEndpoint>>>> =
        serde_json::from_str(wire).map_err(|e| EndpointError::MalformedRecord(e.to_string()))?;

    Ok(raw
        .into_iter()
        .filter_map(|(service, partitions)| {
            let Some(partitions) = partitions else {
                tracing::debug!("Skipping service {} with no partitions", service);
                return None;
            };
            let partitions: BTreeMap<_, _> = partitions
                .into_iter()
                .filter_map(|(name, endpoint)| {
                    if endpoint.is_none() {
                        tracing::debug!("Skipping null partition {} of {}", name, service);
                    }
                    endpoint.map(|e| (name, e))
                })
                .collect();
            (!partitions.is_empty()).then_some((service, partitions))
        })
        .collect())
}

impl ServiceRequest {
    pub fn from_record(record: &Record) -> Result<Self> {
        let record = internalize(record);
        Ok(Self {
            service_name: string_field(&record, SERVICE_NAME)?,
            frontend_port: port_field(&record, FRONTEND_PORT)?,
            check_type: string_field(&record, CHECK_TYPE)?,
        })
    }

    pub fn to_record(&self) -> Result<Record> {
        wire_record(self)
    }
}

impl BackendRegistration {
    pub fn from_record(record: &Record) -> Result<Self> {
        let record = internalize(record);
        Ok(Self {
            service_name: string_field(&record, SERVICE_NAME)?,
            backend_port: port_field(&record, BACKEND_PORT)?,
            backend_ip: string_field(&record, BACKEND_IP)?,
        })
    }

    pub fn to_record(&self) -> Result<Record> {
        wire_record(self)
    }
}

/// Service name of a raw record, if it has a usable one.
pub fn record_service_name(record: &Record) -> Option<&str> {
    record.get(SERVICE_NAME).and_then(Value::as_str)
}

fn wire_record<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value)? {
        Value::Object(record) => Ok(externalize(&record)),
        other => Err(EndpointError::MalformedRecord(format!(
            "expected an object, found {}",
            other
        ))),
    }
}

fn field<'a>(record: &'a Record, wire_key: &'static str) -> Result<&'a Value> {
    match record.get(&to_internal_key(wire_key)) {
        None | Some(Value::Null) => Err(EndpointError::MissingField(wire_key)),
        Some(value) => Ok(value),
    }
}

fn string_field(record: &Record, wire_key: &'static str) -> Result<String> {
    match field(record, wire_key)? {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) => Err(EndpointError::InvalidField {
            field: wire_key,
            reason: "empty string".to_string(),
        }),
        other => Err(EndpointError::InvalidField {
            field: wire_key,
            reason: format!("expected a string, found {}", other),
        }),
    }
}

/// Ports are integers on the wire; decimal strings are accepted as well.
fn port_field(record: &Record, wire_key: &'static str) -> Result<u16> {
    let invalid = |reason: String| EndpointError::InvalidField { field: wire_key, reason };

    let port = match field(record, wire_key)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| invalid(format!("{} is not a port number", n)))?,
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| invalid(format!("'{}': {}", s, e)))?,
        other => return Err(invalid(format!("expected an integer, found {}", other))),
    };

    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(invalid(format!("{} is out of range", port))),
    }
}
