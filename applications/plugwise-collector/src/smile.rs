//! Whole-home power and cumulative meters from the Smile `/core/domain_objects` document.
//!
//! Extraction is all-or-nothing: any unexpected shape or unparseable value
//! fails the whole document so a half-read snapshot is never persisted.

use crate::error::AppError;
use crate::model::{ActiveTariff, MeterKind, MeterReading, MeterSnapshot, PowerReading, Tariff};
use crate::xml::{self, Tagged};
use chrono::{DateTime, Local};
use serde::de::{Deserializer, VariantAccess};
use serde::{Deserialize, Serialize};
use tracing::trace;

pub const DEVICE_NAME: &str = "smile";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmileSnapshot {
    /// `None` when the home location has no electricity point log
    pub power: Option<PowerReading>,
    pub meters: MeterSnapshot,
}

#[derive(Debug, Deserialize)]
struct DomainObjects {
    #[serde(rename = "$value", default)]
    objects: Vec<DomainObject>,
}

#[derive(Debug)]
enum DomainObject {
    Location(Location),
    Other,
}

impl Tagged for DomainObject {
    const EXPECTING: &'static str = "a domain object";

    fn from_tag<'de, V: VariantAccess<'de>>(tag: String, body: V) -> Result<Self, V::Error> {
        match tag.as_str() {
            "location" => body.newtype_variant().map(DomainObject::Location),
            _ => xml::skip(body).map(|_| DomainObject::Other),
        }
    }
}

impl<'de> Deserialize<'de> for DomainObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        xml::deserialize_tagged(deserializer)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub logs: Logs,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Logs {
    #[serde(rename = "$value", default)]
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Point(LogRecord),
    Cumulative(LogRecord),
    Unrecognized(String),
}

impl Tagged for LogEntry {
    const EXPECTING: &'static str = "a log element";

    fn from_tag<'de, V: VariantAccess<'de>>(tag: String, body: V) -> Result<Self, V::Error> {
        match tag.as_str() {
            "point_log" => body.newtype_variant().map(LogEntry::Point),
            "cumulative_log" => body.newtype_variant().map(LogEntry::Cumulative),
            _ => xml::skip(body).map(|_| LogEntry::Unrecognized(tag)),
        }
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        xml::deserialize_tagged(deserializer)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub log_type: String,
    #[serde(default)]
    pub unit: String,
    #[serde(rename = "period", default)]
    pub periods: Vec<Period>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Period {
    #[serde(rename = "measurement", default)]
    pub measurements: Vec<RawMeasurement>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawMeasurement {
    #[serde(default)]
    pub log_date: String,
    #[serde(default)]
    pub tariff: String,
    #[serde(rename = "$value", default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogMeasurement {
    pub value: f64,
    pub tariff: Tariff,
    pub log_date: String,
}

impl LogRecord {
    /// Measurements of the first period. Empty values are skipped; anything
    /// else that is not a number fails.
    pub fn measurements(&self) -> Result<Vec<LogMeasurement>, AppError> {
        let Some(period) = self.periods.first() else {
            return Ok(Vec::new());
        };
        period
            .measurements
            .iter()
            .filter(|m| !m.value.trim().is_empty())
            .map(|m| {
                let text = m.value.trim();
                let value = text.parse::<f64>().map_err(|e| {
                    AppError::Parse(format!("log {} measurement {:?}: {}", self.id, text, e))
                })?;
                Ok(LogMeasurement {
                    value,
                    tariff: Tariff::from_tag(&m.tariff),
                    log_date: m.log_date.clone(),
                })
            })
            .collect()
    }
}

/// Decode `/core/domain_objects` and return the location called `location_id`.
pub fn find_home_location(document: &str, location_id: &str) -> Result<Location, AppError> {
    let root: DomainObjects = xml::decode(document)?;
    root.objects
        .into_iter()
        .find_map(|object| match object {
            DomainObject::Location(location) if location.id == location_id => Some(location),
            _ => None,
        })
        .ok_or_else(|| AppError::MissingLocation(location_id.to_string()))
}

pub fn extract(
    document: &str,
    home_location_id: &str,
    now: DateTime<Local>,
) -> Result<SmileSnapshot, AppError> {
    let location = find_home_location(document, home_location_id)?;

    let mut point_logs = Vec::new();
    let mut cumulative_logs = Vec::new();
    for entry in &location.logs.entries {
        match entry {
            LogEntry::Point(log) => point_logs.push((log, log.measurements()?)),
            LogEntry::Cumulative(log) => cumulative_logs.push((log, log.measurements()?)),
            LogEntry::Unrecognized(tag) => trace!(tag = %tag, "skipping log"),
        }
    }

    let power = point_logs
        .iter()
        .find(|(log, _)| log.log_type == "electricity_consumed" && log.unit == "W")
        .map(|(log, measurements)| power_reading(log, measurements, &location, now));

    let mut meters = MeterSnapshot::new(now);
    for (log, measurements) in &cumulative_logs {
        for m in measurements {
            let Some(kind) = MeterKind::route(&log.log_type, &m.tariff) else {
                continue;
            };
            meters.readings.insert(
                kind,
                MeterReading {
                    value: m.value,
                    unit: meter_unit(kind, &log.unit),
                    timestamp: m.log_date.clone(),
                    meter_type: log.log_type.clone(),
                    tariff: kind.tariff_label().to_string(),
                },
            );
        }
    }
    meters.derive_totals(now);

    Ok(SmileSnapshot { power, meters })
}

fn power_reading(
    log: &LogRecord,
    measurements: &[LogMeasurement],
    location: &Location,
    now: DateTime<Local>,
) -> PowerReading {
    let mut total = 0.0;
    let mut peak = 0.0;
    let mut offpeak = 0.0;
    for m in measurements {
        total += m.value;
        match m.tariff {
            Tariff::Peak => peak += m.value,
            Tariff::OffPeak => offpeak += m.value,
            _ => {}
        }
    }

    let name = match location.name.trim() {
        "" => "Home",
        name => name,
    };
    PowerReading {
        timestamp: now,
        device_name: DEVICE_NAME.to_string(),
        appliance_name: name.to_string(),
        power_watts: total,
        measurement_timestamp: measurements
            .first()
            .map(|m| m.log_date.clone())
            .unwrap_or_default(),
        module_id: location.id.clone(),
        meter_id: log.id.clone(),
        tariff: Some(ActiveTariff::from_components(peak, offpeak)),
        peak_watts: Some(peak),
        offpeak_watts: Some(offpeak),
    }
}

fn meter_unit(kind: MeterKind, declared: &str) -> String {
    if !declared.is_empty() {
        return declared.to_string();
    }
    match kind {
        MeterKind::GasConsumed => "m³".to_string(),
        _ => "kWh".to_string(),
    }
}
