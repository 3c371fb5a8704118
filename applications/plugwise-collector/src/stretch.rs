//! Per-appliance power from the Stretch `/core/modules` document.

use crate::appliances::{ApplianceMapping, Services};
use crate::error::AppError;
use crate::model::PowerReading;
use crate::xml;
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::trace;

pub const DEVICE_NAME: &str = "stretch";

#[derive(Debug, Deserialize)]
struct ModuleList {
    #[serde(rename = "module", default)]
    modules: Vec<Module>,
}

#[derive(Debug, Deserialize)]
struct Module {
    #[serde(default)]
    id: String,
    #[serde(default)]
    services: Services,
}

/// One reading per resolved appliance, keyed by appliance name.
///
/// Meters that are not in `mapping` are skipped. An empty map means the
/// document parsed fine but nothing resolved.
pub fn extract_power(
    document: &str,
    mapping: &ApplianceMapping,
    collected_at: DateTime<Local>,
) -> Result<BTreeMap<String, PowerReading>, AppError> {
    let list: ModuleList = xml::decode(document)?;
    let mut readings = BTreeMap::new();

    for module in &list.modules {
        for point_meter in module.services.point_meters() {
            let meter_id = point_meter.id.as_str();
            let Some(appliance) = mapping.resolve(meter_id) else {
                trace!(meter_id, "point meter not associated with an appliance");
                continue;
            };
            let Some(measurement) = point_meter
                .measurements
                .iter()
                .find(|m| m.directionality == "consumed")
            else {
                continue;
            };

            readings.insert(
                appliance.appliance_name.clone(),
                PowerReading {
                    timestamp: collected_at,
                    device_name: DEVICE_NAME.to_string(),
                    appliance_name: appliance.appliance_name.clone(),
                    power_watts: parse_measurement_value(&measurement.value),
                    measurement_timestamp: measurement.log_date.clone(),
                    module_id: module.id.clone(),
                    meter_id: meter_id.to_string(),
                    tariff: None,
                    peak_watts: None,
                    offpeak_watts: None,
                },
            );
        }
    }

    Ok(readings)
}

/// Lenient numeric parse: anything that is not a plain signed decimal is 0.0.
pub fn parse_measurement_value(text: &str) -> f64 {
    let s = text.trim();
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);

    let mut seen_digit = false;
    let mut seen_dot = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return 0.0,
        }
    }
    if !seen_digit {
        return 0.0;
    }
    s.parse().unwrap_or(0.0)
}
