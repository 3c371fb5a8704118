use crate::error::AppError;
use crate::xml::{self, Tagged};
use serde::de::{Deserializer, VariantAccess};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info};

pub const POINT_METER_SERVICE: &str = "electricity_point_meter";

/// `<services>` of an appliance or module.
#[derive(Debug, Default, Deserialize)]
pub struct Services {
    #[serde(rename = "$value", default)]
    pub entries: Vec<Service>,
}

impl Services {
    pub fn point_meters(&self) -> impl Iterator<Item = &PointMeter> {
        self.entries.iter().filter_map(|s| match s {
            Service::PointMeter(meter) => Some(meter),
            Service::Other => None,
        })
    }
}

#[derive(Debug)]
pub enum Service {
    PointMeter(PointMeter),
    Other,
}

impl Tagged for Service {
    const EXPECTING: &'static str = "a service element";

    fn from_tag<'de, V: VariantAccess<'de>>(tag: String, body: V) -> Result<Self, V::Error> {
        match tag.as_str() {
            POINT_METER_SERVICE => body.newtype_variant().map(Service::PointMeter),
            _ => xml::skip(body).map(|_| Service::Other),
        }
    }
}

impl<'de> Deserialize<'de> for Service {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        xml::deserialize_tagged(deserializer)
    }
}

/// An `electricity_point_meter` service. The registry only carries the id;
/// `/core/modules` adds the live measurements.
#[derive(Debug, Default, Deserialize)]
pub struct PointMeter {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "measurement", default)]
    pub measurements: Vec<PointMeasurement>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PointMeasurement {
    #[serde(default)]
    pub directionality: String,
    #[serde(default)]
    pub log_date: String,
    /// Raw text; parsed leniently by the Stretch extractor
    #[serde(rename = "$value", default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct ApplianceRegistry {
    #[serde(rename = "appliance", default)]
    appliances: Vec<Appliance>,
}

#[derive(Debug, Deserialize)]
struct Appliance {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    services: Services,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplianceInfo {
    pub appliance_name: String,
    pub appliance_id: String,
    pub service_type: String,
}

/// Meter service id -> appliance that owns the meter.
///
/// Built from the Stretch appliance registry and read-only afterwards; a meter
/// id that is not in here is not associated with an appliance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplianceMapping {
    entries: HashMap<String, ApplianceInfo>,
}

impl ApplianceMapping {
    /// Parse `/core/appliances`, failing on malformed XML.
    pub fn from_xml(document: &str) -> Result<Self, AppError> {
        let registry: ApplianceRegistry = xml::decode(document)?;
        let mut entries = HashMap::new();

        for appliance in registry.appliances {
            let name = match appliance.name.trim() {
                "" => "Unknown",
                name => name,
            };
            for meter in appliance.services.point_meters() {
                entries.insert(
                    meter.id.clone(),
                    ApplianceInfo {
                        appliance_name: name.to_string(),
                        appliance_id: appliance.id.clone(),
                        service_type: POINT_METER_SERVICE.to_string(),
                    },
                );
            }
        }

        Ok(Self { entries })
    }

    /// Like `from_xml`, but a malformed registry is logged and yields an empty mapping.
    pub fn build(xml: &str) -> Self {
        match Self::from_xml(xml) {
            Ok(mapping) => {
                info!(mappings = mapping.len(), "built appliance-meter mapping");
                mapping
            }
            Err(e) => {
                error!(error = %e, "failed to build appliance mapping");
                Self::default()
            }
        }
    }

    pub fn resolve(&self, meter_id: &str) -> Option<&ApplianceInfo> {
        self.entries.get(meter_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
