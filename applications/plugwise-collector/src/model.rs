use chrono::{DateTime, Local, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

/// One instantaneous power value for a single appliance (or the whole home).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerReading {
    pub timestamp: DateTime<Local>,
    pub device_name: String,
    pub appliance_name: String,
    pub power_watts: f64,
    /// log_date reported by the gateway for this measurement
    pub measurement_timestamp: String,
    pub module_id: String,
    pub meter_id: String,
    pub tariff: Option<ActiveTariff>,
    pub peak_watts: Option<f64>,
    pub offpeak_watts: Option<f64>,
}

/// Readings from every device for one collection cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PowerBatch {
    pub collected_at: DateTime<Local>,
    /// device name -> appliance name -> reading
    pub devices: BTreeMap<String, BTreeMap<String, PowerReading>>,
}

impl PowerBatch {
    pub fn new(collected_at: DateTime<Local>) -> Self {
        Self {
            collected_at,
            devices: BTreeMap::new(),
        }
    }

    pub fn insert_device(&mut self, device: &str, readings: BTreeMap<String, PowerReading>) {
        if !readings.is_empty() {
            self.devices.insert(device.to_string(), readings);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.values().all(|r| r.is_empty())
    }

    pub fn len(&self) -> usize {
        self.devices.values().map(|r| r.len()).sum()
    }

    pub fn readings(&self) -> impl Iterator<Item = &PowerReading> {
        self.devices.values().flat_map(|r| r.values())
    }
}

/// Tariff tag attached to a Smile measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tariff {
    Peak,
    OffPeak,
    None,
    Other(String),
}

impl Tariff {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "nl_peak" => Tariff::Peak,
            "nl_offpeak" => Tariff::OffPeak,
            "" => Tariff::None,
            other => Tariff::Other(other.to_string()),
        }
    }
}

/// Which tariff is currently drawing power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActiveTariff {
    #[serde(rename = "peak")]
    Peak,
    #[serde(rename = "off-peak")]
    OffPeak,
    #[serde(rename = "both")]
    Both,
    #[serde(rename = "none")]
    None,
}

impl ActiveTariff {
    pub fn from_components(peak: f64, offpeak: f64) -> Self {
        match (peak > 0.0, offpeak > 0.0) {
            (true, true) => ActiveTariff::Both,
            (true, false) => ActiveTariff::Peak,
            (false, true) => ActiveTariff::OffPeak,
            (false, false) => ActiveTariff::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveTariff::Peak => "peak",
            ActiveTariff::OffPeak => "off-peak",
            ActiveTariff::Both => "both",
            ActiveTariff::None => "none",
        }
    }
}

/// The meter columns of the session file, in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    GasConsumed,
    ElectricityConsumedPeak,
    ElectricityConsumedOffpeak,
    ElectricityProducedPeak,
    ElectricityProducedOffpeak,
    ElectricityTotalConsumed,
    ElectricityTotalProduced,
    ElectricityNetConsumed,
}

impl MeterKind {
    pub const ALL: [MeterKind; 8] = [
        MeterKind::GasConsumed,
        MeterKind::ElectricityConsumedPeak,
        MeterKind::ElectricityConsumedOffpeak,
        MeterKind::ElectricityProducedPeak,
        MeterKind::ElectricityProducedOffpeak,
        MeterKind::ElectricityTotalConsumed,
        MeterKind::ElectricityTotalProduced,
        MeterKind::ElectricityNetConsumed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeterKind::GasConsumed => "gas_consumed",
            MeterKind::ElectricityConsumedPeak => "electricity_consumed_peak",
            MeterKind::ElectricityConsumedOffpeak => "electricity_consumed_offpeak",
            MeterKind::ElectricityProducedPeak => "electricity_produced_peak",
            MeterKind::ElectricityProducedOffpeak => "electricity_produced_offpeak",
            MeterKind::ElectricityTotalConsumed => "electricity_total_consumed",
            MeterKind::ElectricityTotalProduced => "electricity_total_produced",
            MeterKind::ElectricityNetConsumed => "electricity_net_consumed",
        }
    }

    /// Route a cumulative log value by its (type, tariff) pair.
    /// Derived kinds are never produced here.
    pub fn route(log_type: &str, tariff: &Tariff) -> Option<MeterKind> {
        match (log_type, tariff) {
            ("electricity_consumed", Tariff::Peak) => Some(MeterKind::ElectricityConsumedPeak),
            ("electricity_consumed", Tariff::OffPeak) => {
                Some(MeterKind::ElectricityConsumedOffpeak)
            }
            ("electricity_produced", Tariff::Peak) => Some(MeterKind::ElectricityProducedPeak),
            ("electricity_produced", Tariff::OffPeak) => {
                Some(MeterKind::ElectricityProducedOffpeak)
            }
            ("gas_consumed", _) => Some(MeterKind::GasConsumed),
            _ => None,
        }
    }

    pub fn tariff_label(&self) -> &'static str {
        match self {
            MeterKind::ElectricityConsumedPeak | MeterKind::ElectricityProducedPeak => "peak",
            MeterKind::ElectricityConsumedOffpeak | MeterKind::ElectricityProducedOffpeak => {
                "offpeak"
            }
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterReading {
    pub value: f64,
    pub unit: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub meter_type: String,
    pub tariff: String,
}

/// Whole-home cumulative meter values taken at one moment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterSnapshot {
    pub collection_date: NaiveDate,
    pub collection_timestamp: DateTime<Local>,
    pub readings: BTreeMap<MeterKind, MeterReading>,
}

impl MeterSnapshot {
    pub fn new(collection_timestamp: DateTime<Local>) -> Self {
        Self {
            collection_date: collection_timestamp.date_naive(),
            collection_timestamp,
            readings: BTreeMap::new(),
        }
    }

    pub fn value(&self, kind: MeterKind) -> Option<f64> {
        self.readings.get(&kind).map(|r| r.value)
    }

    fn value_or_zero(&self, kind: MeterKind) -> f64 {
        self.value(kind).unwrap_or(0.0)
    }

    /// (Re)compute the derived totals from the tariff counters.
    /// A missing tariff counter counts as zero.
    pub fn derive_totals(&mut self, now: DateTime<Local>) {
        let consumed = self.value_or_zero(MeterKind::ElectricityConsumedPeak)
            + self.value_or_zero(MeterKind::ElectricityConsumedOffpeak);
        let produced = self.value_or_zero(MeterKind::ElectricityProducedPeak)
            + self.value_or_zero(MeterKind::ElectricityProducedOffpeak);

        let timestamp = now.to_rfc3339();
        for (kind, value) in [
            (MeterKind::ElectricityTotalConsumed, consumed),
            (MeterKind::ElectricityTotalProduced, produced),
            (MeterKind::ElectricityNetConsumed, consumed - produced),
        ] {
            self.readings.insert(
                kind,
                MeterReading {
                    value,
                    unit: "kWh".into(),
                    timestamp: timestamp.clone(),
                    meter_type: kind.as_str().into(),
                    tariff: String::new(),
                },
            );
        }
    }
}
