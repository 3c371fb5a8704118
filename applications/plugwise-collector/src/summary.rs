//! Console tables shown to the operator after each collection.

use crate::model::{MeterKind, MeterSnapshot, PowerBatch, PowerReading};

const RULE: &str = "============================================================";

pub fn render_power_summary(batch: &PowerBatch) -> String {
    let mut lines = vec![
        format!(
            "Current Power Usage - {}",
            batch.collected_at.format("%Y-%m-%d %H:%M:%S")
        ),
        RULE.to_string(),
    ];

    let mut grand_total = 0.0;
    for (device, readings) in &batch.devices {
        lines.push(String::new());
        lines.push(format!("{}:", device.to_uppercase()));
        let mut device_total = 0.0;
        for reading in readings.values() {
            device_total += reading.power_watts;
            lines.push(power_line(reading));
        }
        lines.push(format!("  {:25} : {:8.2} W", "TOTAL", device_total));
        grand_total += device_total;
    }

    lines.push(RULE.to_string());
    lines.push(format!("  GRAND TOTAL POWER USAGE : {:8.2} W", grand_total));
    lines.push(RULE.to_string());
    lines.join("\n")
}

fn power_line(reading: &PowerReading) -> String {
    let line = format!("  {:25} : {:8.2} W", reading.appliance_name, reading.power_watts);
    match reading.tariff {
        Some(tariff) => format!("{} ({})", line, tariff.as_str()),
        None => line,
    }
}

const METER_SECTIONS: [(&str, &[(&str, MeterKind, &str)]); 3] = [
    (
        "Electricity Consumption",
        &[
            ("Peak:", MeterKind::ElectricityConsumedPeak, "kWh"),
            ("Off-peak:", MeterKind::ElectricityConsumedOffpeak, "kWh"),
            ("Total:", MeterKind::ElectricityTotalConsumed, "kWh"),
        ],
    ),
    (
        "Electricity Production",
        &[
            ("Peak:", MeterKind::ElectricityProducedPeak, "kWh"),
            ("Off-peak:", MeterKind::ElectricityProducedOffpeak, "kWh"),
            ("Total:", MeterKind::ElectricityTotalProduced, "kWh"),
        ],
    ),
    (
        "Summary",
        &[
            ("Net:", MeterKind::ElectricityNetConsumed, "kWh"),
            ("Gas:", MeterKind::GasConsumed, "m³"),
        ],
    ),
];

pub fn render_meter_summary(snapshot: &MeterSnapshot) -> String {
    let mut lines = vec![
        format!("Meter Readings - {}", snapshot.collection_date),
        RULE.to_string(),
    ];
    for (title, rows) in METER_SECTIONS {
        lines.push(format!("  {}:", title));
        // missing values are left out
        lines.extend(rows.iter().filter_map(|(label, kind, unit)| {
            snapshot
                .value(*kind)
                .map(|value| format!("    {:9} {:12.2} {}", label, value, unit))
        }));
    }
    lines.push(RULE.to_string());
    lines.join("\n")
}
