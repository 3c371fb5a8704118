//! CSV persistence with two rotation policies.
//!
//! Power readings go to one file per calendar date; the file is switched lazily
//! when a write arrives for a new date. Meter snapshots go to a single
//! provisional "session" file named after the session start date, which is
//! renamed to `{start}_{end}` when the session is finalized.

use crate::config::OutputConfig;
use crate::error::AppError;
use crate::model::{MeterKind, MeterSnapshot, PowerBatch};
use chrono::{NaiveDate, SecondsFormat};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const POWER_HEADER: [&str; 10] = [
    "timestamp",
    "device",
    "appliance",
    "power_watts",
    "measurement_timestamp",
    "module_id",
    "meter_id",
    "tariff",
    "peak_watts",
    "offpeak_watts",
];

pub const METER_HEADER: [&str; 10] = [
    "date",
    "timestamp",
    "gas_consumed",
    "electricity_consumed_peak",
    "electricity_consumed_offpeak",
    "electricity_produced_peak",
    "electricity_produced_offpeak",
    "electricity_total_consumed",
    "electricity_total_produced",
    "electricity_net_consumed",
];

#[derive(Serialize)]
struct PowerRow<'a> {
    timestamp: String,
    device: &'a str,
    appliance: &'a str,
    power_watts: f64,
    measurement_timestamp: &'a str,
    module_id: &'a str,
    meter_id: &'a str,
    tariff: Option<&'static str>,
    peak_watts: Option<f64>,
    offpeak_watts: Option<f64>,
}

#[derive(Serialize)]
struct MeterRow {
    date: String,
    timestamp: String,
    gas_consumed: Option<f64>,
    electricity_consumed_peak: Option<f64>,
    electricity_consumed_offpeak: Option<f64>,
    electricity_produced_peak: Option<f64>,
    electricity_produced_offpeak: Option<f64>,
    electricity_total_consumed: Option<f64>,
    electricity_total_produced: Option<f64>,
    electricity_net_consumed: Option<f64>,
}

impl MeterRow {
    fn from_snapshot(s: &MeterSnapshot) -> Self {
        Self {
            date: s.collection_date.format("%Y-%m-%d").to_string(),
            timestamp: s
                .collection_timestamp
                .to_rfc3339_opts(SecondsFormat::Secs, false),
            gas_consumed: s.value(MeterKind::GasConsumed),
            electricity_consumed_peak: s.value(MeterKind::ElectricityConsumedPeak),
            electricity_consumed_offpeak: s.value(MeterKind::ElectricityConsumedOffpeak),
            electricity_produced_peak: s.value(MeterKind::ElectricityProducedPeak),
            electricity_produced_offpeak: s.value(MeterKind::ElectricityProducedOffpeak),
            electricity_total_consumed: s.value(MeterKind::ElectricityTotalConsumed),
            electricity_total_produced: s.value(MeterKind::ElectricityTotalProduced),
            electricity_net_consumed: s.value(MeterKind::ElectricityNetConsumed),
        }
    }
}

/// An open output file and the period it belongs to.
pub struct RotationState {
    pub period_start: NaiveDate,
    pub path: PathBuf,
    writer: csv::Writer<File>,
}

impl RotationState {
    /// Append-or-create `path`; the header goes in only when the file is new or empty.
    fn open(path: PathBuf, period_start: NaiveDate, header: &[&str]) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let had_content = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if !had_content {
            writer.write_record(header)?;
            writer.flush()?;
        }
        debug!(path = %path.display(), new_file = !had_content, "opened output file");

        Ok(Self {
            period_start,
            path,
            writer,
        })
    }

    fn close(mut self) -> Result<PathBuf, AppError> {
        self.writer.flush()?;
        Ok(self.path)
    }
}

pub enum MeterSession {
    NoSessionFile,
    Open(RotationState),
    /// Closed, but the rename to the final name has not succeeded yet
    Pending { path: PathBuf, start: NaiveDate },
    Finalized,
}

pub struct RotationManager {
    output: OutputConfig,
    session_start: NaiveDate,
    power: Option<RotationState>,
    meter: MeterSession,
}

impl RotationManager {
    /// `session_start` is the date the process started; it names the meter session file.
    pub fn new(output: OutputConfig, session_start: NaiveDate) -> Self {
        Self {
            output,
            session_start,
            power: None,
            meter: MeterSession::NoSessionFile,
        }
    }

    pub fn power_path(&self, date: NaiveDate) -> PathBuf {
        self.output
            .directory
            .join(render(&self.output.power_filename_pattern, &[("date", date)]))
    }

    pub fn session_path(&self, start: NaiveDate) -> PathBuf {
        self.output
            .directory
            .join(render(&self.output.meter_session_pattern, &[("start_date", start)]))
    }

    pub fn final_meter_path(&self, start: NaiveDate, end: NaiveDate) -> PathBuf {
        self.output.directory.join(render(
            &self.output.meter_filename_pattern,
            &[("start_date", start), ("end_date", end)],
        ))
    }

    pub fn current_power_date(&self) -> Option<NaiveDate> {
        self.power.as_ref().map(|s| s.period_start)
    }

    pub fn meter_session(&self) -> &MeterSession {
        &self.meter
    }

    /// Append every reading of the batch to the file for the batch's date,
    /// switching files first if the date changed. Empty batches write nothing.
    pub fn write_power(&mut self, batch: &PowerBatch) -> Result<Option<PathBuf>, AppError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let today = batch.collected_at.date_naive();

        let state = match self.power.take() {
            Some(state) if state.period_start == today => state,
            previous => {
                if let Some(old) = previous {
                    let closed = old.close()?;
                    info!(path = %closed.display(), "closed power file for previous day");
                }
                RotationState::open(self.power_path(today), today, &POWER_HEADER)?
            }
        };
        let state = self.power.insert(state);

        let timestamp = batch
            .collected_at
            .to_rfc3339_opts(SecondsFormat::Secs, false);
        for r in batch.readings() {
            state.writer.serialize(PowerRow {
                timestamp: timestamp.clone(),
                device: &r.device_name,
                appliance: &r.appliance_name,
                power_watts: r.power_watts,
                measurement_timestamp: &r.measurement_timestamp,
                module_id: &r.module_id,
                meter_id: &r.meter_id,
                tariff: r.tariff.map(|t| t.as_str()),
                peak_watts: r.peak_watts,
                offpeak_watts: r.offpeak_watts,
            })?;
        }
        state.writer.flush()?;

        Ok(Some(state.path.clone()))
    }

    /// Append one snapshot row to the session file, opening it on first use.
    pub fn write_meter(&mut self, snapshot: &MeterSnapshot) -> Result<PathBuf, AppError> {
        if let MeterSession::Open(state) = &mut self.meter {
            return append_meter_row(state, snapshot);
        }

        // A write after finalization starts a new session on the snapshot's date;
        // a session whose rename failed is reopened as it was.
        let start = match &self.meter {
            MeterSession::Pending { start, .. } => *start,
            MeterSession::Finalized => snapshot.collection_date,
            _ => self.session_start,
        };
        let mut state = RotationState::open(self.session_path(start), start, &METER_HEADER)?;
        info!(path = %state.path.display(), "opened meter session file");
        let path = append_meter_row(&mut state, snapshot)?;
        self.meter = MeterSession::Open(state);
        Ok(path)
    }

    /// Close the session file and rename it to embed `start` and `end`.
    ///
    /// Returns the final path, or `None` when no session file was open. If the
    /// final file already exists the session rows are appended to it instead.
    /// On error the session stays pending and a later call tries again.
    pub fn finalize(&mut self, end: NaiveDate) -> Result<Option<PathBuf>, AppError> {
        let previous = std::mem::replace(&mut self.meter, MeterSession::NoSessionFile);
        self.meter = match previous {
            MeterSession::Open(state) => {
                let pending = MeterSession::Pending {
                    path: state.path.clone(),
                    start: state.period_start,
                };
                if let Err(e) = state.close() {
                    self.meter = pending;
                    return Err(e);
                }
                pending
            }
            other => other,
        };
        let MeterSession::Pending { path, start } = &self.meter else {
            return Ok(None);
        };
        let (session_path, start) = (path.clone(), *start);

        let final_path = self.final_meter_path(start, end);

        if final_path.exists() {
            merge_rows(&session_path, &final_path)?;
            fs::remove_file(&session_path)?;
        } else {
            fs::rename(&session_path, &final_path)?;
        }
        self.meter = MeterSession::Finalized;
        info!(
            from = %session_path.display(),
            to = %final_path.display(),
            "finalized meter session"
        );
        Ok(Some(final_path))
    }

    /// Flush and release the power file handle.
    pub fn close(&mut self) -> Result<(), AppError> {
        if let Some(state) = self.power.take() {
            let path = state.close()?;
            debug!(path = %path.display(), "closed power file");
        }
        Ok(())
    }
}

fn append_meter_row(state: &mut RotationState, snapshot: &MeterSnapshot) -> Result<PathBuf, AppError> {
    state.writer.serialize(MeterRow::from_snapshot(snapshot))?;
    state.writer.flush()?;
    Ok(state.path.clone())
}

/// Append the data rows of `from` (everything after its header line) to `to`.
fn merge_rows(from: &Path, to: &Path) -> Result<(), AppError> {
    let content = fs::read_to_string(from)?;
    let rows = content.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    let mut target = OpenOptions::new().append(true).open(to)?;
    target.write_all(rows.as_bytes())?;
    Ok(())
}

fn render(pattern: &str, dates: &[(&str, NaiveDate)]) -> String {
    dates.iter().fold(pattern.to_string(), |acc, (key, date)| {
        acc.replace(&format!("{{{}}}", key), &date.format("%Y%m%d").to_string())
    })
}
