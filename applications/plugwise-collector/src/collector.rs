//! Collection scheduler: one cycle polls both gateways, persists the power
//! batch and, once per day, the meter snapshot.

use crate::appliances::ApplianceMapping;
use crate::client::{
    DeviceClient, RetryPolicy, Transport, SMILE_DOMAIN_OBJECTS, STRETCH_APPLIANCES,
    STRETCH_MODULES,
};
use crate::config::Config;
use crate::db::{self, DbPool};
use crate::model::{MeterSnapshot, PowerBatch, PowerReading};
use crate::rotation::RotationManager;
use crate::smile::{self, SmileSnapshot};
use crate::stretch;
use crate::summary::{render_meter_summary, render_power_summary};
use chrono::{DateTime, Local, NaiveDate};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Single,
    Continuous,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerState {
    /// Date of the last successfully persisted meter snapshot
    pub last_meter_collection_date: Option<NaiveDate>,
    pub shutdown_requested: bool,
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub power_readings: usize,
    pub power_file: Option<PathBuf>,
    pub meter_file: Option<PathBuf>,
    /// Enabled devices that produced no data this cycle
    pub failed_devices: Vec<&'static str>,
}

pub struct Collector<T> {
    config: Config,
    client: DeviceClient<T>,
    appliances: ApplianceMapping,
    rotation: RotationManager,
    db: Option<DbPool>,
    state: SchedulerState,
    log_summary: bool,
    finalized: bool,
}

impl<T: Transport> Collector<T> {
    /// `session_start` names the meter session file; normally the process start date.
    pub fn new(config: Config, transport: T, session_start: NaiveDate) -> Self {
        let retry = RetryPolicy::new(
            config.collection.retry_attempts,
            Duration::from_secs(config.collection.retry_backoff_secs),
        );
        let rotation = RotationManager::new(config.output.clone(), session_start);
        Self {
            client: DeviceClient::new(transport, retry),
            appliances: ApplianceMapping::default(),
            rotation,
            db: None,
            state: SchedulerState::default(),
            log_summary: false,
            finalized: false,
            config,
        }
    }

    pub fn with_db(mut self, pool: DbPool) -> Self {
        self.db = Some(pool);
        self
    }

    /// Log the operator tables after each write.
    pub fn with_summary(mut self, enabled: bool) -> Self {
        self.log_summary = enabled;
        self
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn appliances(&self) -> &ApplianceMapping {
        &self.appliances
    }

    pub fn rotation(&self) -> &RotationManager {
        &self.rotation
    }

    fn meters_due(&self, today: NaiveDate) -> bool {
        self.config.collection.collect_meters
            && self.state.last_meter_collection_date != Some(today)
    }

    /// Rebuild the appliance cache if it is empty. Returns false when the
    /// registry could not be fetched.
    async fn refresh_appliances(&mut self) -> bool {
        if !self.appliances.is_empty() {
            return true;
        }
        let endpoint = self.config.devices.stretch.endpoint(stretch::DEVICE_NAME);
        info!(device = %endpoint.name, "building appliance-meter mapping");
        match self.client.fetch(&endpoint, STRETCH_APPLIANCES).await {
            Ok(xml) => {
                self.appliances = ApplianceMapping::build(&xml);
                true
            }
            Err(failure) => {
                warn!(device = %endpoint.name, path = STRETCH_APPLIANCES, error = %failure, "failed to fetch appliance registry");
                false
            }
        }
    }

    async fn collect_stretch(&mut self, now: DateTime<Local>) -> Option<BTreeMap<String, PowerReading>> {
        if !self.refresh_appliances().await {
            return None;
        }
        let endpoint = self.config.devices.stretch.endpoint(stretch::DEVICE_NAME);
        let xml = match self.client.fetch(&endpoint, STRETCH_MODULES).await {
            Ok(xml) => xml,
            Err(failure) => {
                warn!(device = %endpoint.name, path = STRETCH_MODULES, error = %failure, "no power data this cycle");
                return None;
            }
        };
        match stretch::extract_power(&xml, &self.appliances, now) {
            Ok(readings) => {
                debug!(device = %endpoint.name, readings = readings.len(), "extracted power readings");
                Some(readings)
            }
            Err(e) => {
                error!(device = %endpoint.name, error = %e, "failed to parse Stretch modules");
                None
            }
        }
    }

    async fn collect_smile(&self, now: DateTime<Local>) -> Option<SmileSnapshot> {
        let endpoint = self.config.devices.smile.endpoint(smile::DEVICE_NAME);
        let xml = match self.client.fetch(&endpoint, SMILE_DOMAIN_OBJECTS).await {
            Ok(xml) => xml,
            Err(failure) => {
                warn!(device = %endpoint.name, path = SMILE_DOMAIN_OBJECTS, error = %failure, "no Smile data this cycle");
                return None;
            }
        };
        match smile::extract(&xml, &self.config.smile.home_location_id, now) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!(device = %endpoint.name, error = %e, "failed to parse Smile domain objects");
                None
            }
        }
    }

    /// Run one collection cycle at `now`. Failures are logged and reflected in
    /// the report; nothing here is fatal.
    pub async fn run_cycle(&mut self, now: DateTime<Local>) -> CycleReport {
        let mut report = CycleReport::default();
        let mut batch = PowerBatch::new(now);

        if self.config.devices.stretch.enabled {
            match self.collect_stretch(now).await {
                Some(readings) => batch.insert_device(stretch::DEVICE_NAME, readings),
                None => report.failed_devices.push(stretch::DEVICE_NAME),
            }
        }

        let smile_snapshot = if self.config.devices.smile.enabled {
            let snapshot = self.collect_smile(now).await;
            if snapshot.is_none() {
                report.failed_devices.push(smile::DEVICE_NAME);
            }
            snapshot
        } else {
            None
        };
        let (smile_power, smile_meters) = match smile_snapshot {
            Some(s) => (s.power, Some(s.meters)),
            None => (None, None),
        };
        if let Some(power) = smile_power {
            batch.insert_device(
                smile::DEVICE_NAME,
                BTreeMap::from([(power.appliance_name.clone(), power)]),
            );
        }

        report.power_readings = batch.len();
        if batch.is_empty() {
            warn!("no power data collected this cycle");
        } else {
            report.power_file = self.persist_power(&batch).await;
        }

        let today = now.date_naive();
        if self.meters_due(today) {
            match smile_meters {
                Some(meters) => report.meter_file = self.persist_meters(&meters).await,
                None if self.config.devices.smile.enabled => {
                    warn!("meter collection due but no Smile data; retrying next cycle")
                }
                None => {}
            }
        }

        report
    }

    async fn persist_power(&mut self, batch: &PowerBatch) -> Option<PathBuf> {
        let path = match self.rotation.write_power(batch) {
            Ok(path) => {
                if let Some(p) = &path {
                    info!(readings = batch.len(), path = %p.display(), "saved power readings");
                }
                path
            }
            Err(e) => {
                error!(error = %e, "failed to write power readings");
                None
            }
        };

        if let Some(pool) = &self.db {
            if let Err(e) = db::insert_power_batch(pool, batch).await {
                error!(error = %e, "failed to insert power readings");
            }
        }
        if self.log_summary {
            info!("\n{}", render_power_summary(batch));
        }
        path
    }

    /// The once-per-day gate only closes when the CSV write succeeds.
    async fn persist_meters(&mut self, meters: &MeterSnapshot) -> Option<PathBuf> {
        let path = match self.rotation.write_meter(meters) {
            Ok(path) => {
                info!(date = %meters.collection_date, path = %path.display(), "saved meter readings");
                self.state.last_meter_collection_date = Some(meters.collection_date);
                path
            }
            Err(e) => {
                error!(error = %e, "failed to write meter readings");
                return None;
            }
        };

        if let Some(pool) = &self.db {
            if let Err(e) = db::insert_meter_snapshot(pool, meters).await {
                error!(error = %e, "failed to insert meter readings");
            }
        }
        if self.log_summary {
            info!("\n{}", render_meter_summary(meters));
        }
        Some(path)
    }

    /// Run cycles until `mode` is done or `shutdown` turns true, then finalize.
    /// Returns the number of cycles run.
    pub async fn run(&mut self, mode: RunMode, mut shutdown: watch::Receiver<bool>) -> usize {
        let interval = Duration::from_secs(self.config.collection.interval_secs);
        if mode == RunMode::Continuous {
            info!(interval_secs = interval.as_secs(), "starting continuous collection");
        }

        let mut cycles = 0;
        loop {
            if *shutdown.borrow() {
                info!("shutdown requested");
                self.state.shutdown_requested = true;
                break;
            }

            let report = self.run_cycle(Local::now()).await;
            cycles += 1;
            debug!(
                cycle = cycles,
                readings = report.power_readings,
                failed = ?report.failed_devices,
                "cycle complete"
            );

            if mode == RunMode::Single {
                break;
            }
            debug!(interval_secs = interval.as_secs(), "waiting until next collection");
            wait_for_next_cycle(interval, &mut shutdown).await;
        }

        self.shutdown(Local::now().date_naive());
        cycles
    }
}

impl<T> Collector<T> {
    /// Finalize the meter session and release file handles. Once finalizing
    /// has succeeded, later calls do nothing; after a failure the next call
    /// (at the latest the one from `Drop`) tries again.
    pub fn shutdown(&mut self, today: NaiveDate) {
        if self.finalized {
            return;
        }

        match self.rotation.finalize(today) {
            Ok(Some(path)) => {
                info!(path = %path.display(), "meter session finalized");
                self.finalized = true;
            }
            Ok(None) => {
                debug!("no meter session to finalize");
                self.finalized = true;
            }
            Err(e) => error!(error = %e, "failed to finalize meter session"),
        }
        if let Err(e) = self.rotation.close() {
            error!(error = %e, "failed to close power file");
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl<T> Drop for Collector<T> {
    fn drop(&mut self) {
        self.shutdown(Local::now().date_naive());
    }
}

/// Sleep for `interval`, returning early once `shutdown` turns true.
async fn wait_for_next_cycle(interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return,
                Ok(()) => continue,
                // sender gone: nobody can ask for shutdown any more
                Err(_) => {
                    (&mut sleep).await;
                    return;
                }
            },
        }
    }
}
