use chrono::{DateTime, Local, NaiveDate, TimeZone};
use plugwise_collector::client::{HttpResponse, Transport};
use plugwise_collector::config::DEFAULT_HOME_LOCATION_ID;
use plugwise_collector::rotation::MeterSession;
use plugwise_collector::{AppError, Collector, Config, RunMode};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const APPLIANCES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<appliances>
  <appliance id="a-fridge">
    <name>Fridge</name>
    <type>refrigerator</type>
    <services>
      <electricity_point_meter id="pm-fridge"/>
      <electricity_interval_meter id="im-fridge"/>
      <relay id="r-fridge"/>
    </services>
  </appliance>
  <appliance id="a-washer">
    <name>Washer</name>
    <services>
      <electricity_point_meter id="pm-washer"/>
    </services>
  </appliance>
</appliances>"#;

const MODULES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<modules>
  <module id="mod-fridge">
    <services>
      <electricity_point_meter id="pm-fridge">
        <measurement directionality="consumed" log_date="2024-03-01T11:59:30+01:00">85.50</measurement>
        <measurement directionality="produced" log_date="2024-03-01T11:59:30+01:00">0.00</measurement>
      </electricity_point_meter>
    </services>
  </module>
  <module id="mod-washer">
    <services>
      <electricity_point_meter id="pm-washer">
        <measurement directionality="consumed" log_date="2024-03-01T11:59:30+01:00">garbage</measurement>
      </electricity_point_meter>
    </services>
  </module>
  <module id="mod-orphan">
    <services>
      <electricity_point_meter id="pm-orphan">
        <measurement directionality="consumed" log_date="2024-03-01T11:59:30+01:00">999</measurement>
      </electricity_point_meter>
    </services>
  </module>
</modules>"#;

fn domain_objects() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<domain_objects>
  <location id="{}">
    <name>Home</name>
    <logs>
      <point_log id="pl-power">
        <type>electricity_consumed</type>
        <unit>W</unit>
        <period start_date="2024-03-01T11:59:00+01:00" end_date="2024-03-01T11:59:00+01:00">
          <measurement log_date="2024-03-01T11:59:00+01:00" tariff="nl_peak">412.00</measurement>
          <measurement log_date="2024-03-01T11:59:00+01:00" tariff="nl_offpeak">0.00</measurement>
        </period>
      </point_log>
      <cumulative_log id="cl-consumed">
        <type>electricity_consumed</type>
        <unit>kWh</unit>
        <period start_date="2024-03-01T11:00:00+01:00" end_date="2024-03-01T11:00:00+01:00">
          <measurement log_date="2024-03-01T11:00:00+01:00" tariff="nl_peak">100.0</measurement>
          <measurement log_date="2024-03-01T11:00:00+01:00" tariff="nl_offpeak">50.0</measurement>
        </period>
      </cumulative_log>
      <cumulative_log id="cl-produced">
        <type>electricity_produced</type>
        <unit>kWh</unit>
        <period start_date="2024-03-01T11:00:00+01:00" end_date="2024-03-01T11:00:00+01:00">
          <measurement log_date="2024-03-01T11:00:00+01:00" tariff="nl_peak">10.0</measurement>
        </period>
      </cumulative_log>
      <cumulative_log id="cl-gas">
        <type>gas_consumed</type>
        <unit>m3</unit>
        <period start_date="2024-03-01T11:00:00+01:00" end_date="2024-03-01T11:00:00+01:00">
          <measurement log_date="2024-03-01T11:00:00+01:00">5.0</measurement>
        </period>
      </cumulative_log>
      <interval_log id="il-1">
        <type>electricity_consumed</type>
        <unit>Wh</unit>
      </interval_log>
    </logs>
  </location>
</domain_objects>"#,
        DEFAULT_HOME_LOCATION_ID
    )
}

/// Serves scripted responses per path. The last response of a script repeats;
/// status 0 simulates a connection error.
#[derive(Clone, Default)]
struct FakeGateway {
    inner: Arc<Mutex<GatewayState>>,
}

#[derive(Default)]
struct GatewayState {
    scripts: HashMap<String, Vec<(u16, String)>>,
    calls: Vec<String>,
}

impl FakeGateway {
    fn healthy() -> Self {
        Self::default()
            .route("/core/appliances", vec![(200, APPLIANCES.to_string())])
            .route("/core/modules", vec![(200, MODULES.to_string())])
            .route("/core/domain_objects", vec![(200, domain_objects())])
    }

    fn route(self, path: &str, responses: Vec<(u16, String)>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(path.to_string(), responses);
        self
    }

    fn calls_to(&self, path: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }
}

impl Transport for FakeGateway {
    async fn get(&self, url: &str, _username: &str, _password: &str) -> Result<HttpResponse, AppError> {
        let path = url.find("/core").map(|i| &url[i..]).unwrap_or(url).to_string();
        let mut state = self.inner.lock().unwrap();
        let n = state.calls.iter().filter(|p| **p == path).count();
        state.calls.push(path.clone());

        let script = state
            .scripts
            .get(&path)
            .ok_or_else(|| AppError::Http(format!("no route for {}", path)))?;
        let (status, body) = script[n.min(script.len() - 1)].clone();
        if status == 0 {
            return Err(AppError::Http("connection refused".into()));
        }
        Ok(HttpResponse { status, body })
    }
}

fn at(d: u32, h: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.output.directory = dir.join("data");
    cfg.collection.retry_backoff_secs = 0;
    cfg.collection.retry_attempts = 3;
    cfg
}

fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_single_cycle_writes_power_and_meter_files() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FakeGateway::healthy();
    let mut collector = Collector::new(config(dir.path()), gateway.clone(), day(1));

    let report = collector.run_cycle(at(1, 12)).await;

    assert!(report.failed_devices.is_empty());
    assert_eq!(report.power_readings, 3);
    assert_eq!(collector.appliances().len(), 2);

    let power_file = report.power_file.unwrap();
    assert!(power_file.ends_with("power_usage_20240301.csv"));
    let power = lines(&power_file);
    assert_eq!(power.len(), 4);
    let smile_row = power.iter().find(|l| l.contains(",smile,")).unwrap();
    assert!(smile_row.contains(",Home,412.0,"));
    assert!(smile_row.ends_with(",peak,412.0,0.0"));
    let washer_row = power.iter().find(|l| l.contains(",Washer,")).unwrap();
    assert!(washer_row.contains(",Washer,0.0,"));
    assert!(!power.iter().any(|l| l.contains("pm-orphan")));

    let session_file = report.meter_file.unwrap();
    assert!(session_file.ends_with("meter_readings_session_20240301.csv"));
    assert_eq!(collector.state().last_meter_collection_date, Some(day(1)));

    collector.shutdown(day(1));
    assert!(!session_file.exists());
    let final_file = dir.path().join("data/meter_readings_20240301_20240301.csv");
    let meter = lines(&final_file);
    assert_eq!(meter.len(), 2);
    let row: Vec<&str> = meter[1].split(',').collect();
    assert_eq!(row[0], "2024-03-01");
    assert_eq!(
        &row[2..],
        &["5.0", "100.0", "50.0", "10.0", "", "150.0", "10.0", "140.0"]
    );
}

#[tokio::test]
async fn test_stretch_http_500_skips_stretch_only() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FakeGateway::healthy().route("/core/appliances", vec![(500, String::new())]);
    let mut collector = Collector::new(config(dir.path()), gateway.clone(), day(1));

    let report = collector.run_cycle(at(1, 12)).await;

    assert_eq!(gateway.calls_to("/core/appliances"), 3);
    assert_eq!(gateway.calls_to("/core/modules"), 0);
    assert_eq!(report.failed_devices, vec!["stretch"]);
    assert_eq!(report.power_readings, 1);

    let power = lines(&report.power_file.unwrap());
    assert_eq!(power.len(), 2);
    assert!(power[1].contains(",smile,"));
    assert!(report.meter_file.is_some());
}

#[tokio::test]
async fn test_modules_failure_keeps_appliance_cache() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FakeGateway::healthy().route(
        "/core/modules",
        vec![
            (0, String::new()),
            (503, String::new()),
            (500, String::new()),
            (200, MODULES.to_string()),
        ],
    );
    let mut collector = Collector::new(config(dir.path()), gateway.clone(), day(1));

    let first = collector.run_cycle(at(1, 12)).await;
    assert_eq!(first.failed_devices, vec!["stretch"]);
    assert_eq!(collector.appliances().len(), 2);

    let second = collector.run_cycle(at(1, 13)).await;
    assert!(second.failed_devices.is_empty());
    assert_eq!(second.power_readings, 3);
    assert_eq!(gateway.calls_to("/core/appliances"), 1);
    assert_eq!(gateway.calls_to("/core/modules"), 4);
}

#[tokio::test]
async fn test_meters_collected_once_per_day() {
    let dir = tempfile::tempdir().unwrap();
    let mut collector = Collector::new(config(dir.path()), FakeGateway::healthy(), day(1));

    let first = collector.run_cycle(at(1, 10)).await;
    let second = collector.run_cycle(at(1, 11)).await;
    let third = collector.run_cycle(at(2, 9)).await;

    let session = first.meter_file.unwrap();
    assert_eq!(second.meter_file, None);
    assert_eq!(third.meter_file.as_ref(), Some(&session));
    assert_eq!(lines(&session).len(), 3);
    assert_eq!(collector.state().last_meter_collection_date, Some(day(2)));

    // power rotated, meters did not
    assert_ne!(first.power_file, third.power_file);
    assert_eq!(lines(first.power_file.as_ref().unwrap()).len(), 7);
    assert_eq!(lines(third.power_file.as_ref().unwrap()).len(), 4);

    collector.shutdown(day(2));
    assert!(dir
        .path()
        .join("data/meter_readings_20240301_20240302.csv")
        .exists());
}

#[tokio::test]
async fn test_meter_gate_stays_open_until_smile_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FakeGateway::healthy().route(
        "/core/domain_objects",
        vec![
            (500, String::new()),
            (500, String::new()),
            (500, String::new()),
            (200, domain_objects()),
        ],
    );
    let mut collector = Collector::new(config(dir.path()), gateway, day(1));

    let first = collector.run_cycle(at(1, 10)).await;
    assert_eq!(first.failed_devices, vec!["smile"]);
    assert_eq!(first.meter_file, None);
    assert_eq!(collector.state().last_meter_collection_date, None);

    let second = collector.run_cycle(at(1, 11)).await;
    assert!(second.meter_file.is_some());
    assert_eq!(collector.state().last_meter_collection_date, Some(day(1)));
}

#[tokio::test]
async fn test_malformed_smile_document_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let broken = domain_objects().replace("5.0</measurement>", "five</measurement>");
    let gateway = FakeGateway::healthy().route("/core/domain_objects", vec![(200, broken)]);
    let mut collector = Collector::new(config(dir.path()), gateway, day(1));

    let report = collector.run_cycle(at(1, 12)).await;

    assert_eq!(report.failed_devices, vec!["smile"]);
    assert_eq!(report.power_readings, 2);
    assert_eq!(report.meter_file, None);
    assert!(matches!(
        collector.rotation().meter_session(),
        MeterSession::NoSessionFile
    ));
}

#[tokio::test]
async fn test_disabled_device_is_not_polled() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.devices.smile.enabled = false;
    let gateway = FakeGateway::healthy();
    let mut collector = Collector::new(cfg, gateway.clone(), day(1));

    let report = collector.run_cycle(at(1, 12)).await;

    assert!(report.failed_devices.is_empty());
    assert_eq!(report.power_readings, 2);
    assert_eq!(report.meter_file, None);
    assert_eq!(gateway.calls_to("/core/domain_objects"), 0);
}

#[tokio::test]
async fn test_no_meters_option_skips_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.collection.collect_meters = false;
    let mut collector = Collector::new(cfg, FakeGateway::healthy(), day(1));

    let report = collector.run_cycle(at(1, 12)).await;

    assert_eq!(report.power_readings, 3);
    assert_eq!(report.meter_file, None);
    collector.shutdown(day(1));
    assert!(!dir
        .path()
        .join("data/meter_readings_20240301_20240301.csv")
        .exists());
}

#[tokio::test]
async fn test_all_devices_failing_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FakeGateway::default();
    let mut collector = Collector::new(config(dir.path()), gateway, day(1));

    let report = collector.run_cycle(at(1, 12)).await;

    assert_eq!(report.failed_devices, vec!["stretch", "smile"]);
    assert_eq!(report.power_file, None);
    assert_eq!(report.meter_file, None);
    assert!(!dir.path().join("data").exists());
}

#[tokio::test]
async fn test_single_run_finalizes_once() {
    let dir = tempfile::tempdir().unwrap();
    let today = Local::now().date_naive();
    let mut collector = Collector::new(config(dir.path()), FakeGateway::healthy(), today);
    let (_tx, rx) = watch::channel(false);

    let cycles = collector.run(RunMode::Single, rx).await;

    assert_eq!(cycles, 1);
    assert!(collector.is_finalized());
    assert!(matches!(
        collector.rotation().meter_session(),
        MeterSession::Finalized
    ));
    let finalized: Vec<String> = std::fs::read_dir(dir.path().join("data"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("meter_readings_"))
        .collect();
    assert_eq!(finalized.len(), 1);
    assert!(!finalized[0].contains("session"));

    // a second shutdown is a no-op
    collector.shutdown(today);
    assert!(collector.is_finalized());
}

#[tokio::test]
async fn test_failed_finalize_is_retried_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let mut collector = Collector::new(config(dir.path()), FakeGateway::healthy(), day(1));
    let report = collector.run_cycle(at(1, 12)).await;
    let session = report.meter_file.unwrap();

    let blocked = dir.path().join("data/meter_readings_20240301_20240302.csv");
    std::fs::create_dir_all(&blocked).unwrap();
    collector.shutdown(day(2));

    assert!(!collector.is_finalized());
    assert!(session.exists());
    assert!(matches!(
        collector.rotation().meter_session(),
        MeterSession::Pending { .. }
    ));

    std::fs::remove_dir(&blocked).unwrap();
    drop(collector);

    assert!(!session.exists());
    let finalized: Vec<String> = std::fs::read_dir(dir.path().join("data"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("meter_readings_"))
        .collect();
    assert_eq!(finalized.len(), 1);
    assert!(finalized[0].starts_with("meter_readings_20240301_"));
}

#[tokio::test(start_paused = true)]
async fn test_continuous_run_stops_on_shutdown_signal() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.collection.interval_secs = 60;
    let today = Local::now().date_naive();
    let mut collector = Collector::new(cfg, FakeGateway::healthy(), today);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(150)).await;
        let _ = tx.send(true);
    });

    let cycles = collector.run(RunMode::Continuous, rx).await;

    assert_eq!(cycles, 3);
    assert!(collector.state().shutdown_requested);
    assert!(collector.is_finalized());
}

#[tokio::test]
async fn test_shutdown_before_first_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FakeGateway::healthy();
    let mut collector = Collector::new(config(dir.path()), gateway.clone(), day(1));
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let cycles = collector.run(RunMode::Continuous, rx).await;

    assert_eq!(cycles, 0);
    assert_eq!(gateway.calls_to("/core/appliances"), 0);
    assert!(collector.is_finalized());
}
