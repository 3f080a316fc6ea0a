use crate::error::ConfigError;
use crate::intercom::Intercom;
use crate::message::Message;
use crate::observation::{secs, InstanceContext, Observation};
use crate::sensor::SensorCatalog;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// How a weekday listed with no intervals is treated when other weekdays of
/// the same schedule do have intervals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyWeekday {
    #[default]
    Inactive,
    Active,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub port: String,
    pub sensor: String,
    #[serde(default)]
    pub schedules: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    start_date: NaiveDate,
    end_date: NaiveDate,
    #[serde(default)]
    weekdays: BTreeMap<String, Vec<TimeRangeConfig>>,
    #[serde(default)]
    observations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeRangeConfig {
    start_time: NaiveTime,
    end_time: NaiveTime,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ConfigError> {
        if end < start {
            return Err(ConfigError::InvertedTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }
}

/// Allowed intervals per weekday, Monday first. `None` means the weekday
/// is not listed at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Weekdays {
    days: [Option<Vec<TimeRange>>; 7],
}

impl Weekdays {
    pub fn set(&mut self, day_index: usize, ranges: Vec<TimeRange>) {
        if let Some(slot) = self.days.get_mut(day_index) {
            *slot = Some(ranges);
        }
    }

    pub fn has_intervals(&self) -> bool {
        self.days
            .iter()
            .any(|day| day.as_ref().is_some_and(|ranges| !ranges.is_empty()))
    }

    pub fn allows(&self, at: NaiveDateTime, policy: EmptyWeekday) -> bool {
        if !self.has_intervals() {
            return true;
        }
        let day_index = at.weekday().num_days_from_monday() as usize;
        match &self.days[day_index] {
            None => false,
            Some(ranges) if ranges.is_empty() => policy == EmptyWeekday::Active,
            Some(ranges) => ranges.iter().any(|range| range.contains(at.time())),
        }
    }
}

/// A dated, weekly timetable and the observations it fires.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub enabled: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub weekdays: Weekdays,
    pub observations: Vec<Observation>,
}

impl Schedule {
    pub fn is_active(&self, at: NaiveDateTime, policy: EmptyWeekday) -> bool {
        self.enabled
            && self.start_date <= at.date()
            && at.date() <= self.end_date
            && self.weekdays.allows(at, policy)
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        today > self.end_date
    }

    fn from_value(
        value: Value,
        sensor: &str,
        catalog: &SensorCatalog,
    ) -> Result<Self, ConfigError> {
        let raw: ScheduleConfig = serde_json::from_value(value)?;
        if raw.start_date > raw.end_date {
            return Err(ConfigError::InvertedDateRange {
                start: raw.start_date,
                end: raw.end_date,
            });
        }

        let mut weekdays = Weekdays::default();
        for (day, ranges) in raw.weekdays {
            let Some(day_index) = WEEKDAYS.iter().position(|name| *name == day.to_lowercase())
            else {
                return Err(ConfigError::InvalidValue {
                    field: "weekdays",
                    reason: format!("unknown weekday `{day}`"),
                });
            };
            let ranges = ranges
                .into_iter()
                .map(|r| TimeRange::new(r.start_time, r.end_time))
                .collect::<Result<Vec<_>, _>>()?;
            weekdays.set(day_index, ranges);
        }

        if raw.observations.is_empty() {
            return Err(ConfigError::MissingField("observations"));
        }
        let observations = raw
            .observations
            .iter()
            .map(|name| catalog.observation(sensor, name).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            enabled: raw.enabled,
            start_date: raw.start_date,
            end_date: raw.end_date,
            weekdays,
            observations,
        })
    }
}

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    WaitingForWindow,
    Firing,
    Sleeping,
}

#[derive(Debug)]
pub enum Step {
    /// Publish `observation` to its port, then sleep.
    Fire {
        observation: Observation,
        sleep: Duration,
    },
    /// Nothing to do yet; check again later.
    Wait(Duration),
    /// No schedule can fire again.
    Finished,
}

struct ScheduleRun {
    index: usize,
    schedule: Schedule,
    cursor: usize,
}

/// Fires the observations of one (port, sensor) pair according to its
/// schedules.
pub struct Scheduler {
    name: String,
    port: String,
    sensor: String,
    context: InstanceContext,
    runs: Vec<ScheduleRun>,
    next_run: usize,
    fired_onetime: HashSet<String>,
    policy: EmptyWeekday,
    poll_interval: Duration,
    state: SchedulerState,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        port: impl Into<String>,
        sensor: impl Into<String>,
        context: InstanceContext,
        schedules: Vec<Schedule>,
        policy: EmptyWeekday,
        poll_interval: Duration,
    ) -> Self {
        let runs = schedules
            .into_iter()
            .enumerate()
            .map(|(index, schedule)| ScheduleRun {
                index,
                schedule,
                cursor: 0,
            })
            .collect();
        Self {
            name: name.into(),
            port: port.into(),
            sensor: sensor.into(),
            context,
            runs,
            next_run: 0,
            fired_onetime: HashSet::new(),
            policy,
            poll_interval,
            state: SchedulerState::Idle,
        }
    }

    /// Builds a scheduler from its configuration block. Schedules that fail
    /// to load are logged and left out; the scheduler itself is rejected only
    /// when its sensor is unknown.
    pub fn from_config(
        name: &str,
        value: Value,
        catalog: &SensorCatalog,
        node_id: &str,
        project_id: &str,
        policy: EmptyWeekday,
        poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = serde_json::from_value(value)?;
        if config.port.trim().is_empty() {
            return Err(ConfigError::MissingField("port"));
        }
        if catalog.get(&config.sensor).is_none() {
            return Err(ConfigError::UnknownSensor(config.sensor));
        }

        let mut schedules = Vec::new();
        for (index, raw) in config.schedules.into_iter().enumerate() {
            match Schedule::from_value(raw, &config.sensor, catalog) {
                Ok(schedule) => schedules.push(schedule),
                Err(err) => {
                    tracing::error!(scheduler = name, schedule = index, error = %err, "schedule rejected");
                }
            }
        }

        let context = InstanceContext {
            port_name: config.port.clone(),
            sensor_name: config.sensor.clone(),
            node_id: node_id.to_string(),
            project_id: project_id.to_string(),
        };
        Ok(Self::new(
            name,
            config.port,
            config.sensor,
            context,
            schedules,
            policy,
            poll_interval,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn schedule_count(&self) -> usize {
        self.runs.len()
    }

    /// Decides what to do at `now`. Expired and exhausted schedules are
    /// dropped; active schedules take turns, each walking its observations
    /// cyclically.
    pub fn step(&mut self, now: NaiveDateTime) -> Step {
        self.drop_finished(now.date());
        if self.runs.is_empty() {
            self.state = SchedulerState::Idle;
            return Step::Finished;
        }

        let count = self.runs.len();
        for offset in 0..count {
            let slot = (self.next_run + offset) % count;
            if !self.runs[slot].schedule.is_active(now, self.policy) {
                continue;
            }
            if let Some(template) = self.take_next(slot) {
                self.next_run = (slot + 1) % count;
                self.state = SchedulerState::Firing;
                let observation = template.instantiate(&self.context);
                let sleep = secs(observation.sleep_time);
                return Step::Fire { observation, sleep };
            }
        }

        self.state = SchedulerState::WaitingForWindow;
        Step::Wait(self.poll_interval)
    }

    fn take_next(&mut self, slot: usize) -> Option<Observation> {
        let run = &mut self.runs[slot];
        let len = run.schedule.observations.len();
        for offset in 0..len {
            let index = (run.cursor + offset) % len;
            let template = &run.schedule.observations[index];
            if !template.enabled {
                continue;
            }
            if template.onetime && self.fired_onetime.contains(&template.name) {
                continue;
            }
            run.cursor = (index + 1) % len;
            if template.onetime {
                self.fired_onetime.insert(template.name.clone());
            }
            return Some(template.clone());
        }
        None
    }

    fn drop_finished(&mut self, today: NaiveDate) {
        let fired = &self.fired_onetime;
        let name = &self.name;
        let before = self.runs.len();
        self.runs.retain(|run| {
            if !run.schedule.enabled {
                tracing::info!(scheduler = %name, schedule = run.index, "schedule disabled");
                return false;
            }
            if run.schedule.is_expired(today) {
                tracing::info!(scheduler = %name, schedule = run.index, "schedule expired");
                return false;
            }
            let fireable = run
                .schedule
                .observations
                .iter()
                .any(|obs| obs.enabled && !(obs.onetime && fired.contains(&obs.name)));
            if !fireable {
                tracing::info!(scheduler = %name, schedule = run.index, "schedule has nothing left to fire");
            }
            fireable
        });
        if self.runs.len() != before && !self.runs.is_empty() {
            self.next_run %= self.runs.len();
        }
    }

    pub fn start(
        self,
        bus: Intercom,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(bus, clock, cancel))
    }

    async fn run(mut self, bus: Intercom, clock: Arc<dyn Clock>, cancel: CancellationToken) {
        self.state = SchedulerState::WaitingForWindow;
        tracing::info!(
            scheduler = %self.name,
            port = %self.port,
            sensor = %self.sensor,
            schedules = self.runs.len(),
            "scheduler started"
        );

        loop {
            let delay = match self.step(clock.now()) {
                Step::Fire { observation, sleep } => {
                    let target = observation
                        .current_receiver()
                        .unwrap_or(self.port.as_str())
                        .to_string();
                    tracing::info!(
                        scheduler = %self.name,
                        observation = %observation.name,
                        id = %observation.id,
                        target = %target,
                        "firing observation"
                    );
                    bus.publish(&target, Message::observation(observation));
                    self.state = SchedulerState::Sleeping;
                    sleep
                }
                Step::Wait(delay) => delay,
                Step::Finished => {
                    tracing::info!(scheduler = %self.name, "no schedules left; scheduler finished");
                    break;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.state = SchedulerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercom::Subscription;
    use serde_json::json;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
            .expect("datetime")
    }

    fn hms(raw: &str) -> NaiveTime {
        NaiveTime::parse_from_str(raw, "%H:%M:%S").expect("time")
    }

    fn catalog() -> SensorCatalog {
        let sensors = BTreeMap::from([(
            "weather".to_string(),
            json!({
                "type": "weatherStation",
                "observations": [
                    {"name": "getValues", "receivers": ["preProcessor"], "sleepTime": 5.0},
                    {"name": "getStatus", "receivers": ["preProcessor"], "sleepTime": 1.0},
                    {"name": "init", "onetime": true, "receivers": []},
                    {"name": "off", "enabled": false, "receivers": []}
                ]
            }),
        )]);
        SensorCatalog::from_config(&sensors)
    }

    fn scheduler(schedules: Value, policy: EmptyWeekday) -> Scheduler {
        Scheduler::from_config(
            "weatherScheduler",
            json!({"port": "com1", "sensor": "weather", "schedules": schedules}),
            &catalog(),
            "node-1",
            "p1",
            policy,
            Duration::from_millis(500),
        )
        .expect("scheduler")
    }

    fn fired(step: Step) -> Observation {
        match step {
            Step::Fire { observation, .. } => observation,
            other => panic!("expected firing, got {other:?}"),
        }
    }

    #[test]
    fn monday_window_example() {
        let mut weekdays = Weekdays::default();
        weekdays.set(
            0,
            vec![
                TimeRange::new(hms("00:00:00"), hms("08:00:00")).expect("range"),
                TimeRange::new(hms("10:00:00"), hms("23:59:59")).expect("range"),
            ],
        );
        // 2024-01-01 is a Monday.
        let policy = EmptyWeekday::Inactive;
        assert!(!weekdays.allows(at("2024-01-01", "09:00:00"), policy));
        assert!(weekdays.allows(at("2024-01-01", "07:59:59"), policy));
        assert!(weekdays.allows(at("2024-01-01", "10:00:01"), policy));
        assert!(weekdays.allows(at("2024-01-01", "08:00:00"), policy));
        assert!(weekdays.allows(at("2024-01-01", "10:00:00"), policy));
        assert!(!weekdays.allows(at("2024-01-02", "07:00:00"), policy));
    }

    #[test]
    fn no_intervals_means_always_active() {
        let mut weekdays = Weekdays::default();
        assert!(weekdays.allows(at("2024-01-03", "03:00:00"), EmptyWeekday::Inactive));
        weekdays.set(2, Vec::new());
        assert!(weekdays.allows(at("2024-01-03", "03:00:00"), EmptyWeekday::Inactive));
    }

    #[test]
    fn empty_weekday_follows_policy_when_siblings_have_intervals() {
        let mut weekdays = Weekdays::default();
        weekdays.set(
            0,
            vec![TimeRange::new(hms("08:00:00"), hms("09:00:00")).expect("range")],
        );
        weekdays.set(1, Vec::new());
        let tuesday = at("2024-01-02", "12:00:00");
        assert!(!weekdays.allows(tuesday, EmptyWeekday::Inactive));
        assert!(weekdays.allows(tuesday, EmptyWeekday::Active));
        // Unlisted weekdays never run.
        let wednesday = at("2024-01-03", "12:00:00");
        assert!(!weekdays.allows(wednesday, EmptyWeekday::Active));
    }

    #[test]
    fn fires_only_inside_date_range() {
        let mut s = scheduler(
            json!([{
                "startDate": "2024-01-10",
                "endDate": "2024-01-12",
                "observations": ["getValues"]
            }]),
            EmptyWeekday::Inactive,
        );
        assert!(matches!(s.step(at("2024-01-09", "23:59:59")), Step::Wait(_)));
        assert_eq!(s.state(), SchedulerState::WaitingForWindow);
        let obs = fired(s.step(at("2024-01-10", "00:00:00")));
        assert_eq!(obs.receivers, vec!["com1", "preProcessor"]);
        assert_eq!(obs.port_name, "com1");
        assert_eq!(obs.sensor_name, "weather");
        assert_eq!(obs.node_id, "node-1");
        assert_eq!(s.state(), SchedulerState::Firing);
        fired(s.step(at("2024-01-12", "23:59:59")));
        assert!(matches!(s.step(at("2024-01-13", "00:00:00")), Step::Finished));
        assert_eq!(s.schedule_count(), 0);
    }

    #[test]
    fn observations_fire_cyclically_and_skip_disabled() {
        let mut s = scheduler(
            json!([{
                "startDate": "2024-01-01",
                "endDate": "2024-12-31",
                "observations": ["getValues", "off", "getStatus"]
            }]),
            EmptyWeekday::Inactive,
        );
        let now = at("2024-05-05", "12:00:00");
        let names: Vec<String> = (0..5).map(|_| fired(s.step(now)).name).collect();
        assert_eq!(
            names,
            vec!["getValues", "getStatus", "getValues", "getStatus", "getValues"]
        );
    }

    #[test]
    fn onetime_observation_fires_once() {
        let mut s = scheduler(
            json!([{
                "startDate": "2024-01-01",
                "endDate": "2024-12-31",
                "observations": ["init", "getValues"]
            }]),
            EmptyWeekday::Inactive,
        );
        let now = at("2024-05-05", "12:00:00");
        let names: Vec<String> = (0..4).map(|_| fired(s.step(now)).name).collect();
        assert_eq!(names.iter().filter(|n| *n == "init").count(), 1);
        assert_eq!(names[0], "init");
    }

    #[test]
    fn schedule_of_only_onetime_observations_finishes() {
        let mut s = scheduler(
            json!([{
                "startDate": "2024-01-01",
                "endDate": "2024-12-31",
                "observations": ["init"]
            }]),
            EmptyWeekday::Inactive,
        );
        let now = at("2024-05-05", "12:00:00");
        fired(s.step(now));
        assert!(matches!(s.step(now), Step::Finished));
    }

    #[test]
    fn disabled_schedules_leave_nothing_to_run() {
        let mut s = scheduler(
            json!([
                {"enabled": false, "startDate": "2024-01-01", "endDate": "2024-12-31",
                 "observations": ["getValues"]},
                {"enabled": false, "startDate": "2024-01-01", "endDate": "2024-12-31",
                 "observations": ["getStatus"]}
            ]),
            EmptyWeekday::Inactive,
        );
        assert!(matches!(s.step(at("2024-05-05", "12:00:00")), Step::Finished));
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.schedule_count(), 0);
    }

    #[test]
    fn instances_get_fresh_ids() {
        let mut s = scheduler(
            json!([{
                "startDate": "2024-01-01",
                "endDate": "2024-12-31",
                "observations": ["getValues"]
            }]),
            EmptyWeekday::Inactive,
        );
        let now = at("2024-05-05", "12:00:00");
        let first = fired(s.step(now));
        let second = fired(s.step(now));
        assert_ne!(first.id, second.id);
        assert_eq!(first.next_receiver, 0);
    }

    #[test]
    fn invalid_schedules_are_rejected_individually() {
        let s = scheduler(
            json!([
                {"startDate": "2024-02-01", "endDate": "2024-01-01", "observations": ["getValues"]},
                {"startDate": "2024-01-01", "endDate": "2024-12-31", "observations": ["missing"]},
                {"startDate": "2024-01-01", "endDate": "2024-12-31",
                 "weekdays": {"funday": []}, "observations": ["getValues"]},
                {"startDate": "2024-01-01", "endDate": "2024-12-31", "observations": ["getValues"]}
            ]),
            EmptyWeekday::Inactive,
        );
        assert_eq!(s.schedule_count(), 1);
    }

    #[test]
    fn unknown_sensor_rejects_scheduler() {
        let result = Scheduler::from_config(
            "s",
            json!({"port": "com1", "sensor": "ghost", "schedules": []}),
            &catalog(),
            "node-1",
            "p1",
            EmptyWeekday::Inactive,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ConfigError::UnknownSensor(_))));
    }

    async fn recv_obs(sub: &mut Subscription) -> Observation {
        let env = sub.recv().await.expect("envelope");
        match env.message {
            Message::Observation(obs) => *obs,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_publishes_to_port_and_sleeps() {
        let bus = Intercom::new();
        let mut port = bus.subscribe("com1", &[]);
        let s = scheduler(
            json!([{
                "startDate": "2024-01-01",
                "endDate": "2024-12-31",
                "observations": ["getValues"]
            }]),
            EmptyWeekday::Inactive,
        );
        let clock = Arc::new(FixedClock::new(at("2024-05-05", "12:00:00")));
        let cancel = CancellationToken::new();
        let handle = s.start(bus.clone(), clock.clone(), cancel.clone());

        let first = recv_obs(&mut port).await;
        assert_eq!(first.name, "getValues");
        let started = tokio::time::Instant::now();
        let second = recv_obs(&mut port).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_ne!(first.id, second.id);

        cancel.cancel();
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_when_schedules_expire() {
        let bus = Intercom::new();
        let _port = bus.subscribe("com1", &[]);
        let s = scheduler(
            json!([{
                "startDate": "2024-01-01",
                "endDate": "2024-01-31",
                "observations": ["getValues"]
            }]),
            EmptyWeekday::Inactive,
        );
        let clock = Arc::new(FixedClock::new(at("2024-02-01", "00:00:00")));
        let handle = s.start(bus, clock, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("finished")
            .expect("join");
    }
}
