// Pre-alarm phase: early trigger, script execution, and dismissal during
// the pre-alarm window swallowing the pending ring.
use chrono::{DateTime, Local, TimeZone};
use futures::future::BoxFuture;
use reveil::clock::VirtualClock;
use reveil::context::{AppContext, TestContext};
use reveil::coordinator::Coordinator;
use reveil::model::{Alarm, AlarmState, DayOfWeek};
use reveil::runner::{ScriptContext, ScriptRunner};
use std::sync::{Arc, Mutex};

// 2026-08-03 is a Monday.
fn monday(h: u32, m: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2026, 8, 3, h, m, 0)
        .single()
        .expect("valid instant")
}

/// Records every invoked routine name, succeeding always.
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ScriptRunner for RecordingRunner {
    fn run(&self, routine: &str, _context: &ScriptContext) -> BoxFuture<'static, anyhow::Result<()>> {
        self.calls.lock().unwrap().push(routine.to_string());
        Box::pin(async { Ok(()) })
    }
}

async fn engine(
    start: DateTime<Local>,
) -> (Arc<Coordinator>, VirtualClock, Arc<RecordingRunner>) {
    let ctx = Arc::new(TestContext::new());
    let clock = VirtualClock::new(start);
    let runner = Arc::new(RecordingRunner::default());
    let coordinator = Coordinator::new(
        ctx as Arc<dyn AppContext>,
        Arc::new(clock.clone()),
        Arc::new(clock.clone()),
        Arc::clone(&runner) as Arc<dyn ScriptRunner>,
        Default::default(),
    );
    coordinator.start().await.expect("start");
    (coordinator, clock, runner)
}

fn pre_alarm_alarm() -> Alarm {
    let mut alarm = Alarm::new("gentle", "Gentle", "07:00");
    alarm.days = vec![DayOfWeek::Monday];
    alarm.pre_alarm_duration_min = 10;
    alarm.use_device_defaults = false;
    alarm.script_pre_alarm = Some("soft_light".to_string());
    alarm.script_alarm = Some("wake_lights".to_string());
    alarm.script_on_dismiss = Some("coffee".to_string());
    alarm
}

#[tokio::test]
async fn pre_alarm_fires_before_the_main_trigger() {
    let (coordinator, clock, runner) = engine(monday(6, 40)).await;
    let id = coordinator.add_alarm(pre_alarm_alarm()).await.expect("add");

    clock.advance_to(monday(6, 52)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::PreAlarm));
    assert_eq!(runner.calls(), vec!["soft_light"]);

    clock.advance_to(monday(7, 0)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Ringing));
    assert_eq!(runner.calls(), vec!["soft_light", "wake_lights"]);
}

#[tokio::test]
async fn dismiss_during_pre_alarm_swallows_the_pending_ring() {
    let (coordinator, clock, runner) = engine(monday(6, 40)).await;
    let id = coordinator.add_alarm(pre_alarm_alarm()).await.expect("add");

    clock.advance_to(monday(6, 52)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::PreAlarm));

    coordinator.dismiss(&id).await.expect("dismiss");
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Armed));
    assert!(runner.calls().contains(&"coffee".to_string()));

    // 07:00 passes quietly; the next occurrence is a week out.
    clock.advance_to(monday(7, 30)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Armed));
    assert!(!runner.calls().contains(&"wake_lights".to_string()));

    let (_, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert_eq!(
        runtime.next_trigger_at.unwrap(),
        monday(7, 0) + chrono::Duration::days(7)
    );
}

#[tokio::test]
async fn no_pre_alarm_when_armed_inside_the_window() {
    // Armed at 06:56 with a 10-minute pre-alarm: the pre-alarm instant is
    // already past, so only the main trigger is armed.
    let (coordinator, clock, runner) = engine(monday(6, 56)).await;
    let id = coordinator.add_alarm(pre_alarm_alarm()).await.expect("add");

    clock.advance_to(monday(6, 59)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Armed));

    clock.advance_to(monday(7, 0)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Ringing));
    assert_eq!(runner.calls(), vec!["wake_lights"]);
}
