// One-time alarms disable themselves after their first completed firing.
use chrono::{DateTime, Local, TimeZone};
use reveil::clock::VirtualClock;
use reveil::context::{AppContext, TestContext};
use reveil::coordinator::Coordinator;
use reveil::model::{Alarm, AlarmState, DayOfWeek};
use reveil::runner::LogRunner;
use reveil::store::EngineStore;
use std::sync::Arc;
use strum::IntoEnumIterator;

// 2026-08-03 is a Monday.
fn monday(h: u32, m: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2026, 8, 3, h, m, 0)
        .single()
        .expect("valid instant")
}

async fn engine(start: DateTime<Local>) -> (Arc<Coordinator>, VirtualClock, Arc<TestContext>) {
    let ctx = Arc::new(TestContext::new());
    let clock = VirtualClock::new(start);
    let coordinator = Coordinator::new(
        Arc::clone(&ctx) as Arc<dyn AppContext>,
        Arc::new(clock.clone()),
        Arc::new(clock.clone()),
        Arc::new(LogRunner),
        Default::default(),
    );
    coordinator.start().await.expect("start");
    (coordinator, clock, ctx)
}

fn one_time_alarm() -> Alarm {
    let mut alarm = Alarm::new("once", "Once", "07:00");
    alarm.days = DayOfWeek::iter().collect();
    alarm.one_time = true;
    alarm.pre_alarm_duration_min = 0;
    alarm.auto_dismiss_timeout_min = 10;
    alarm
}

#[tokio::test]
async fn dismiss_disables_a_one_time_alarm() {
    let (coordinator, clock, ctx) = engine(monday(6, 59)).await;
    let id = coordinator.add_alarm(one_time_alarm()).await.expect("add");

    clock.advance(chrono::Duration::minutes(1)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Ringing));

    coordinator.dismiss(&id).await.expect("dismiss");
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Disabled));

    let (data, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert!(!data.enabled);
    assert!(runtime.next_trigger_at.is_none());

    // The disable is durable.
    let store = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
    assert!(!store.get_alarm(&id).unwrap().enabled);

    // No further firings, ever.
    let mut events = coordinator.subscribe_events();
    clock.advance(chrono::Duration::days(8)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Disabled));
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.kind.name(), "triggered");
    }
}

#[tokio::test]
async fn auto_dismiss_also_completes_a_one_time_alarm() {
    let (coordinator, clock, _ctx) = engine(monday(6, 59)).await;
    let id = coordinator.add_alarm(one_time_alarm()).await.expect("add");

    clock.advance(chrono::Duration::minutes(1)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Ringing));

    // Nobody dismisses; the ring times out.
    clock.advance(chrono::Duration::minutes(10)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Disabled));
    let (data, _) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert!(!data.enabled);
}

#[tokio::test]
async fn reenabling_a_completed_one_time_alarm_schedules_again() {
    let (coordinator, clock, _ctx) = engine(monday(6, 59)).await;
    let id = coordinator.add_alarm(one_time_alarm()).await.expect("add");

    clock.advance(chrono::Duration::minutes(1)).await;
    coordinator.dismiss(&id).await.expect("dismiss");
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Disabled));

    coordinator.set_enabled(&id, true).await.expect("re-enable");
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Armed));
    let (_, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert_eq!(
        runtime.next_trigger_at.unwrap(),
        monday(7, 0) + chrono::Duration::days(1)
    );
}
