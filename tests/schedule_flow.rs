// End-to-end weekly scheduling: add an alarm, watch it arm, fire it.
use chrono::{DateTime, Datelike, Local, TimeZone, Weekday};
use reveil::clock::VirtualClock;
use reveil::context::{AppContext, TestContext};
use reveil::coordinator::Coordinator;
use reveil::events::{EngineEvent, EventKind};
use reveil::model::{Alarm, AlarmState, DayOfWeek};
use reveil::runner::LogRunner;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

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

fn drain(rx: &mut UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn weekday_alarm_arms_for_the_same_morning() {
    let (coordinator, clock, _ctx) = engine(monday(6, 0)).await;
    let mut events = coordinator.subscribe_events();

    let id = coordinator
        .add_alarm(Alarm::new("morning", "Morning", "07:00"))
        .await
        .expect("add");

    let (_, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    let next = runtime.next_trigger_at.expect("scheduled");
    assert_eq!(next, monday(7, 0));
    assert_eq!(next.weekday(), Weekday::Mon);

    clock.advance(chrono::Duration::minutes(61)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Ringing));

    let received = drain(&mut events);
    let names: Vec<&str> = received.iter().map(|e| e.kind.name()).collect();
    assert!(names.contains(&"pre_alarm"));
    assert!(names.contains(&"triggered"));
}

#[tokio::test]
async fn next_trigger_is_always_future_and_on_a_configured_day() {
    let (coordinator, _clock, _ctx) = engine(monday(12, 0)).await;

    let mut alarm = Alarm::new("late", "Late", "07:00");
    alarm.days = vec![DayOfWeek::Tuesday, DayOfWeek::Saturday];
    let id = coordinator.add_alarm(alarm).await.expect("add");

    let (data, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    let next = runtime.next_trigger_at.expect("scheduled");
    assert!(next > monday(12, 0));
    assert!(
        data.days
            .iter()
            .any(|d| d.to_chrono() == next.weekday())
    );
    // Monday noon, alarm Tue+Sat: Tuesday morning is the nearest candidate.
    assert_eq!(next, monday(7, 0) + chrono::Duration::days(1));
}

#[tokio::test]
async fn dismissed_alarm_rearms_for_the_next_occurrence() {
    let (coordinator, clock, _ctx) = engine(monday(6, 59)).await;

    let mut alarm = Alarm::new("daily", "Daily", "07:00");
    alarm.pre_alarm_duration_min = 0;
    let id = coordinator.add_alarm(alarm).await.expect("add");

    clock.advance(chrono::Duration::minutes(2)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Ringing));

    coordinator.dismiss(&id).await.expect("dismiss");
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Armed));

    let (_, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert_eq!(
        runtime.next_trigger_at.expect("rescheduled"),
        monday(7, 0) + chrono::Duration::days(1)
    );
}

#[tokio::test]
async fn disabled_alarm_is_not_scheduled() {
    let (coordinator, clock, _ctx) = engine(monday(6, 0)).await;

    let mut alarm = Alarm::new("off", "Off", "07:00");
    alarm.enabled = false;
    let id = coordinator.add_alarm(alarm).await.expect("add");

    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Disabled));
    let (_, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert!(runtime.next_trigger_at.is_none());

    clock.advance(chrono::Duration::days(2)).await;
    assert_eq!(coordinator.state_of(&id).await, Some(AlarmState::Disabled));
}

#[tokio::test]
async fn set_time_reschedules_and_reports_the_old_time() {
    let (coordinator, _clock, _ctx) = engine(monday(6, 0)).await;
    let id = coordinator
        .add_alarm(Alarm::new("m", "Morning", "07:00"))
        .await
        .expect("add");
    let mut events = coordinator.subscribe_events();

    coordinator.set_time(&id, "08:30").await.expect("set_time");

    let (data, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert_eq!(data.time, "08:30");
    assert_eq!(runtime.next_trigger_at.unwrap(), monday(8, 30));

    let changed = drain(&mut events)
        .into_iter()
        .find(|e| e.kind.name() == "time_changed")
        .expect("time_changed event");
    match changed.kind {
        EventKind::TimeChanged { old_time } => assert_eq!(old_time, "07:00"),
        other => panic!("unexpected kind {:?}", other),
    }

    assert!(matches!(
        coordinator.set_time(&id, "25:00").await,
        Err(reveil::EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn set_days_validates_and_reschedules() {
    let (coordinator, _clock, _ctx) = engine(monday(6, 0)).await;
    let id = coordinator
        .add_alarm(Alarm::new("m", "Morning", "07:00"))
        .await
        .expect("add");

    assert!(matches!(
        coordinator.set_days(&id, vec![]).await,
        Err(reveil::EngineError::Validation(_))
    ));
    assert!(matches!(
        coordinator
            .set_days(&id, vec![DayOfWeek::Monday, DayOfWeek::Monday])
            .await,
        Err(reveil::EngineError::Validation(_))
    ));

    coordinator
        .set_days(&id, vec![DayOfWeek::Wednesday])
        .await
        .expect("set_days");
    let (_, runtime) = coordinator.alarm_snapshot(&id).await.unwrap();
    assert_eq!(
        runtime.next_trigger_at.unwrap(),
        monday(7, 0) + chrono::Duration::days(2)
    );
}
