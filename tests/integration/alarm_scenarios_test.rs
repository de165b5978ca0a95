use bedside::core::alarm::{
    AlarmEngine, AlarmPriority, AlarmState, AlarmThreshold, ChangeKind, ThresholdSet, ThresholdTable,
};
use bedside::core::cache::{VitalSample, VitalType};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 14, 8, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

fn sample(vital: VitalType, value: f32, when: DateTime<Utc>) -> VitalSample {
    let mut sample = VitalSample {
        timestamp: when,
        patient: None,
        heart_rate: None,
        spo2: None,
        respiration_rate: None,
        sequence: 0,
    };
    match vital {
        VitalType::HeartRate => sample.heart_rate = Some(value),
        VitalType::SpO2 => sample.spo2 = Some(value),
        VitalType::RespirationRate => sample.respiration_rate = Some(value),
    }
    sample
}

fn engine_with(thresholds: Vec<AlarmThreshold>) -> AlarmEngine {
    AlarmEngine::with_defaults(Arc::new(ThresholdTable::new(ThresholdSet::new(thresholds))))
}

fn kinds(changes: &[bedside::core::alarm::AlarmChange]) -> Vec<ChangeKind> {
    changes.iter().map(|c| c.kind).collect()
}

#[test]
fn test_tachycardia_triggers_once_and_resolves_with_hysteresis() {
    let mut engine = engine_with(vec![AlarmThreshold::new(
        VitalType::HeartRate,
        50.0,
        120.0,
        0.05,
        AlarmPriority::High,
    )]);

    assert!(engine.evaluate(&sample(VitalType::HeartRate, 80.0, at(0))).is_empty());

    let changes = engine.evaluate(&sample(VitalType::HeartRate, 130.0, at(1)));
    assert_eq!(kinds(&changes), vec![ChangeKind::Triggered]);
    let id = changes[0].alarm.id;
    assert_eq!(changes[0].alarm.triggering_value, 130.0);
    assert!(engine.critical_active());

    // 118 is back under the limit but not under 120 * 0.95 = 114.
    assert!(engine.evaluate(&sample(VitalType::HeartRate, 118.0, at(2))).is_empty());
    assert!(engine.evaluate(&sample(VitalType::HeartRate, 125.0, at(3))).is_empty());
    assert_eq!(engine.active().len(), 1);

    let changes = engine.evaluate(&sample(VitalType::HeartRate, 110.0, at(4)));
    assert_eq!(kinds(&changes), vec![ChangeKind::Resolved]);
    assert_eq!(changes[0].alarm.id, id);
    assert!(engine.active().is_empty());
    assert!(!engine.critical_active());
    assert_eq!(engine.find(id).map(|a| a.state), Some(AlarmState::Resolved));
}

#[test]
fn test_values_hovering_at_the_limit_do_not_flutter() {
    let mut engine = engine_with(vec![AlarmThreshold::new(
        VitalType::SpO2,
        90.0,
        100.0,
        0.02,
        AlarmPriority::High,
    )]);

    let mut triggered = 0;
    let mut resolved = 0;
    for (i, value) in [89.0, 90.5, 89.5, 91.0, 89.8, 90.9, 89.9].iter().enumerate() {
        for change in engine.evaluate(&sample(VitalType::SpO2, *value, at(i as i64))) {
            match change.kind {
                ChangeKind::Triggered => triggered += 1,
                ChangeKind::Resolved => resolved += 1,
                _ => {}
            }
        }
    }
    assert_eq!(triggered, 1);
    assert_eq!(resolved, 0);

    // 90 * 1.02 = 91.8 clears it.
    let changes = engine.evaluate(&sample(VitalType::SpO2, 92.0, at(10)));
    assert_eq!(kinds(&changes), vec![ChangeKind::Resolved]);
}

#[test]
fn test_low_priority_silence_is_clamped_and_expires() {
    let mut engine = engine_with(vec![AlarmThreshold::new(
        VitalType::RespirationRate,
        8.0,
        30.0,
        0.05,
        AlarmPriority::Low,
    )]);
    let id = engine.evaluate(&sample(VitalType::RespirationRate, 35.0, at(0)))[0]
        .alarm
        .id;

    let change = engine
        .silence(id, Duration::seconds(1000), "nurse", Some("repositioning".to_string()), at(5))
        .unwrap();
    let silence = change.alarm.silence.clone().unwrap();
    assert_eq!(silence.requested_secs, 1000);
    assert_eq!(silence.effective_secs, 600);
    assert_eq!(silence.expires_at, at(605));
    assert!(!change.alarm.audio_active());
    assert!(change.alarm.visual_active());

    assert!(!kinds(&engine.tick(at(604))).contains(&ChangeKind::Unsilenced));
    let changes = engine.tick(at(605));
    assert!(kinds(&changes).contains(&ChangeKind::Unsilenced));
    let alarm = engine.find(id).unwrap();
    assert!(alarm.silence.is_none());
    assert!(alarm.audio_active());
}

#[test]
fn test_high_priority_silence_never_exceeds_two_minutes() {
    let mut engine = engine_with(vec![AlarmThreshold::new(
        VitalType::HeartRate,
        50.0,
        120.0,
        0.05,
        AlarmPriority::High,
    )]);
    let id = engine.evaluate(&sample(VitalType::HeartRate, 40.0, at(0)))[0]
        .alarm
        .id;

    let change = engine
        .silence(id, Duration::seconds(99_999), "nurse", None, at(0))
        .unwrap();
    assert_eq!(change.alarm.silence.unwrap().effective_secs, 120);
}

#[test]
fn test_unacknowledged_high_alarm_escalates_to_ceiling_then_freezes_on_ack() {
    let mut engine = engine_with(vec![AlarmThreshold::new(
        VitalType::HeartRate,
        50.0,
        120.0,
        0.05,
        AlarmPriority::High,
    )]);
    let id = engine.evaluate(&sample(VitalType::HeartRate, 150.0, at(0)))[0]
        .alarm
        .id;

    let mut levels = Vec::new();
    for secs in (0..=210).step_by(30) {
        for change in engine.tick(at(secs)) {
            if change.kind == ChangeKind::Escalated {
                levels.push((secs, change.alarm.escalation_level));
            }
        }
    }
    assert_eq!(levels, vec![(60, 1), (90, 2), (120, 3)]);

    engine.acknowledge(id, "nurse", at(215)).unwrap();
    assert!(engine.tick(at(240)).is_empty());
    let alarm = engine.find(id).unwrap();
    assert_eq!(alarm.escalation_level, 3);
    assert_eq!(alarm.state, AlarmState::Acknowledged);
    assert!(alarm.visual_active());
}

#[test]
fn test_acknowledged_alarm_stops_escalating_early() {
    let mut engine = engine_with(vec![AlarmThreshold::new(
        VitalType::HeartRate,
        50.0,
        120.0,
        0.05,
        AlarmPriority::Medium,
    )]);
    let id = engine.evaluate(&sample(VitalType::HeartRate, 150.0, at(0)))[0]
        .alarm
        .id;

    engine.tick(at(0));
    assert!(engine.tick(at(90)).is_empty());
    let escalated = engine.tick(at(120));
    assert_eq!(kinds(&escalated), vec![ChangeKind::Escalated]);

    engine.acknowledge(id, "nurse", at(121)).unwrap();
    for secs in (150..=600).step_by(30) {
        assert!(engine.tick(at(secs)).is_empty());
    }
    assert_eq!(engine.find(id).unwrap().escalation_level, 1);
}

#[test]
fn test_threshold_change_resolves_open_alarm_without_reopening_history() {
    let mut engine = engine_with(vec![AlarmThreshold::new(
        VitalType::HeartRate,
        50.0,
        120.0,
        0.05,
        AlarmPriority::High,
    )]);
    engine.evaluate(&sample(VitalType::HeartRate, 130.0, at(0)));
    let first = engine.evaluate(&sample(VitalType::HeartRate, 100.0, at(1)))[0]
        .alarm
        .id;
    let second = engine.evaluate(&sample(VitalType::HeartRate, 135.0, at(2)))[0]
        .alarm
        .id;
    assert_ne!(first, second);

    let widened = ThresholdSet::new(vec![AlarmThreshold::new(
        VitalType::HeartRate,
        50.0,
        160.0,
        0.05,
        AlarmPriority::High,
    )]);
    let changes = engine.update_thresholds(None, widened, at(3)).unwrap();
    assert_eq!(kinds(&changes), vec![ChangeKind::Resolved]);
    assert_eq!(changes[0].alarm.id, second);
    assert_eq!(engine.find(first).map(|a| a.state), Some(AlarmState::Resolved));
    assert!(engine.active().is_empty());
    assert_eq!(engine.history().len(), 2);
}
