use super::*;
use chrono::TimeZone;

#[test]
fn test_control_action_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&ControlAction::Wake).unwrap(), "\"wake\"");
    assert_eq!(serde_json::to_string(&ControlAction::Sleep).unwrap(), "\"sleep\"");
}

#[test]
fn test_control_request_round_trip() {
    let json = r#"{"host":"app.example.com","action":"sleep"}"#;
    let req: ControlRequest = serde_json::from_str(json).unwrap();
    assert_eq!(req.host, "app.example.com");
    assert_eq!(req.action, ControlAction::Sleep);

    let back = serde_json::to_string(&req).unwrap();
    assert_eq!(back, json);
}

#[test]
fn test_status_snapshot_shape() {
    let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let mut apps = HashMap::new();
    apps.insert(
        "app.example.com".to_string(),
        AppSummary {
            state: "running".to_string(),
            state_changed_at: at,
            startup_started_at: None,
            seconds_in_state: 42,
            last_transition_reason: None,
        },
    );
    let snapshot = StatusSnapshot {
        running: true,
        app_count: 1,
        poll_interval: 10,
        apps,
    };

    let value: serde_json::Value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["running"], true);
    assert_eq!(value["app_count"], 1);
    assert_eq!(value["apps"]["app.example.com"]["state"], "running");
    // Absent optionals are omitted, not serialized as null
    assert!(value["apps"]["app.example.com"]
        .as_object()
        .unwrap()
        .get("startup_started_at")
        .is_none());
}

#[test]
fn test_health_report_ok() {
    let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let report = HealthReport::ok("0.3.1", at);
    assert_eq!(report.status, "ok");
    assert_eq!(report.service, SERVICE_NAME);
    assert_eq!(report.version, "0.3.1");
}
