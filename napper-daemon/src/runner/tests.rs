use super::testing::{container, MockRuntime};
use super::*;
use parking_lot::Mutex;

fn runner(runtime: Arc<MockRuntime>) -> Runner {
    Runner::new(runtime, 2, "kamal-proxy")
}

#[test]
fn test_container_state_parse() {
    assert_eq!(ContainerState::parse("running"), ContainerState::Running);
    assert_eq!(ContainerState::parse("Exited"), ContainerState::Exited);
    assert_eq!(ContainerState::parse("created"), ContainerState::Created);
    assert_eq!(ContainerState::parse("restarting"), ContainerState::Other);
}

#[test]
fn test_parse_labels() {
    let labels = parse_labels("service=web,role=app,x=y=z");
    assert_eq!(labels.get("service").unwrap(), "web");
    assert_eq!(labels.get("role").unwrap(), "app");
    assert_eq!(labels.get("x").unwrap(), "y=z");
    assert!(parse_labels("").is_empty());
}

#[tokio::test]
async fn test_retry_succeeds_first_attempt_without_sleeping() {
    let runtime = MockRuntime::with_containers(Vec::new());
    let calls = Mutex::new(0u32);

    let result = runner(runtime)
        .execute_with_retry("noop", || {
            *calls.lock() += 1;
            async { Ok(42) }
        })
        .await
        .unwrap();

    assert_eq!(result, 42);
    assert_eq!(*calls.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failure() {
    let runtime = MockRuntime::with_containers(Vec::new());
    let calls = Mutex::new(0u32);

    let result = runner(runtime)
        .execute_with_retry("flaky", || {
            let attempt = {
                let mut calls = calls.lock();
                *calls += 1;
                *calls
            };
            async move {
                if attempt < 3 {
                    Err(NapperError::Command {
                        operation: "flaky".to_string(),
                        attempts: 1,
                        message: "transient".to_string(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, "done");
    assert_eq!(*calls.lock(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_raises_command_error() {
    let runtime = MockRuntime::with_containers(Vec::new());
    let calls = Mutex::new(0u32);

    let err = runner(runtime)
        .execute_with_retry("doomed", || {
            *calls.lock() += 1;
            async {
                Err::<(), _>(NapperError::Command {
                    operation: "doomed".to_string(),
                    attempts: 1,
                    message: "broken".to_string(),
                })
            }
        })
        .await
        .unwrap_err();

    // max_retries = 2 means three numbered attempts
    assert_eq!(*calls.lock(), 3);
    match err {
        NapperError::Command { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_start_app_container_starts_exited_candidate() {
    let runtime = MockRuntime::with_containers(vec![
        container("web-1", "web", ContainerState::Running, None),
        container("app-1", "app", ContainerState::Exited, None),
    ]);

    let started = runner(runtime.clone())
        .start_app_container("app.example.com")
        .await
        .unwrap();

    assert!(started);
    assert_eq!(runtime.calls(), vec!["start app-1"]);
}

#[tokio::test]
async fn test_start_app_container_without_candidate_returns_false() {
    let runtime = MockRuntime::with_containers(vec![container(
        "app-1",
        "app",
        ContainerState::Running,
        None,
    )]);

    let started = runner(runtime.clone())
        .start_app_container("app.example.com")
        .await
        .unwrap();

    assert!(!started);
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_stop_app_container_stops_running_candidate() {
    let runtime = MockRuntime::with_containers(vec![
        container("app-1", "app", ContainerState::Exited, None),
        container("app-2", "app", ContainerState::Running, None),
    ]);

    let stopped = runner(runtime.clone())
        .stop_app_container("app.example.com")
        .await
        .unwrap();

    assert!(stopped);
    assert_eq!(runtime.calls(), vec!["stop app-2"]);
}

#[tokio::test]
async fn test_force_stop_kills_running_container() {
    let runtime = MockRuntime::with_containers(vec![container(
        "app-1",
        "app",
        ContainerState::Running,
        None,
    )]);

    assert!(
        runner(runtime.clone())
            .force_stop_app_container("app.example.com")
            .await
    );
    assert_eq!(runtime.calls(), vec!["kill app-1"]);
}

#[tokio::test]
async fn test_force_stop_tolerates_runtime_failure() {
    let runtime = MockRuntime::with_containers(Vec::new());
    *runtime.fail_listing.lock() = true;

    assert!(
        !runner(runtime)
            .force_stop_app_container("app.example.com")
            .await
    );
}

#[tokio::test]
async fn test_set_maintenance_swallows_errors() {
    let runtime = MockRuntime::with_containers(Vec::new());
    let runner = runner(runtime.clone());

    runner.set_maintenance("app.example.com", true).await;
    runner.set_maintenance("app.example.com", false).await;

    assert_eq!(
        runtime.calls(),
        vec!["maintenance app on", "maintenance app off"]
    );
}

#[tokio::test]
async fn test_discover_prefers_host_rule_label() {
    let runtime = MockRuntime::with_containers(vec![container(
        "app-1",
        "app",
        ContainerState::Running,
        Some("app.example.com"),
    )]);
    runtime.set_logs("kamal-proxy", "");

    let apps = runner(runtime).discover_kamal_apps().await;
    let info = &apps["app.example.com"];
    assert_eq!(info.service, "app");
    assert_eq!(info.container_name.as_deref(), Some("app-1"));
}

#[tokio::test]
async fn test_discover_skips_proxy_role_and_falls_back_to_service_name() {
    let mut proxy = container("kamal-proxy", "proxy-svc", ContainerState::Running, None);
    proxy
        .labels
        .insert("role".to_string(), "proxy".to_string());

    let runtime = MockRuntime::with_containers(vec![
        proxy,
        container("web-1", "web.example.com", ContainerState::Running, None),
    ]);
    runtime.set_logs("kamal-proxy", "");

    let apps = runner(runtime).discover_kamal_apps().await;
    assert_eq!(apps.len(), 1);
    assert!(apps.contains_key("web.example.com"));
}

#[tokio::test]
async fn test_discover_supplements_from_proxy_logs() {
    let runtime = MockRuntime::with_containers(Vec::new());
    runtime.set_logs(
        "kamal-proxy",
        "registered service web with Host(`web.example.com`)\nplain line\n",
    );

    let apps = runner(runtime).discover_kamal_apps().await;
    let info = &apps["web.example.com"];
    assert_eq!(info.service, "web");
    assert!(info.container_name.is_none());
}

#[tokio::test]
async fn test_discover_survives_runtime_outage() {
    let runtime = MockRuntime::with_containers(Vec::new());
    *runtime.fail_listing.lock() = true;

    let apps = runner(runtime).discover_kamal_apps().await;
    assert!(apps.is_empty());
}
