mod common;

use std::time::Duration;

use coapt::scenarios::{NodeSpec, ObserveLifecycle, Trigger};
use coapt::{run_scenario, HarnessError, ProtocolProfile};

use common::Bench;

fn lifecycle(bench: &Bench, observer_env: &[(&str, &str)]) -> ObserveLifecycle {
    let profile = ProtocolProfile::plain();
    let hosts = bench.hosts(&profile);
    let trigger_host = hosts
        .device_node(&bench.node(NodeSpec::gcoap_example()))
        .expect("fake node should boot");

    let mut spec = bench
        .peer("observer", "fake_observer.sh", "-r [fd00:bbbb::2]")
        .with_credentials();
    for (key, value) in observer_env {
        spec = spec.env(*key, *value);
    }
    let observer = hosts.peer_server(&spec).expect("observer should start");

    ObserveLifecycle::new(
        observer,
        trigger_host,
        Trigger::new("coap get -c fd00:bbbb::1 5685 /time", "Success"),
    )
    .quiet_window(Duration::from_millis(400))
}

#[test]
fn test_observe_register_notify_cancel() {
    let bench = Bench::new();
    let mut scenario = lifecycle(&bench, &[]);

    let report = run_scenario(&mut scenario).expect("observe lifecycle should pass");
    assert_eq!(report.terminal_state, "CANCELLED");
    assert_eq!(report.count("NOTIFY"), 1);
    assert_eq!(report.note("notifications"), Some("1"));
    assert!(report.step("SILENT").is_some_and(|s| s.passed));
}

#[test]
fn test_observe_several_notifications() {
    let bench = Bench::new();
    let mut scenario =
        lifecycle(&bench, &[("OBSERVER_NOTIFICATIONS", "3")]).notifications(3);

    let report = run_scenario(&mut scenario).expect("three notifications expected");
    assert_eq!(report.count("NOTIFY"), 3);
    assert_eq!(report.note("notifications"), Some("3"));
}

#[test]
fn test_observe_duplicate_notification_fails() {
    let bench = Bench::new();
    let mut scenario = lifecycle(&bench, &[("OBSERVER_DUPLICATE", "1")]);

    let err = run_scenario(&mut scenario).unwrap_err();
    assert!(
        matches!(err, HarnessError::AssertionFailed { ref message, .. } if message.starts_with("[NOTIFY]")),
        "unexpected error: {err}"
    );
}

#[test]
fn test_observe_notification_after_cancel_fails() {
    let bench = Bench::new();
    let mut scenario = lifecycle(&bench, &[("OBSERVER_IGNORE_CANCEL", "1")]);

    let err = run_scenario(&mut scenario).unwrap_err();
    assert!(
        matches!(err, HarnessError::AssertionFailed { ref message, .. } if message.starts_with("[SILENT]")),
        "unexpected error: {err}"
    );
}

#[test]
fn test_observe_skip_check_after_cancel() {
    let bench = Bench::new();
    let mut scenario =
        lifecycle(&bench, &[("OBSERVER_IGNORE_CANCEL", "1")]).skip_check_after_cancel();

    let report = run_scenario(&mut scenario).expect("post-cancel check skipped");
    assert!(report.step("SILENT").is_none());
}
