mod common;

use std::time::Duration;

use coapt::scenarios::{
    NodeSpec, PeerSpec, RegistrationLifecycle, Renewal, SimpleRegistration,
};
use coapt::{run_scenario, HarnessError, ProtocolProfile, Session};

use common::{sh, Bench};

fn directory(bench: &Bench, profile: &ProtocolProfile) -> Session {
    bench
        .hosts(profile)
        .peer_server(&bench.peer("coap-rd", "fake_server.sh", "coap-rd"))
        .expect("directory should start")
}

fn cord_ep(bench: &Bench, renew_ms: u32) -> Session {
    let profile = ProtocolProfile::plain();
    bench
        .hosts(&profile)
        .device_node(
            &bench
                .node(NodeSpec::cord_ep())
                .env("NODE_BANNER", "CoRE RD client example!")
                .env("NODE_RENEW_MS", renew_ms.to_string()),
        )
        .expect("fake node should boot")
}

fn epsim(bench: &Bench, env: &[(&str, &str)]) -> Session {
    let profile = ProtocolProfile::plain();
    let mut spec = NodeSpec::cord_epsim()
        .command(sh("fake_epsim.sh", ""))
        .env("EPSIM_RENEW_MS", "200");
    for (key, value) in env {
        spec = spec.env(*key, *value);
    }
    bench
        .hosts(&profile)
        .device_node(&spec)
        .expect("fake epsim should boot")
}

#[test]
fn test_registration_full_lifecycle() {
    let bench = Bench::new();
    let profile = ProtocolProfile::plain();
    let node = cord_ep(&bench, 200);
    let rd = directory(&bench, &profile);

    let mut scenario = RegistrationLifecycle::new(node, rd, "[fd00:bbbb::1]")
        .renewals(Renewal {
            within: Duration::from_secs(1),
            count: 2,
        })
        .updates(2, Duration::from_millis(100));

    let report = run_scenario(&mut scenario).expect("registration lifecycle should pass");
    assert_eq!(report.terminal_state, "REMOVED");
    let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        ["DISCOVER", "REGISTER", "RENEW", "RENEW", "UPDATE", "UPDATE", "REMOVE"]
    );
}

#[test]
fn test_registration_without_discovery() {
    let bench = Bench::new();
    let profile = ProtocolProfile::plain();
    let mut scenario =
        RegistrationLifecycle::new(cord_ep(&bench, 200), directory(&bench, &profile), "[fd00:bbbb::1]")
            .skip_discovery();

    let report = run_scenario(&mut scenario).expect("registration should pass");
    assert!(report.step("DISCOVER").is_none());
    assert_eq!(report.count("REGISTER"), 1);
}

#[test]
fn test_registration_missing_renewal_times_out() {
    let bench = Bench::new();
    let profile = ProtocolProfile::plain();
    let mut scenario =
        RegistrationLifecycle::new(cord_ep(&bench, 5000), directory(&bench, &profile), "[fd00:bbbb::1]")
            .renewals(Renewal {
                within: Duration::from_millis(500),
                count: 1,
            });

    let err = run_scenario(&mut scenario).unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err}");
}

#[test]
fn test_simple_registration_keeps_renewing() {
    let bench = Bench::new();
    let profile = ProtocolProfile::plain();
    let mut scenario = SimpleRegistration::new(epsim(&bench, &[]), directory(&bench, &profile))
        .windows(
            Duration::from_millis(300),
            Duration::from_secs(1),
            Duration::from_millis(700),
        );

    let report = run_scenario(&mut scenario).expect("simple registration should pass");
    assert_eq!(report.terminal_state, "RENEWING");
    assert!(report.step("QUIET").is_some_and(|s| s.elapsed >= Duration::from_millis(700)));
}

#[test]
fn test_simple_registration_rejects_loopback_directory() {
    let bench = Bench::new();
    let profile = ProtocolProfile::plain();
    let mut scenario =
        SimpleRegistration::new(epsim(&bench, &[("EPSIM_RD", "[::1]")]), directory(&bench, &profile))
            .windows(
                Duration::from_millis(300),
                Duration::from_secs(1),
                Duration::from_millis(300),
            );

    let err = run_scenario(&mut scenario).unwrap_err();
    assert!(
        matches!(err, HarnessError::AssertionFailed { ref message, .. } if message.starts_with("[DIRECTORY]")),
        "unexpected error: {err}"
    );
}

#[test]
fn test_simple_registration_reports_warnings() {
    let bench = Bench::new();
    let profile = ProtocolProfile::plain();
    let mut scenario =
        SimpleRegistration::new(epsim(&bench, &[("EPSIM_FAULT", "1")]), directory(&bench, &profile))
            .windows(
                Duration::from_millis(300),
                Duration::from_secs(1),
                Duration::from_millis(700),
            );

    let err = run_scenario(&mut scenario).unwrap_err();
    match err {
        HarnessError::AssertionFailed { message, buffered } => {
            assert!(message.starts_with("[QUIET]"), "{message}");
            assert!(buffered.contains("warning"));
        }
        other => panic!("expected assertion failure, got {other}"),
    }
}

#[test]
fn test_directory_peer_resolves_from_path_without_base() {
    let bench = Bench::new();
    let profile = ProtocolProfile::plain();
    let options = bench
        .hosts(&profile)
        .peer_options(&PeerSpec::libcoap_rd())
        .expect("options should build without a libcoap base");
    assert_eq!(options.command, "coap-rd");
    assert!(options.working_dir.is_none());
}
