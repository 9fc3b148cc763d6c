//! End-to-end runs of manifest-declared subprocess plugins

use std::sync::Arc;
use std::time::{Duration, Instant};

use convoy::{BufferingEventSink, Orchestrator, PluginManifest, PluginStatus, StreamEvent};

const MANIFEST: &str = r#"
config:
  mutex_timeout_secs: 30
  max_captured_lines: 2
plugins:
  - name: apt
    mutexes:
      execute: ["pkgmgr:dpkg"]
    commands:
      check: [sh, -c, "echo 'Reading package lists'"]
      execute:
        - sh
        - -c
        - |
          echo 'Unpacking libc6'
          echo '::progress::{"percent": 50, "message": "unpacking"}' >&2
          echo 'Setting up libc6'
          echo '::progress::{not json' >&2
  - name: flatpak
    dependencies: [apt]
    mutexes:
      download: [network]
    commands:
      download: [sh, -c, "echo fetched"]
  - name: broken
    commands:
      execute: [sh, -c, "echo 'E: lock held' >&2; exit 3"]
  - name: after_broken
    dependencies: [broken]
    commands:
      execute: [sh, -c, "echo never"]
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manifest_run_end_to_end() {
    let manifest = PluginManifest::from_yaml_str(MANIFEST).unwrap();
    let sink = Arc::new(BufferingEventSink::new());
    let orchestrator = Orchestrator::new(manifest.config.clone(), sink.clone());

    let summary = orchestrator
        .run_plugins(manifest.plugins().unwrap())
        .await
        .unwrap();

    assert_eq!(summary.status_of("apt"), Some(PluginStatus::Succeeded));
    assert_eq!(summary.status_of("flatpak"), Some(PluginStatus::Succeeded));
    assert_eq!(summary.status_of("broken"), Some(PluginStatus::Failed));
    assert_eq!(summary.status_of("after_broken"), Some(PluginStatus::Skipped));
    assert!(!summary.success);

    // One check line, two execute lines and the malformed marker; only two kept
    let apt = summary.result("apt").unwrap();
    assert_eq!(apt.output_lines, 4);
    assert_eq!(apt.output.lines().count(), 2);
    assert_eq!(apt.output.lines().next(), Some("Reading package lists"));

    let apt_events = sink.events_for("apt");
    assert!(apt_events.iter().any(|e| matches!(
        e,
        StreamEvent::Progress { percent: Some(p), message: Some(m), .. } if *p == 50.0 && m == "unpacking"
    )));
    assert!(apt_events.iter().any(|e| matches!(
        e,
        StreamEvent::Output { line, .. } if line == "::progress::{not json"
    )));

    let broken = summary.result("broken").unwrap();
    let message = broken.error_message.as_deref().unwrap();
    assert!(message.starts_with("Plugin broken failed during execute"));
    assert!(message.contains("3"));
    assert_eq!(broken.output, "E: lock held");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_timeout_kills_process() {
    let manifest = PluginManifest::from_yaml_str(
        r#"
plugins:
  - name: stuck
    timeout_secs: 1
    mutexes:
      execute: [network]
    commands:
      execute: [sh, -c, "echo started; sleep 30"]
"#,
    )
    .unwrap();
    let orchestrator = Orchestrator::new(manifest.config.clone(), Arc::new(BufferingEventSink::new()));

    let start = Instant::now();
    let summary = orchestrator
        .run_plugins(manifest.plugins().unwrap())
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    let stuck = summary.result("stuck").unwrap();
    assert_eq!(stuck.status, PluginStatus::Failed);
    assert_eq!(
        stuck.error_message.as_deref(),
        Some("Plugin stuck timed out after 1s")
    );
    assert_eq!(stuck.output, "started");
}

#[tokio::test]
async fn test_missing_program_fails_plugin_not_run() {
    let manifest = PluginManifest::from_yaml_str(
        r#"
plugins:
  - name: ghost
    commands:
      check: [/nonexistent/convoy-ghost]
  - name: healthy
    commands:
      check: [sh, -c, "echo ok"]
"#,
    )
    .unwrap();
    let orchestrator = Orchestrator::new(manifest.config.clone(), Arc::new(BufferingEventSink::new()));
    let summary = orchestrator
        .run_plugins(manifest.plugins().unwrap())
        .await
        .unwrap();

    assert_eq!(summary.status_of("ghost"), Some(PluginStatus::Failed));
    assert!(summary
        .result("ghost")
        .unwrap()
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("IO operation failed"));
    assert_eq!(summary.status_of("healthy"), Some(PluginStatus::Succeeded));
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map_or(false, |rest| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_kills_forked_children() {
    let manifest = PluginManifest::from_yaml_str(
        r#"
plugins:
  - name: forking
    timeout_secs: 1
    commands:
      execute: [sh, -c, "sleep 31337 & echo $!; wait"]
"#,
    )
    .unwrap();
    let orchestrator = Orchestrator::new(manifest.config.clone(), Arc::new(BufferingEventSink::new()));

    let start = Instant::now();
    let summary = orchestrator
        .run_plugins(manifest.plugins().unwrap())
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    let forking = summary.result("forking").unwrap();
    assert_eq!(forking.status, PluginStatus::Failed);
    let pid: u32 = forking.output.trim().parse().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!process_alive(pid));
}
