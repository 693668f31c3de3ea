use std::fs;
use std::time::Duration;

use dnsprobe_config::{ConfigSource, DomainList, ProbeConfig};
use dnsprobe_core::orchestration::{AnalysisStore, ManualClock};
use tempfile::TempDir;

#[test]
fn explicit_toml_path_wins() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("probe.toml");
    fs::write(
        &path,
        r#"
        [orchestrator.refresh]
        poll_interval_secs = 15

        [store]
        domains_path = "/var/lib/dnsprobe/domains.toml"
        "#,
    )
    .expect("write config");

    let (config, source) = ProbeConfig::load(Some(&path)).expect("config loads");
    assert_eq!(source, ConfigSource::Explicit(path.clone()));
    assert_eq!(config.orchestrator.refresh.poll_interval_secs, 15);
    assert_eq!(
        config.store.domains_path.as_deref(),
        Some(std::path::Path::new("/var/lib/dnsprobe/domains.toml"))
    );
}

#[test]
fn json_extension_is_parsed_as_json() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("probe.json");
    fs::write(&path, r#"{"engine": {"query_timeout_ms": 750}}"#).expect("write config");

    let config = ProbeConfig::load_from_file(&path).expect("config loads");
    assert_eq!(config.engine.query_timeout(), Duration::from_millis(750));
}

#[test]
fn invalid_values_fail_validation_on_load() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("probe.toml");
    fs::write(&path, "[orchestrator.dispatch]\nmax_jobs_per_worker = 0\n").expect("write config");

    let err = ProbeConfig::load(Some(&path)).expect_err("zero recycle threshold");
    assert!(format!("{err:#}").contains("max_jobs_per_worker"));
}

#[test]
fn missing_file_reports_path() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("absent.toml");
    let err = ProbeConfig::load(Some(&path)).expect_err("missing file");
    assert!(format!("{err:#}").contains("absent.toml"));
}

#[tokio::test]
async fn toml_domain_list_builds_store() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("domains.toml");
    fs::write(
        &path,
        r#"
        [[domains]]
        name = "a.example"
        refresh_interval_secs = 3600
        refresh_offset_secs = 120

        [[domains]]
        name = "b.example"
        refresh_interval_secs = 3600
        refresh_offset_secs = 160

        [[domains]]
        name = "daily.example"
        "#,
    )
    .expect("write domains");

    let list = DomainList::load_from_file(&path).expect("domain list loads");
    let store = list
        .into_manual_store(Duration::from_secs(86_400), ManualClock::new(0))
        .expect("store builds");

    let intervals = store
        .distinct_refresh_intervals()
        .await
        .expect("intervals");
    assert_eq!(intervals.len(), 2);

    let due = store
        .names_due_for_refresh(
            Duration::from_secs(3_600),
            Duration::from_secs(100),
            Duration::from_secs(160),
        )
        .await
        .expect("due names");
    assert_eq!(due.len(), 2);
}

#[test]
fn plain_text_domain_list() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("domains.txt");
    fs::write(&path, "# zones\nexample.com\nexample.org\n").expect("write domains");

    let list = DomainList::load_from_file(&path).expect("domain list loads");
    assert_eq!(
        list.names().collect::<Vec<_>>(),
        vec!["example.com", "example.org"]
    );
}
