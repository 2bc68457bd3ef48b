use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use httpmock::prelude::*;
use lottrack_core::{Draw, StoredDraw};
use lottrack_storage::{DataDir, HttpClientConfig, HttpFetcher};
use lottrack_sync::{audit, backfill, AuditIssue, LotteryRegistry};
use tempfile::TempDir;

fn fixture(name: &str) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    fs::read_to_string(root.join("fixtures").join(name)).expect("read fixture")
}

fn shipped_registry() -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    fs::read_to_string(root.join("lotteries.yaml")).expect("read registry")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn backfill_merges_csv_history_into_existing_store() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/mega-millions.csv");
            then.status(200)
                .header("content-type", "text/csv")
                .body(fixture("ny_mega_millions.csv"));
        })
        .await;

    let yaml = shipped_registry().replace(
        "https://data.ny.gov/api/views/5xaw-6ayf/rows.csv?accessType=DOWNLOAD",
        &server.url("/mega-millions.csv"),
    );
    let registry = LotteryRegistry::from_yaml_str(&yaml).unwrap();
    let mm = registry.get("MM").unwrap();
    assert_eq!(mm.sources[0].as_csv().unwrap().url, server.url("/mega-millions.csv"));

    let dir = TempDir::new().unwrap();
    let data = DataDir::new(dir.path());
    data.draw_store(&mm.domain)
        .await
        .insert_all_if_new([StoredDraw::from(Draw::new(date(2026, 1, 13), [11, 22, 36, 50, 68], 4))])
        .await
        .unwrap();

    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let report = backfill(&http, &data, mm).await.unwrap();
    mock.assert_hits_async(1).await;

    assert_eq!(report.key, "MM");
    assert_eq!(report.source, "ny_open_data");
    assert_eq!(report.rows, 3);
    assert_eq!(report.summary.inserted, 2);
    assert_eq!(report.summary.already_present, 1);
    assert_eq!(report.summary.invalid, 0);

    let history = data.draw_store(&mm.domain).await.load().await.unwrap();
    let dates: Vec<_> = history.draws.iter().map(|d| d.draw.date).collect();
    assert_eq!(dates, vec![date(2026, 1, 16), date(2026, 1, 13), date(2026, 1, 9)]);
    assert_eq!(history.draws[0].draw.bonus, 19);

    let reports = audit(&data, &registry).await.unwrap();
    let mm_report = reports.iter().find(|r| r.key == "MM").unwrap();
    assert!(mm_report.is_clean());
    assert_eq!(mm_report.draws, 3);
    assert_eq!(mm_report.latest, Some(date(2026, 1, 16)));
    assert!(reports.iter().filter(|r| r.key != "MM").all(|r| r.draws == 0));
}

#[tokio::test]
async fn backfill_without_csv_source_is_an_error() {
    let registry = LotteryRegistry::builtin().unwrap();
    let la = registry.get("LA").unwrap();
    let dir = TempDir::new().unwrap();
    let data = DataDir::new(dir.path());
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

    let err = backfill(&http, &data, la).await.unwrap_err();
    assert!(err.to_string().contains("no csv history source"));
}

#[tokio::test]
async fn audit_flags_hand_edited_store_without_rewriting_it() {
    let registry = LotteryRegistry::builtin().unwrap();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("la.json");
    let raw = r#"{
  "name": "Lotto America",
  "abbreviation": "LA",
  "draws": [
    {"date": "2026-01-18", "main": [1, 2, 3, 4, 5], "bonus": 1},
    {"date": "2026-01-19", "main": [6, 7, 8, 9, 60], "bonus": 2}
  ],
  "lastUpdated": null
}"#;
    fs::write(&path, raw).unwrap();

    let data = DataDir::new(dir.path());
    let reports = audit(&data, &registry).await.unwrap();
    let la = reports.iter().find(|r| r.key == "LA").unwrap();

    assert!(!la.is_clean());
    assert!(matches!(la.issues[0], AuditIssue::Invalid { date: d, .. } if d == date(2026, 1, 18)));
    assert!(la
        .issues
        .iter()
        .any(|issue| matches!(issue, AuditIssue::OutOfOrder { .. })));
    assert!(la
        .issues
        .iter()
        .any(|issue| issue.to_string().contains("outside 1..=52")));
    assert_eq!(fs::read_to_string(&path).unwrap(), raw);
}
