use std::fs;
use std::path::Path;

use chrono::{NaiveDate, NaiveTime, Weekday};
use httpmock::prelude::*;
use lottrack_adapters::{AdapterContext, DrawSource, HtmlLabelSource, HtmlJackpotSource, JackpotSource};
use lottrack_core::{Draw, FailureKind, LotteryDomain};
use lottrack_storage::{HttpClientConfig, HttpFetcher};
use uuid::Uuid;

fn fixture(name: &str) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    fs::read_to_string(root.join("fixtures").join(name)).expect("read fixture")
}

fn lotto_america() -> LotteryDomain {
    LotteryDomain::new(
        "LA",
        "Lotto America",
        52,
        10,
        [Weekday::Mon, Weekday::Wed, Weekday::Sat],
        NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
    )
}

fn ctx() -> AdapterContext {
    let now = NaiveDate::from_ymd_opt(2026, 1, 20)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    AdapterContext::new(Uuid::new_v4(), now)
}

fn iowa(url: String) -> HtmlLabelSource {
    HtmlLabelSource {
        id: "iowa".into(),
        url,
        priority: 3,
        main_labels: (1..=5).map(|i| format!("lblLAN{i}")).collect(),
        bonus_label: "lblLAPower".into(),
    }
}

#[tokio::test]
async fn fetch_returns_validated_candidate() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/games/lotto-america");
            then.status(200)
                .header("content-type", "text/html")
                .body(fixture("iowa_lotto_america.html"));
        })
        .await;

    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let result = iowa(server.url("/games/lotto-america"))
        .fetch(&http, &ctx(), &lotto_america())
        .await;

    assert_eq!(result.source_id, "iowa");
    assert_eq!(result.priority, 3);
    assert_eq!(
        result.candidate(),
        Some(&Draw::new(NaiveDate::from_ymd_opt(2026, 1, 19).unwrap(), [3, 9, 20, 33, 48], 7))
    );
}

#[tokio::test]
async fn draw_on_a_non_draw_day_is_a_validation_failure() {
    let server = MockServer::start_async().await;
    let sunday_page = fixture("iowa_lotto_america.html").replace("1/19/2026", "1/18/2026");
    server
        .mock_async(|when, then| {
            when.method(GET).path("/games/lotto-america");
            then.status(200).body(sunday_page);
        })
        .await;

    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let result = iowa(server.url("/games/lotto-america"))
        .fetch(&http, &ctx(), &lotto_america())
        .await;

    let failure = result.outcome.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Validation);
    assert!(failure.message.contains("Sun"));
}

#[tokio::test]
async fn server_error_is_a_network_failure_after_one_request() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/games/lotto-america");
            then.status(500);
        })
        .await;

    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let result = iowa(server.url("/games/lotto-america"))
        .fetch(&http, &ctx(), &lotto_america())
        .await;

    assert_eq!(result.outcome.unwrap_err().kind, FailureKind::Network);
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn jackpot_page_is_fetched_and_quoted() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/powerball");
            then.status(200).body(fixture("texas_powerball.html"));
        })
        .await;

    let source = HtmlJackpotSource {
        id: "texas".into(),
        url: server.url("/powerball"),
        priority: 1,
        cash_ratio: 0.45,
        amount_after: Some("jackpot".into()),
    };
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let quote = source.fetch(&http, &ctx()).await.outcome.unwrap();

    assert_eq!(quote.amount, "$165M");
    assert_eq!(quote.cash_value, 74_300_000);
}
