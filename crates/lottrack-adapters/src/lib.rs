//! Source adapter contracts and the concrete draw/jackpot adapters.
//!
//! Every adapter is a single (game, external site) pair. Adapters never retry and
//! never panic on bad input: whatever goes wrong is folded into a [`SourceResult`]
//! failure so the verifier can carry on with the remaining sources.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use lottrack_core::{
    Draw, DrawResult, FailureKind, JackpotQuote, JackpotResult, LotteryDomain, SourceFailure,
    SourceResult, ValidationError,
};
use lottrack_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lottrack-adapters";

/// Priority given to sources that do not declare one.
pub const DEFAULT_PRIORITY: u32 = 99;

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Rss,
    Csv,
    Html,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Local wall-clock time the cycle started at.
    pub now: NaiveDateTime,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, now: NaiveDateTime) -> Self {
        Self { run_id, now }
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Parse(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl AdapterError {
    pub fn parse(message: impl Into<String>) -> Self {
        AdapterError::Parse(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Fetch(err) if err.is_timeout() => FailureKind::Timeout,
            AdapterError::Fetch(_) => FailureKind::Network,
            AdapterError::Parse(_) => FailureKind::Parse,
            AdapterError::Validation(_) => FailureKind::Validation,
        }
    }

    pub fn into_failure(self) -> SourceFailure {
        SourceFailure::new(self.kind(), self.to_string())
    }
}

/// One external source of official draw results for one game.
#[async_trait]
pub trait DrawSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn priority(&self) -> u32;
    fn format(&self) -> SourceFormat;
    fn url(&self) -> &str;

    /// Extract the most recent draw from a fetched body. `today` is the fallback
    /// anchor for pages that do not print a draw date.
    fn parse(&self, body: &str, domain: &LotteryDomain, today: NaiveDate) -> Result<Draw, AdapterError>;

    /// Fetch, parse and validate in one attempt. Never fails outright.
    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext, domain: &LotteryDomain) -> DrawResult {
        let attempt = async {
            let resp = http.fetch(ctx.run_id, self.source_id(), self.url()).await?;
            let draw = self.parse(&resp.text(), domain, ctx.today())?;
            domain.validate(&draw)?;
            Ok::<_, AdapterError>(draw)
        };

        match attempt.await {
            Ok(draw) => {
                debug!(lottery = %domain.key, source = self.source_id(), %draw, "candidate draw");
                SourceResult::ok(self.source_id(), self.priority(), draw)
            }
            Err(err) => {
                if matches!(err, AdapterError::Validation(_)) {
                    error!(lottery = %domain.key, source = self.source_id(), error = %err, "source returned an invalid draw");
                } else {
                    warn!(lottery = %domain.key, source = self.source_id(), error = %err, "draw source failed");
                }
                SourceResult::failed(self.source_id(), self.priority(), err.into_failure())
            }
        }
    }
}

/// One external source of the advertised jackpot for one game.
#[async_trait]
pub trait JackpotSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn priority(&self) -> u32;
    fn format(&self) -> SourceFormat;

    async fn quote(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<JackpotQuote, AdapterError>;

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> JackpotResult {
        match self.quote(http, ctx).await {
            Ok(quote) => SourceResult::ok(self.source_id(), self.priority(), quote),
            Err(err) => {
                warn!(source = self.source_id(), error = %err, "jackpot source failed");
                SourceResult::failed(self.source_id(), self.priority(), err.into_failure())
            }
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, AdapterError> {
    Regex::new(pattern).map_err(|e| AdapterError::parse(format!("bad pattern {pattern:?}: {e}")))
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::parse(format!("bad selector {css:?}: {e}")))
}

fn parse_number(text: &str) -> Result<u8, AdapterError> {
    text.trim()
        .parse::<u8>()
        .map_err(|_| AdapterError::parse(format!("not a ball number: {:?}", text.trim())))
}

fn us_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("static regex"))
}

fn day_first_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[a-z]+day,?\s+(\d{1,2})(?:st|nd|rd|th)?\s+([a-z]+),?\s+(\d{4})\b")
            .expect("static regex")
    })
}

fn month_first_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[a-z]+day,?\s+([a-z]+)\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b")
            .expect("static regex")
    })
}

/// First M/D/YYYY date in `text`.
pub fn find_us_date(text: &str) -> Option<NaiveDate> {
    us_date_re().captures_iter(text).find_map(|caps| {
        let month = caps[1].parse().ok()?;
        let day = caps[2].parse().ok()?;
        let year = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

fn find_long_date(text: &str) -> Option<NaiveDate> {
    let day_first = day_first_date_re().captures_iter(text).find_map(|caps| {
        NaiveDate::parse_from_str(&format!("{} {} {}", &caps[1], &caps[2], &caps[3]), "%d %B %Y").ok()
    });
    day_first.or_else(|| {
        month_first_date_re().captures_iter(text).find_map(|caps| {
            NaiveDate::parse_from_str(&format!("{} {} {}", &caps[2], &caps[1], &caps[3]), "%d %B %Y")
                .ok()
        })
    })
}

/// Draw date printed on a page, or the latest scheduled draw day when none is printed.
pub fn resolve_draw_date(text: &str, domain: &LotteryDomain, today: NaiveDate) -> Result<NaiveDate, AdapterError> {
    find_us_date(text)
        .or_else(|| find_long_date(text))
        .or_else(|| domain.latest_draw_day_on_or_before(today))
        .ok_or_else(|| AdapterError::parse(format!("{}: no draw date found", domain.key)))
}

/// Visible text of an HTML document with whitespace collapsed.
pub fn page_text(document: &Html) -> String {
    document
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<item\b[^>]*>(.*?)</item>").expect("static regex"))
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").expect("static regex"))
}

fn description_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<description\b[^>]*>(.*?)</description>").expect("static regex"))
}

fn xml_text(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw
        .strip_prefix("<![CDATA[")
        .and_then(|inner| inner.strip_suffix("]]>"))
        .unwrap_or(raw);
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// Per-game item in a multi-game RSS results feed, e.g. `03-08-19-27-44 LB-11`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssFeedSource {
    pub id: String,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Case-insensitive substring the item title must contain.
    pub title_contains: String,
    #[serde(default)]
    pub title_excludes: Vec<String>,
    /// Tag preceding the bonus number in the description.
    pub bonus_tag: String,
}

impl RssFeedSource {
    fn title_matches(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        title.contains(&self.title_contains.to_lowercase())
            && !self
                .title_excludes
                .iter()
                .any(|excluded| title.contains(&excluded.to_lowercase()))
    }
}

#[async_trait]
impl DrawSource for RssFeedSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Rss
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn parse(&self, body: &str, domain: &LotteryDomain, today: NaiveDate) -> Result<Draw, AdapterError> {
        let numbers_re = compile(&format!(
            r"(\d{{1,2}})-(\d{{1,2}})-(\d{{1,2}})-(\d{{1,2}})-(\d{{1,2}})\s+{}-(\d{{1,2}})",
            regex::escape(&self.bonus_tag)
        ))?;

        for item in item_re().captures_iter(body) {
            let block = &item[1];
            let Some(title) = title_re().captures(block).map(|c| xml_text(&c[1])) else {
                continue;
            };
            if !self.title_matches(&title) {
                continue;
            }
            let Some(description) = description_re().captures(block).map(|c| xml_text(&c[1])) else {
                continue;
            };
            let Some(caps) = numbers_re.captures(&description) else {
                debug!(source = %self.id, %title, "matching item without numbers");
                continue;
            };

            let main = (1..=5)
                .map(|i| parse_number(&caps[i]))
                .collect::<Result<Vec<_>, _>>()?;
            let bonus = parse_number(&caps[6])?;
            let date = match find_us_date(&title) {
                Some(date) => date,
                None => resolve_draw_date("", domain, today)?,
            };
            return Ok(Draw::new(date, main, bonus));
        }

        Err(AdapterError::parse(format!(
            "no feed item matching {:?} with {} numbers",
            self.title_contains, self.bonus_tag
        )))
    }
}

fn default_date_column() -> String {
    "Draw Date".to_string()
}

fn default_numbers_column() -> String {
    "Winning Numbers".to_string()
}

/// Open-data CSV export holding the full draw history.
///
/// Row order in the export is not trusted; the latest date wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvSource {
    pub id: String,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default = "default_numbers_column")]
    pub numbers_column: String,
    /// Separate bonus column. Without one the bonus is the number after the mains.
    #[serde(default)]
    pub bonus_column: Option<String>,
}

impl CsvSource {
    /// Every well-formed row of the export, in file order. Malformed rows are skipped.
    pub fn parse_history(&self, body: &str, domain: &LotteryDomain) -> Result<Vec<Draw>, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(body.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| AdapterError::parse(format!("reading csv header: {e}")))?
            .clone();

        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| AdapterError::parse(format!("csv has no {name:?} column")))
        };
        let date_idx = column(&self.date_column)?;
        let numbers_idx = column(&self.numbers_column)?;
        let bonus_idx = self.bonus_column.as_deref().map(column).transpose()?;

        let mut draws = Vec::new();
        let mut skipped = 0usize;
        for record in reader.records() {
            let Ok(record) = record else {
                skipped += 1;
                continue;
            };
            match self.row_to_draw(&record, date_idx, numbers_idx, bonus_idx, domain) {
                Some(draw) => draws.push(draw),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(source = %self.id, skipped, "skipped malformed csv rows");
        }
        Ok(draws)
    }

    fn row_to_draw(
        &self,
        record: &csv::StringRecord,
        date_idx: usize,
        numbers_idx: usize,
        bonus_idx: Option<usize>,
        domain: &LotteryDomain,
    ) -> Option<Draw> {
        let date = NaiveDate::parse_from_str(record.get(date_idx)?, "%m/%d/%Y").ok()?;
        let numbers = record
            .get(numbers_idx)?
            .split_whitespace()
            .map(|n| n.parse::<u8>().ok())
            .collect::<Option<Vec<_>>>()?;
        if numbers.len() < domain.main_count {
            return None;
        }
        let (main, rest) = numbers.split_at(domain.main_count);
        let bonus = match bonus_idx {
            Some(idx) => record.get(idx)?.parse::<u8>().ok()?,
            None => *rest.first()?,
        };
        Some(Draw::new(date, main.iter().copied(), bonus))
    }
}

#[async_trait]
impl DrawSource for CsvSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Csv
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn parse(&self, body: &str, domain: &LotteryDomain, _today: NaiveDate) -> Result<Draw, AdapterError> {
        self.parse_history(body, domain)?
            .into_iter()
            .max_by_key(|draw| draw.date)
            .ok_or_else(|| AdapterError::parse("csv has no usable rows"))
    }
}

/// Page that exposes each ball in an element whose id ends with a known label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlLabelSource {
    pub id: String,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub main_labels: Vec<String>,
    pub bonus_label: String,
}

impl HtmlLabelSource {
    fn labelled_number(&self, document: &Html, label: &str) -> Result<u8, AdapterError> {
        let sel = selector(&format!(r#"[id$="{label}"]"#))?;
        let text = document
            .select(&sel)
            .next()
            .map(|node| node.text().collect::<String>())
            .ok_or_else(|| AdapterError::parse(format!("no element labelled {label}")))?;
        parse_number(&text)
    }
}

#[async_trait]
impl DrawSource for HtmlLabelSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Html
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn parse(&self, body: &str, domain: &LotteryDomain, today: NaiveDate) -> Result<Draw, AdapterError> {
        let document = Html::parse_document(body);
        let main = self
            .main_labels
            .iter()
            .map(|label| self.labelled_number(&document, label))
            .collect::<Result<Vec<_>, _>>()?;
        let bonus = self.labelled_number(&document, &self.bonus_label)?;
        let date = resolve_draw_date(&page_text(&document), domain, today)?;
        Ok(Draw::new(date, main, bonus))
    }
}

/// Page that renders balls as a run of elements matched by one selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlBallSource {
    pub id: String,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub ball_selector: String,
    /// Pick balls by the game's numeric ranges instead of by position.
    #[serde(default)]
    pub range_filter: bool,
}

impl HtmlBallSource {
    fn pick_positional(&self, numbers: &[u8], domain: &LotteryDomain) -> Option<(Vec<u8>, u8)> {
        let bonus = *numbers.get(domain.main_count)?;
        Some((numbers[..domain.main_count].to_vec(), bonus))
    }

    fn pick_by_range(&self, numbers: &[u8], domain: &LotteryDomain) -> Option<(Vec<u8>, u8)> {
        let mut main = Vec::with_capacity(domain.main_count);
        for &n in numbers {
            if main.len() < domain.main_count {
                if (1..=domain.main_max).contains(&n) && !main.contains(&n) {
                    main.push(n);
                }
            } else if (1..=domain.bonus_max).contains(&n) {
                return Some((main, n));
            }
        }
        None
    }
}

#[async_trait]
impl DrawSource for HtmlBallSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Html
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn parse(&self, body: &str, domain: &LotteryDomain, today: NaiveDate) -> Result<Draw, AdapterError> {
        let document = Html::parse_document(body);
        let sel = selector(&self.ball_selector)?;
        let numbers: Vec<u8> = document
            .select(&sel)
            .filter_map(|node| node.text().collect::<String>().trim().parse().ok())
            .collect();

        let picked = if self.range_filter {
            self.pick_by_range(&numbers, domain)
        } else {
            self.pick_positional(&numbers, domain)
        };
        let (main, bonus) = picked.ok_or_else(|| {
            AdapterError::parse(format!(
                "found {} balls under {:?}, not enough for a draw",
                numbers.len(),
                self.ball_selector
            ))
        })?;

        let date = resolve_draw_date(&page_text(&document), domain, today)?;
        Ok(Draw::new(date, main, bonus))
    }
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\$\s*(\d[\d,]*(?:\.\d+)?)\s*(million|billion|m|b)\b").expect("static regex")
    })
}

fn cash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)cash(?:\s+value|\s+option)?[^$]{0,40}\$\s*(\d[\d,]*(?:\.\d+)?)\s*(million|billion|m|b)?\b")
            .expect("static regex")
    })
}

fn to_millions(number: &str, unit: Option<&str>) -> Option<f64> {
    let value: f64 = number.replace(',', "").parse().ok()?;
    match unit.map(str::to_ascii_lowercase).as_deref() {
        Some("billion" | "b") => Some(value * 1000.0),
        Some(_) => Some(value),
        // Bare dollar figure.
        None if value >= 100_000.0 => Some(value / 1_000_000.0),
        None => Some(value),
    }
}

fn trim_decimal(value: f64) -> String {
    let text = format!("{value:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Display form of an advertised amount, e.g. `$165M` or `$1.2B`.
pub fn format_amount(millions: f64) -> String {
    if millions >= 1000.0 {
        format!("${}B", trim_decimal(millions / 1000.0))
    } else {
        format!("${}M", trim_decimal(millions))
    }
}

fn default_cash_ratio() -> f64 {
    0.45
}

/// Jackpot scraped from a results or game page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlJackpotSource {
    pub id: String,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Used to estimate the cash value when the page does not print one.
    #[serde(default = "default_cash_ratio")]
    pub cash_ratio: f64,
    /// Only look for the amount after the first occurrence of this phrase.
    #[serde(default)]
    pub amount_after: Option<String>,
}

impl HtmlJackpotSource {
    pub fn parse_quote(&self, body: &str) -> Result<JackpotQuote, AdapterError> {
        let text = page_text(&Html::parse_document(body));
        let window = match &self.amount_after {
            Some(phrase) => {
                let at = text
                    .to_ascii_lowercase()
                    .find(&phrase.to_ascii_lowercase())
                    .ok_or_else(|| AdapterError::parse(format!("page does not mention {phrase:?}")))?;
                &text[at..]
            }
            None => text.as_str(),
        };

        let amount = amount_re()
            .captures(window)
            .and_then(|caps| to_millions(&caps[1], caps.get(2).map(|m| m.as_str())))
            .ok_or_else(|| AdapterError::parse("no jackpot amount on page"))?;

        let cash = cash_re()
            .captures(&text)
            .and_then(|caps| to_millions(&caps[1], caps.get(2).map(|m| m.as_str())))
            .unwrap_or(amount * self.cash_ratio);

        Ok(JackpotQuote {
            amount: format_amount(amount),
            cash_value: (cash * 1_000_000.0).round() as u64,
        })
    }
}

#[async_trait]
impl JackpotSource for HtmlJackpotSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Html
    }

    async fn quote(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<JackpotQuote, AdapterError> {
        let resp = http.fetch(ctx.run_id, &self.id, &self.url).await?;
        self.parse_quote(&resp.text())
    }
}

/// Prize that never changes, such as a lifetime annuity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedJackpotSource {
    pub id: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub amount: String,
    pub cash_value: u64,
}

#[async_trait]
impl JackpotSource for FixedJackpotSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Fixed
    }

    async fn quote(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> Result<JackpotQuote, AdapterError> {
        Ok(JackpotQuote {
            amount: self.amount.clone(),
            cash_value: self.cash_value,
        })
    }
}

/// Registry entry for a draw source, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrawSourceSpec {
    Rss(RssFeedSource),
    Csv(CsvSource),
    HtmlLabels(HtmlLabelSource),
    HtmlBalls(HtmlBallSource),
}

impl DrawSourceSpec {
    pub fn id(&self) -> &str {
        match self {
            DrawSourceSpec::Rss(s) => &s.id,
            DrawSourceSpec::Csv(s) => &s.id,
            DrawSourceSpec::HtmlLabels(s) => &s.id,
            DrawSourceSpec::HtmlBalls(s) => &s.id,
        }
    }

    pub fn as_csv(&self) -> Option<&CsvSource> {
        match self {
            DrawSourceSpec::Csv(s) => Some(s),
            _ => None,
        }
    }

    pub fn build(&self) -> Arc<dyn DrawSource> {
        match self {
            DrawSourceSpec::Rss(s) => Arc::new(s.clone()),
            DrawSourceSpec::Csv(s) => Arc::new(s.clone()),
            DrawSourceSpec::HtmlLabels(s) => Arc::new(s.clone()),
            DrawSourceSpec::HtmlBalls(s) => Arc::new(s.clone()),
        }
    }
}

/// Registry entry for a jackpot source, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JackpotSourceSpec {
    Html(HtmlJackpotSource),
    Fixed(FixedJackpotSource),
}

impl JackpotSourceSpec {
    pub fn build(&self) -> Arc<dyn JackpotSource> {
        match self {
            JackpotSourceSpec::Html(s) => Arc::new(s.clone()),
            JackpotSourceSpec::Fixed(s) => Arc::new(s.clone()),
        }
    }
}

/// Instantiate draw adapters ordered by ascending priority.
pub fn build_draw_sources(specs: &[DrawSourceSpec]) -> Vec<Arc<dyn DrawSource>> {
    let mut sources: Vec<_> = specs.iter().map(DrawSourceSpec::build).collect();
    sources.sort_by_key(|s| s.priority());
    sources
}

/// Instantiate jackpot adapters ordered by ascending priority.
pub fn build_jackpot_sources(specs: &[JackpotSourceSpec]) -> Vec<Arc<dyn JackpotSource>> {
    let mut sources: Vec<_> = specs.iter().map(JackpotSourceSpec::build).collect();
    sources.sort_by_key(|s| s.priority());
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};
    use std::fs;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        fs::read_to_string(workspace_root().join("fixtures").join(name)).expect("read fixture")
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn powerball() -> LotteryDomain {
        LotteryDomain::new("PB", "Powerball", 69, 26, [Weekday::Mon, Weekday::Wed, Weekday::Sat], at(21, 59))
    }

    fn mega_millions() -> LotteryDomain {
        LotteryDomain::new("MM", "Mega Millions", 70, 25, [Weekday::Tue, Weekday::Fri], at(22, 0))
    }

    fn lotto_america() -> LotteryDomain {
        LotteryDomain::new("LA", "Lotto America", 52, 10, [Weekday::Mon, Weekday::Wed, Weekday::Sat], at(22, 0))
    }

    fn lucky_for_life() -> LotteryDomain {
        LotteryDomain::new(
            "L4L",
            "Lucky for Life",
            48,
            18,
            [
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            at(21, 38),
        )
    }

    fn ct_rss(title_contains: &str, excludes: &[&str], bonus_tag: &str) -> RssFeedSource {
        RssFeedSource {
            id: "ct_rss".into(),
            url: "https://www.ctlottery.org/Feeds/rssnumbers.xml".into(),
            priority: 2,
            title_contains: title_contains.into(),
            title_excludes: excludes.iter().map(|s| s.to_string()).collect(),
            bonus_tag: bonus_tag.into(),
        }
    }

    fn iowa_la() -> HtmlLabelSource {
        HtmlLabelSource {
            id: "iowa".into(),
            url: "https://www.ialottery.com/games/lotto-america".into(),
            priority: 3,
            main_labels: (1..=5).map(|i| format!("lblLAN{i}")).collect(),
            bonus_label: "lblLAPower".into(),
        }
    }

    #[test]
    fn rss_skips_double_play_and_reads_the_powerball_item() {
        let draw = ct_rss("powerball", &["double"], "PB")
            .parse(&fixture("ct_rss.xml"), &powerball(), date("2026-01-20"))
            .unwrap();
        assert_eq!(draw, Draw::new(date("2026-01-19"), [4, 18, 29, 47, 66], 12));
    }

    #[test]
    fn rss_unwraps_cdata_descriptions() {
        let draw = ct_rss("lucky for life", &[], "LB")
            .parse(&fixture("ct_rss.xml"), &lucky_for_life(), date("2026-01-21"))
            .unwrap();
        assert_eq!(draw, Draw::new(date("2026-01-20"), [3, 8, 19, 27, 44], 11));
    }

    #[test]
    fn rss_without_a_matching_item_is_a_parse_error() {
        let err = ct_rss("mega millions", &[], "MB")
            .parse(&fixture("ct_rss.xml"), &mega_millions(), date("2026-01-20"))
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Parse);
    }

    #[test]
    fn csv_takes_latest_row_and_sixth_number_as_bonus() {
        let source = CsvSource {
            id: "ny_open_data".into(),
            url: "https://data.ny.gov/api/views/d6yy-54nr/rows.csv?accessType=DOWNLOAD".into(),
            priority: 1,
            date_column: default_date_column(),
            numbers_column: default_numbers_column(),
            bonus_column: None,
        };
        let draw = source
            .parse(&fixture("ny_powerball.csv"), &powerball(), date("2026-01-20"))
            .unwrap();
        assert_eq!(draw, Draw::new(date("2026-01-19"), [4, 18, 29, 47, 66], 12));
    }

    #[test]
    fn csv_with_bonus_column_skips_malformed_rows() {
        let source = CsvSource {
            id: "ny_open_data".into(),
            url: "https://data.ny.gov/api/views/5xaw-6ayf/rows.csv?accessType=DOWNLOAD".into(),
            priority: 1,
            date_column: default_date_column(),
            numbers_column: default_numbers_column(),
            bonus_column: Some("Mega Ball".into()),
        };
        let body = fixture("ny_mega_millions.csv");
        let history = source.parse_history(&body, &mega_millions()).unwrap();
        assert_eq!(history.len(), 3);

        let latest = source.parse(&body, &mega_millions(), date("2026-01-18")).unwrap();
        assert_eq!(latest, Draw::new(date("2026-01-16"), [8, 15, 27, 44, 61], 19));
    }

    #[test]
    fn csv_without_expected_column_is_a_parse_error() {
        let source = CsvSource {
            id: "ny_open_data".into(),
            url: String::new(),
            priority: 1,
            date_column: default_date_column(),
            numbers_column: default_numbers_column(),
            bonus_column: Some("Cash Ball".into()),
        };
        let err = source
            .parse(&fixture("ny_mega_millions.csv"), &mega_millions(), date("2026-01-18"))
            .unwrap_err();
        assert!(err.to_string().contains("Cash Ball"));
    }

    #[test]
    fn html_labels_read_suffix_matched_ids_and_page_date() {
        let draw = iowa_la()
            .parse(&fixture("iowa_lotto_america.html"), &lotto_america(), date("2026-01-20"))
            .unwrap();
        assert_eq!(draw, Draw::new(date("2026-01-19"), [3, 9, 20, 33, 48], 7));
    }

    #[test]
    fn html_labels_missing_label_is_a_parse_error() {
        let err = iowa_la()
            .parse("<html><body><span id='x_lblLAN1'>4</span></body></html>", &lotto_america(), date("2026-01-20"))
            .unwrap_err();
        assert!(err.to_string().contains("lblLAN2"));
    }

    #[test]
    fn html_balls_range_filter_drops_repeats_and_takes_bonus_after_mains() {
        let source = HtmlBallSource {
            id: "lotto_net".into(),
            url: "https://www.lotto.net/lotto-america/numbers".into(),
            priority: 99,
            ball_selector: ".balls li".into(),
            range_filter: true,
        };
        let draw = source
            .parse(&fixture("lotto_net_lotto_america.html"), &lotto_america(), date("2026-01-22"))
            .unwrap();
        assert_eq!(draw, Draw::new(date("2026-01-19"), [3, 9, 20, 33, 48], 7));
    }

    #[test]
    fn undated_page_falls_back_to_latest_draw_day() {
        let source = HtmlBallSource {
            id: "lottoamerica_com".into(),
            url: String::new(),
            priority: 99,
            ball_selector: ".ball".into(),
            range_filter: false,
        };
        let body = r#"<div><span class="ball">12</span><span class="ball">5</span>
            <span class="ball">40</span><span class="ball">31</span><span class="ball">22</span>
            <span class="ball">6</span></div>"#;
        // Tuesday: the latest LA draw day is Monday.
        let draw = source.parse(body, &lotto_america(), date("2026-01-20")).unwrap();
        assert_eq!(draw, Draw::new(date("2026-01-19"), [5, 12, 22, 31, 40], 6));
    }

    #[test]
    fn long_dates_parse_in_both_orders() {
        assert_eq!(find_long_date("Monday 19th January 2026"), Some(date("2026-01-19")));
        assert_eq!(find_long_date("Saturday, January 24, 2026"), Some(date("2026-01-24")));
        assert_eq!(find_long_date("no date here"), None);
    }

    #[test]
    fn html_jackpot_reads_amount_and_printed_cash_value() {
        let source = HtmlJackpotSource {
            id: "texas".into(),
            url: String::new(),
            priority: 1,
            cash_ratio: 0.45,
            amount_after: Some("Jackpot".into()),
        };
        let quote = source.parse_quote(&fixture("texas_powerball.html")).unwrap();
        assert_eq!(quote.amount, "$165M");
        assert_eq!(quote.cash_value, 74_300_000);
    }

    #[test]
    fn html_jackpot_estimates_cash_value_from_ratio() {
        let source = HtmlJackpotSource {
            id: "powerball_com".into(),
            url: String::new(),
            priority: 2,
            cash_ratio: 0.45,
            amount_after: None,
        };
        let quote = source
            .parse_quote("<div><h3>Estimated Jackpot</h3><span>$1.2 Billion</span></div>")
            .unwrap();
        assert_eq!(quote.amount, "$1.2B");
        assert_eq!(quote.cash_value, 540_000_000);
    }

    #[test]
    fn format_amount_trims_trailing_zeros() {
        assert_eq!(format_amount(2.85), "$2.85M");
        assert_eq!(format_amount(165.0), "$165M");
        assert_eq!(format_amount(1500.0), "$1.5B");
    }

    #[test]
    fn abbreviated_units_are_understood() {
        let source = HtmlJackpotSource {
            id: "valottery".into(),
            url: String::new(),
            priority: 1,
            cash_ratio: default_cash_ratio(),
            amount_after: None,
        };
        let quote = source.parse_quote("<p>Mega Millions $350M</p>").unwrap();
        assert_eq!(quote.amount, "$350M");
        assert_eq!(quote.cash_value, 157_500_000);
    }

    #[tokio::test]
    async fn fixed_jackpot_needs_no_network() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let ctx = AdapterContext::new(Uuid::new_v4(), date("2026-01-20").and_hms_opt(9, 0, 0).unwrap());
        let source = FixedJackpotSource {
            id: "fixed".into(),
            priority: 1,
            amount: "$7,000/week for life".into(),
            cash_value: 5_750_000,
        };
        let result = source.fetch(&http, &ctx).await;
        assert_eq!(result.candidate().map(|q| q.cash_value), Some(5_750_000));
    }

    #[test]
    fn specs_deserialize_by_kind_and_sort_by_priority() {
        let specs: Vec<DrawSourceSpec> = serde_json::from_str(
            r#"[
                {"kind": "html_balls", "id": "lotto_net", "url": "https://x", "ball_selector": ".ball"},
                {"kind": "csv", "id": "ny_open_data", "url": "https://y", "priority": 1}
            ]"#,
        )
        .unwrap();
        assert!(specs[1].as_csv().is_some());

        let sources = build_draw_sources(&specs);
        let ids: Vec<_> = sources.iter().map(|s| s.source_id().to_string()).collect();
        assert_eq!(ids, vec!["ny_open_data", "lotto_net"]);
        assert_eq!(sources[1].priority(), DEFAULT_PRIORITY);
        assert_eq!(sources[0].format(), SourceFormat::Csv);
    }
}
