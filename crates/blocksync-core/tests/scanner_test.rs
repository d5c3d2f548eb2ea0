#![allow(clippy::unwrap_used)]
// DegradeScanner against an in-memory feed with scripted failures.

use std::sync::Mutex;

use pretty_assertions::assert_eq;

use blocksync_api::Error;
use blocksync_api::feed::{Feed, FeedPage, FeedQuery};
use blocksync_core::config::ScannerConfig;
use blocksync_core::scanner::{DegradeScanner, Predicate, ScanWindow};

// ── Fake feed ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Rec {
    h: u64,
    kind: &'static str,
}

fn rec(h: u64, kind: &'static str) -> Rec {
    Rec { h, kind }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterMode {
    /// Filters by exact `kind`.
    Native,
    /// Rejects every filtered query as unsupported.
    Unsupported,
    /// Every filtered query fails.
    Failing,
    /// Advertises no filter at all.
    Absent,
}

type FailRule = Box<dyn Fn(usize, &FeedQuery) -> bool + Send + Sync>;

struct FakeFeed {
    records: Vec<Rec>,
    mode: FilterMode,
    fail: FailRule,
    queries: Mutex<Vec<FeedQuery>>,
}

impl FakeFeed {
    fn new(records: Vec<Rec>, mode: FilterMode) -> Self {
        Self {
            records,
            mode,
            fail: Box::new(|_, _| false),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Fail every query `rule` picks, by 0-based index.
    fn failing_when(
        mut self,
        rule: impl Fn(usize, &FeedQuery) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail = Box::new(rule);
        self
    }

    fn queries(&self) -> Vec<FeedQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl Feed for FakeFeed {
    type Record = Rec;

    fn filter_param(&self) -> Option<&str> {
        match self.mode {
            FilterMode::Absent => None,
            _ => Some("kind"),
        }
    }

    fn max_limit(&self) -> u32 {
        100
    }

    async fn query(&self, query: FeedQuery) -> Result<FeedPage<Rec>, Error> {
        let index = {
            let mut queries = self.queries.lock().unwrap();
            queries.push(query.clone());
            queries.len() - 1
        };
        if (self.fail)(index, &query) {
            return Err(Error::Http {
                status: 503,
                body: "busy".into(),
            });
        }

        let kind = match (&query.filter, self.mode) {
            (None, _) => None,
            (Some(filter), FilterMode::Native) => Some(filter.value.clone()),
            (Some(filter), FilterMode::Unsupported | FilterMode::Absent) => {
                return Err(Error::FilterUnsupported {
                    param: filter.param.clone(),
                });
            }
            (Some(_), FilterMode::Failing) => {
                return Err(Error::Rpc {
                    code: -32000,
                    message: "index unavailable".into(),
                });
            }
        };

        let matching: Vec<Rec> = self
            .records
            .iter()
            .filter(|r| query.start.is_none_or(|s| r.h >= s))
            .filter(|r| query.end.is_none_or(|e| r.h <= e))
            .filter(|r| kind.as_deref().is_none_or(|k| r.kind == k))
            .cloned()
            .collect();

        let limit = usize::try_from(query.limit).unwrap();
        let truncated = matching.len() > limit;
        let next_start = matching.get(limit).map(|r| r.h);
        Ok(FeedPage {
            records: matching.into_iter().take(limit).collect(),
            truncated,
            next_start,
        })
    }
}

fn kind_is(kind: &'static str) -> Predicate<Rec> {
    Predicate::new(move |r: &Rec| r.kind == kind).with_filter(kind)
}

fn example_records() -> Vec<Rec> {
    vec![rec(10, "a"), rec(20, "b"), rec(30, "a")]
}

fn heights(found: Option<Rec>) -> Option<u64> {
    found.map(|r| r.h)
}

// ── Two-pass behaviour ──────────────────────────────────────────────

#[tokio::test]
async fn test_latest_matching_record_wins() {
    let feed = FakeFeed::new(example_records(), FilterMode::Native);
    let scanner = DegradeScanner::default();

    let found = scanner
        .find_latest(&feed, &kind_is("a"), ScanWindow::latest(50))
        .await;

    assert_eq!(found, Some(rec(30, "a")));
    let queries = feed.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].filter.as_ref().map(|f| f.value.as_str()), Some("a"));
}

#[tokio::test]
async fn test_failing_filter_matches_unfiltered_result() {
    let scanner = DegradeScanner::default();
    let window = ScanWindow::latest(50);

    let failing = FakeFeed::new(example_records(), FilterMode::Failing);
    let unfiltered = FakeFeed::new(example_records(), FilterMode::Absent);

    let via_fallback = scanner.find_latest(&failing, &kind_is("a"), window).await;
    let direct = scanner.find_latest(&unfiltered, &kind_is("a"), window).await;

    assert_eq!(heights(via_fallback.clone()), Some(30));
    assert_eq!(via_fallback, direct);
}

#[tokio::test]
async fn test_fallback_pass_is_unfiltered_and_widened() {
    let feed = FakeFeed::new(example_records(), FilterMode::Unsupported);
    let scanner = DegradeScanner::new(ScannerConfig {
        limit: 20,
        fallback_multiplier: 4,
        max_pages: 8,
    });

    let found = scanner
        .find_latest(&feed, &kind_is("b"), scanner.default_window())
        .await;

    assert_eq!(heights(found), Some(20));
    let queries = feed.queries();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].filter.is_some());
    assert_eq!(queries[0].limit, 20);
    assert!(queries[1].filter.is_none());
    assert_eq!(queries[1].limit, 80);
}

#[tokio::test]
async fn test_widened_limit_is_capped_by_feed() {
    let feed = FakeFeed::new(example_records(), FilterMode::Failing);
    let scanner = DegradeScanner::default();

    scanner
        .find_latest(&feed, &kind_is("a"), ScanWindow::latest(60))
        .await;

    assert_eq!(feed.queries()[1].limit, 100);
}

#[tokio::test]
async fn test_empty_filtered_result_falls_back() {
    // The feed filters case-sensitively; the client-side test does not.
    let feed = FakeFeed::new(example_records(), FilterMode::Native);
    let predicate = Predicate::new(|r: &Rec| r.kind.eq_ignore_ascii_case("A")).with_filter("A");

    let found = DegradeScanner::default()
        .find_latest(&feed, &predicate, ScanWindow::latest(50))
        .await;

    assert_eq!(heights(found), Some(30));
    assert_eq!(feed.queries().len(), 2);
}

#[tokio::test]
async fn test_predicate_without_filter_skips_first_pass() {
    let feed = FakeFeed::new(example_records(), FilterMode::Native);
    let predicate = Predicate::new(|r: &Rec| r.h < 25);

    let found = DegradeScanner::default()
        .find_latest(&feed, &predicate, ScanWindow::latest(50))
        .await;

    assert_eq!(heights(found), Some(20));
    let queries = feed.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].filter.is_none());
}

#[tokio::test]
async fn test_total_failure_is_none() {
    let feed = FakeFeed::new(example_records(), FilterMode::Native).failing_when(|_, _| true);

    let found = DegradeScanner::default()
        .find_latest(&feed, &kind_is("a"), ScanWindow::latest(50))
        .await;

    assert_eq!(found, None);
    assert_eq!(feed.queries().len(), 2);
}

#[tokio::test]
async fn test_scan_separates_failure_from_no_match() {
    let scanner = DegradeScanner::default();
    let window = ScanWindow::latest(50);

    let down = FakeFeed::new(example_records(), FilterMode::Native).failing_when(|_, _| true);
    assert!(scanner.scan(&down, &kind_is("a"), window).await.is_err());

    let up = FakeFeed::new(example_records(), FilterMode::Native);
    assert_eq!(scanner.scan(&up, &kind_is("z"), window).await.unwrap(), None);

    // Filtered pass answered; the fallback failing is not total failure.
    let fallback_down =
        FakeFeed::new(example_records(), FilterMode::Native).failing_when(|index, _| index == 1);
    assert_eq!(scanner.scan(&fallback_down, &kind_is("z"), window).await.unwrap(), None);
    assert_eq!(fallback_down.queries().len(), 2);
}

#[tokio::test]
async fn test_scan_counts_matches_on_the_winning_page() {
    let feed = FakeFeed::new(example_records(), FilterMode::Absent);

    let hit = DegradeScanner::default()
        .scan(&feed, &kind_is("a"), ScanWindow::latest(50))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(hit.record, rec(30, "a"));
    assert_eq!(hit.page_matches, 2);
}

#[tokio::test]
async fn test_no_match_anywhere_is_none() {
    let feed = FakeFeed::new(example_records(), FilterMode::Native);

    let found = DegradeScanner::default()
        .find_latest(&feed, &kind_is("z"), ScanWindow::latest(50))
        .await;

    assert_eq!(found, None);
}

#[tokio::test]
async fn test_window_bounds_are_passed_through() {
    let feed = FakeFeed::new(example_records(), FilterMode::Native);

    let found = DegradeScanner::default()
        .find_latest(&feed, &kind_is("a"), ScanWindow::new(Some(5), Some(25), 50))
        .await;

    assert_eq!(heights(found), Some(10));
    let queries = feed.queries();
    assert_eq!((queries[0].start, queries[0].end), (Some(5), Some(25)));
}

// ── Pagination ──────────────────────────────────────────────────────

fn many_records() -> Vec<Rec> {
    (1..=25)
        .map(|h| rec(h, if h % 2 == 0 { "even" } else { "odd" }))
        .collect()
}

fn paged(max_pages: u32) -> DegradeScanner {
    DegradeScanner::new(ScannerConfig {
        limit: 10,
        fallback_multiplier: 1,
        max_pages,
    })
}

#[tokio::test]
async fn test_follows_truncated_pages_to_the_newest_match() {
    let feed = FakeFeed::new(many_records(), FilterMode::Absent);
    let scanner = paged(8);

    let found = scanner
        .find_latest(&feed, &Predicate::new(|r: &Rec| r.kind == "even"), scanner.default_window())
        .await;

    assert_eq!(heights(found), Some(24));
    let starts: Vec<_> = feed.queries().iter().map(|q| q.start).collect();
    assert_eq!(starts, vec![None, Some(11), Some(21)]);
}

#[tokio::test]
async fn test_page_cap_limits_the_scan() {
    let feed = FakeFeed::new(many_records(), FilterMode::Absent);
    let scanner = paged(2);

    let found = scanner
        .find_latest(&feed, &Predicate::new(|r: &Rec| r.kind == "odd"), scanner.default_window())
        .await;

    assert_eq!(heights(found), Some(19));
    assert_eq!(feed.queries().len(), 2);
}

#[tokio::test]
async fn test_later_page_error_keeps_earlier_match() {
    let feed = FakeFeed::new(many_records(), FilterMode::Native).failing_when(|index, _| index == 1);
    let scanner = paged(8);

    let found = scanner
        .find_latest(&feed, &kind_is("even"), scanner.default_window())
        .await;

    // First filtered page holds evens 2..=20; page two fails.
    assert_eq!(heights(found), Some(20));
    assert_eq!(feed.queries().len(), 2);
}
