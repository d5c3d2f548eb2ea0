// ── Degrade-and-retry latest-record scan ──
//
// Finds the most recent record matching a predicate in an ascending,
// paginated feed. The feed's native filter is tried first; an error, an
// empty result, or a "filter unsupported" answer falls back to a wider
// unfiltered scan of the same window. `find_latest` folds total failure
// into `None`; `scan` keeps it apart from "nothing matched".

use std::fmt;
use std::sync::Arc;

use blocksync_api::feed::{Feed, FeedFilter, FeedQuery};
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;

/// Height range and page size of a scan. Heights are inclusive; `None`
/// leaves that end open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub start_height: Option<u64>,
    pub end_height: Option<u64>,
    pub limit: u32,
}

impl ScanWindow {
    pub fn new(start_height: Option<u64>, end_height: Option<u64>, limit: u32) -> Self {
        Self {
            start_height,
            end_height,
            limit,
        }
    }

    /// Most recent records, whatever their height.
    pub fn latest(limit: u32) -> Self {
        Self::new(None, None, limit)
    }

    /// Same range with the limit multiplied by `factor`, capped at `max`.
    pub fn widened(self, factor: u32, max: u32) -> Self {
        Self {
            limit: self.limit.saturating_mul(factor.max(1)).min(max),
            ..self
        }
    }
}

/// Client-side match test, optionally paired with a value for the feed's
/// native filter.
pub struct Predicate<R> {
    filter: Option<String>,
    test: Arc<dyn Fn(&R) -> bool + Send + Sync>,
}

impl<R> Predicate<R> {
    pub fn new(test: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        Self {
            filter: None,
            test: Arc::new(test),
        }
    }

    /// Accept every record.
    pub fn any() -> Self {
        Self::new(|_| true)
    }

    /// Value to pass as the feed's native filter. The client-side test
    /// still runs on filtered results.
    pub fn with_filter(mut self, value: impl Into<String>) -> Self {
        self.filter = Some(value.into());
        self
    }

    pub fn filter_value(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn matches(&self, record: &R) -> bool {
        (self.test)(record)
    }
}

impl<R> Clone for Predicate<R> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            test: Arc::clone(&self.test),
        }
    }
}

impl<R> fmt::Debug for Predicate<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Newest match of a scan and how many records on its page matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit<R> {
    pub record: R,
    pub page_matches: usize,
}

/// Two-pass latest-record finder.
#[derive(Debug, Clone, Default)]
pub struct DegradeScanner {
    config: ScannerConfig,
}

impl DegradeScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Default window for this scanner's configuration.
    pub fn default_window(&self) -> ScanWindow {
        ScanWindow::latest(self.config.limit)
    }

    /// Latest record in `window` that satisfies `predicate`, or `None`
    /// when nothing matched or the feed could not be read at all.
    pub async fn find_latest<F: Feed>(
        &self,
        feed: &F,
        predicate: &Predicate<F::Record>,
        window: ScanWindow,
    ) -> Option<F::Record> {
        self.scan(feed, predicate, window)
            .await
            .ok()
            .flatten()
            .map(|hit| hit.record)
    }

    /// Like [`find_latest`](Self::find_latest), but total failure is an
    /// error: the unfiltered pass failed and the filtered pass (if any)
    /// did not answer either. A filtered pass that succeeded with no match
    /// makes a failed fallback `Ok(None)`.
    pub async fn scan<F: Feed>(
        &self,
        feed: &F,
        predicate: &Predicate<F::Record>,
        window: ScanWindow,
    ) -> Result<Option<ScanHit<F::Record>>, blocksync_api::Error> {
        let mut filtered_answered = false;
        if let (Some(param), Some(value)) = (feed.filter_param(), predicate.filter_value()) {
            let filter = FeedFilter {
                param: param.to_owned(),
                value: value.to_owned(),
            };
            match self.pass(feed, predicate, window, Some(&filter)).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {
                    filtered_answered = true;
                    debug!(param, value, "filtered scan found nothing, falling back");
                }
                Err(e) if e.is_unsupported() => {
                    info!(param, error = %e, "feed rejected filter, falling back to unfiltered scan");
                }
                Err(e) => warn!(param, error = %e, "filtered scan failed, falling back"),
            }
        }

        let wide = window.widened(self.config.fallback_multiplier, feed.max_limit());
        match self.pass(feed, predicate, wide, None).await {
            Ok(hit) => Ok(hit),
            Err(e) if filtered_answered => {
                warn!(error = %e, "unfiltered scan failed");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "both scan passes failed");
                Err(e)
            }
        }
    }

    /// One pass over the window, following truncation hints. Later pages
    /// hold newer records, so a match there supersedes earlier ones.
    async fn pass<F: Feed>(
        &self,
        feed: &F,
        predicate: &Predicate<F::Record>,
        window: ScanWindow,
        filter: Option<&FeedFilter>,
    ) -> Result<Option<ScanHit<F::Record>>, blocksync_api::Error> {
        let mut start = window.start_height;
        let mut latest = None;

        for page_no in 0..self.config.max_pages.max(1) {
            let query = FeedQuery {
                start,
                end: window.end_height,
                limit: window.limit.clamp(1, feed.max_limit()),
                filter: filter.cloned(),
            };
            let page = match feed.query(query).await {
                Ok(page) => page,
                Err(e) if latest.is_some() => {
                    warn!(page = page_no, error = %e, "scan page failed, keeping earlier match");
                    break;
                }
                Err(e) => return Err(e),
            };

            debug!(
                page = page_no,
                records = page.records.len(),
                truncated = page.truncated,
                filtered = filter.is_some(),
                "scan page"
            );
            let mut matches = page.records.into_iter().rev().filter(|r| predicate.matches(r));
            if let Some(record) = matches.next() {
                latest = Some(ScanHit {
                    record,
                    page_matches: 1 + matches.count(),
                });
            }

            match (page.truncated, page.next_start) {
                (true, Some(next)) if start.is_none_or(|s| next > s) => start = Some(next),
                _ => break,
            }
        }

        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widened_respects_feed_cap() {
        let window = ScanWindow::new(Some(10), Some(20), 200);
        assert_eq!(window.widened(4, 512).limit, 512);
        assert_eq!(window.widened(2, 512).limit, 400);
        assert_eq!(window.widened(0, 512).limit, 200);
        assert_eq!(window.widened(4, 512).start_height, Some(10));
    }

    #[test]
    fn predicate_carries_filter_hint() {
        let predicate = Predicate::<u64>::new(|h| *h > 5).with_filter("compute");
        assert_eq!(predicate.filter_value(), Some("compute"));
        assert!(predicate.matches(&6));
        assert!(!predicate.matches(&5));
        assert!(Predicate::<u64>::any().matches(&0));
    }
}
