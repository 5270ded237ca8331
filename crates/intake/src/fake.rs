//! Fake: test doubles for the downstream collaborators.
//!
//! Deterministic in-memory implementations of the `collab` traits with
//! failure and delay injection, for unit and integration tests that must
//! not depend on real analysis services.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::collab::{
    AnalysisStore, BoxFuture, CollabError, ExtractOptions, Indicator, IocExtractor, MitreMapper,
    Notification, Notifier, Summarizer, SummaryOptions, TechniqueMatch,
};
use crate::state::{AnalysisId, AnalysisRecord};

/// Shared knobs: fail on demand, sleep before answering, count calls.
#[derive(Debug, Default)]
struct Behaviour {
    fail: AtomicBool,
    delay: std::sync::Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl Behaviour {
    async fn enter(&self, what: &str) -> Result<(), CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().map(|d| *d).unwrap_or(None);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollabError::Failed(format!("injected {} failure", what)));
        }
        Ok(())
    }

    fn set_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
    }
}

/// Returns a canned indicator list for every call.
#[derive(Debug, Default)]
pub struct FakeExtractor {
    indicators: Vec<Indicator>,
    behaviour: Behaviour,
}

impl FakeExtractor {
    pub fn returning(indicators: Vec<Indicator>) -> Self {
        Self { indicators, behaviour: Behaviour::default() }
    }

    pub fn failing() -> Self {
        let fake = Self::default();
        fake.set_failing(true);
        fake
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.behaviour.set_delay(delay);
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.behaviour.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.behaviour.calls.load(Ordering::SeqCst)
    }
}

impl IocExtractor for FakeExtractor {
    fn extract<'a>(
        &'a self,
        _content: &'a str,
        _options: &'a ExtractOptions,
    ) -> BoxFuture<'a, Result<Vec<Indicator>, CollabError>> {
        Box::pin(async move {
            self.behaviour.enter("extract").await?;
            Ok(self.indicators.clone())
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeMapper {
    techniques: Vec<TechniqueMatch>,
    behaviour: Behaviour,
}

impl FakeMapper {
    pub fn returning(techniques: Vec<TechniqueMatch>) -> Self {
        Self { techniques, behaviour: Behaviour::default() }
    }

    pub fn failing() -> Self {
        let fake = Self::default();
        fake.behaviour.fail.store(true, Ordering::SeqCst);
        fake
    }

    pub fn calls(&self) -> usize {
        self.behaviour.calls.load(Ordering::SeqCst)
    }
}

impl MitreMapper for FakeMapper {
    fn map<'a>(&'a self, _indicators: &'a [Indicator]) -> BoxFuture<'a, Result<Vec<TechniqueMatch>, CollabError>> {
        Box::pin(async move {
            self.behaviour.enter("map").await?;
            Ok(self.techniques.clone())
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeSummarizer {
    behaviour: Behaviour,
}

impl FakeSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let fake = Self::default();
        fake.behaviour.fail.store(true, Ordering::SeqCst);
        fake
    }

    pub fn calls(&self) -> usize {
        self.behaviour.calls.load(Ordering::SeqCst)
    }
}

impl Summarizer for FakeSummarizer {
    fn summarize<'a>(
        &'a self,
        content: &'a str,
        options: &'a SummaryOptions,
    ) -> BoxFuture<'a, Result<String, CollabError>> {
        Box::pin(async move {
            self.behaviour.enter("summarize").await?;
            Ok(format!("{}: {} lines", options.filename, content.lines().count()))
        })
    }
}

/// Records every notification in arrival order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(AnalysisId, Notification)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<(AnalysisId, Notification)> {
        self.seen.lock().await.clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, id: AnalysisId, notification: Notification) -> BoxFuture<'_, Result<(), CollabError>> {
        Box::pin(async move {
            self.seen.lock().await.push((id, notification));
            Ok(())
        })
    }
}

/// Analysis store that rejects every write.
#[derive(Debug, Default)]
pub struct FailingStore;

impl AnalysisStore for FailingStore {
    fn save<'a>(&'a self, _record: &'a AnalysisRecord) -> BoxFuture<'a, Result<(), CollabError>> {
        Box::pin(async { Err(CollabError::Unavailable("analysis store".into())) })
    }

    fn load(&self, _id: AnalysisId) -> BoxFuture<'_, Result<Option<AnalysisRecord>, CollabError>> {
        Box::pin(async { Err(CollabError::Unavailable("analysis store".into())) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::IndicatorKind;

    #[tokio::test]
    async fn test_fake_extractor_injection() {
        let fake = FakeExtractor::returning(vec![Indicator::new(IndicatorKind::Ipv4, "1.1.1.1", 0.8)]);
        let options = ExtractOptions::default();
        assert_eq!(fake.extract("x", &options).await.unwrap().len(), 1);

        fake.set_failing(true);
        assert!(fake.extract("x", &options).await.is_err());
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_injection() {
        let fake = FakeExtractor::default().with_delay(Duration::from_secs(30));
        let options = ExtractOptions::default();
        let started = tokio::time::Instant::now();
        fake.extract("x", &options).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
