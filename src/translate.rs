//! Live translation pipeline.
//!
//! Wires the pieces together the way a camera translation screen needs
//! them:
//!
//! ```text
//!  OCR text ─push─▶ [text store] ─settled─┬────────────────────┐
//!                                         ▼                    ▼
//!                                   [identify stage]      Composer{text, source, target}
//!                                         │ language           ▲        │
//!                                         └──────────────────-─┘        ▼
//!  target selection ─────────────────────────────────────────▶  [translate stage] ─▶ observers
//!                                                                       │ model missing
//!                                                                       ▼
//!                          [downloading store] ◀─ true/false ─ [downloads, keyed by language]
//! ```
//!
//! Identification results of [`UNDETERMINED_LANGUAGE`](crate::defaults::UNDETERMINED_LANGUAGE)
//! are ignored. A translation that finds a model missing waits for that
//! model's download and then tries once more. A failed download is reported
//! to translation observers as [`TranslateError::Download`].

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::debounce::{DebouncedStore, HandleOptions, StoreHandle, StorePusher};
use crate::error::Result;
use crate::flight::{
    Admission, Failure, FlightOptions, FlightPhase, KeyedResult, KeyedSingleFlight, SingleFlight,
    StageError, StageResult, operation_fn,
};
use crate::observer::SubscriptionId;
use crate::pipeline::{Composer, LogReporter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// A BCP-47 style language code such as `en` or `zh-Hant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the code identification returns when it cannot decide.
    pub fn is_undetermined(&self) -> bool {
        self.0 == crate::defaults::UNDETERMINED_LANGUAGE
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LanguageCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// Everything a translation call needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranslationRequest {
    pub text: String,
    pub source: LanguageCode,
    pub target: LanguageCode,
}

/// Errors reported by translation providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("No translation model installed for {language}")]
    ModelUnavailable { language: LanguageCode },

    #[error("Language identification failed: {0}")]
    Identification(String),

    #[error("Model download failed for {language}: {message}")]
    Download {
        language: LanguageCode,
        message: String,
    },

    #[error("Translation failed: {0}")]
    Translation(String),
}

/// Detects the language of a piece of text.
#[async_trait]
pub trait LanguageIdentifier: Send + Sync {
    async fn identify(
        &self,
        text: &str,
    ) -> std::result::Result<LanguageCode, Failure<TranslateError>>;
}

/// Translates text and manages the models it needs.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translates `request.text`.
    ///
    /// Fails with [`TranslateError::ModelUnavailable`] when a model for one
    /// of the two languages is not installed yet.
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> std::result::Result<String, Failure<TranslateError>>;

    /// Installs the model for `language`.
    async fn download_model(
        &self,
        language: &LanguageCode,
    ) -> std::result::Result<(), Failure<TranslateError>>;
}

/// The inputs a translation is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationSnapshot {
    pub text: Option<String>,
    pub source: Option<LanguageCode>,
    pub target: Option<LanguageCode>,
}

impl TranslationSnapshot {
    /// The request for this snapshot, once text and both languages are known.
    pub fn request(&self) -> Option<TranslationRequest> {
        let text = self.text.as_ref().filter(|t| !t.trim().is_empty())?;
        Some(TranslationRequest {
            text: text.clone(),
            source: self.source.clone()?,
            target: self.target.clone()?,
        })
    }
}

/// Tracks running downloads and mirrors "any download running" into the
/// downloading store.
struct DownloadTracker {
    active: Mutex<usize>,
    flag: StorePusher<bool>,
}

impl DownloadTracker {
    fn begin(self: &Arc<Self>) -> DownloadGuard {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active += 1;
        if *active == 1 {
            self.publish(true);
        }
        DownloadGuard {
            tracker: Arc::clone(self),
        }
    }

    fn publish(&self, downloading: bool) {
        match self.flag.try_push(downloading) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(downloading, "downloading flag channel full"),
            Err(e) => tracing::debug!(downloading, error = %e, "downloading flag not delivered"),
        }
    }
}

/// Decrements on drop, so aborted, timed out and panicking downloads are
/// counted as finished.
struct DownloadGuard {
    tracker: Arc<DownloadTracker>,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        let mut active = self
            .tracker
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.tracker.publish(false);
        }
    }
}

type Downloads = KeyedSingleFlight<LanguageCode, LanguageCode, (), TranslateError>;

/// Translates `request`, downloading missing models on the way.
///
/// Each language is downloaded at most once per request, so a provider that
/// keeps reporting a model missing after installing it ends with
/// [`TranslateError::ModelUnavailable`] instead of looping.
async fn translate_with_models(
    translator: &dyn Translator,
    downloads: &Downloads,
    request: &TranslationRequest,
) -> std::result::Result<String, Failure<TranslateError>> {
    let mut attempted = HashSet::new();
    loop {
        let language = match translator.translate(request).await {
            Err(Failure::Failed(TranslateError::ModelUnavailable { language }))
                if !attempted.contains(&language) =>
            {
                language
            }
            other => return other,
        };
        tracing::debug!(%language, "model missing, waiting for download");
        attempted.insert(language.clone());
        match downloads.request_and_wait(language.clone(), language.clone()).await {
            Some(Ok(())) => {}
            Some(Err(StageError::Failed(error))) => return Err(Failure::Failed(error)),
            Some(Err(other)) => {
                return Err(Failure::Failed(TranslateError::Download {
                    language,
                    message: other.to_string(),
                }));
            }
            // Downloads were released or torn down; nobody is left to tell.
            None => return Err(Failure::Superseded),
        }
    }
}

/// Debounced text in, translations out.
pub struct TranslationPipeline {
    text: StoreHandle<String>,
    downloading: StoreHandle<bool>,
    composer: Composer<TranslationSnapshot>,
    identify: SingleFlight<String, LanguageCode, TranslateError>,
    translate: SingleFlight<TranslationRequest, String, TranslateError>,
    downloads: Downloads,
}

impl TranslationPipeline {
    /// Builds the pipeline on the current tokio runtime.
    pub fn new(
        identifier: Arc<dyn LanguageIdentifier>,
        translator: Arc<dyn Translator>,
        config: &Config,
    ) -> Result<Self> {
        Self::with_clock(identifier, translator, config, Arc::new(SystemClock))
    }

    /// Builds the pipeline with a custom clock for the two stores.
    pub fn with_clock(
        identifier: Arc<dyn LanguageIdentifier>,
        translator: Arc<dyn Translator>,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let handle_options = HandleOptions::from_config(&config.debounce);
        let flight_options = FlightOptions::from_config(&config.stage);

        let text = StoreHandle::spawn_with(
            DebouncedStore::from_config(&config.debounce)?
                .with_clock(Arc::clone(&clock))
                .with_name("source-text"),
            handle_options.clone(),
            Arc::new(LogReporter),
        );
        let downloading = StoreHandle::spawn_with(
            DebouncedStore::from_config(&config.debounce)?
                .with_clock(clock)
                .with_name("downloading")
                .with_initial(false),
            handle_options,
            Arc::new(LogReporter),
        );

        let tracker = Arc::new(DownloadTracker {
            active: Mutex::new(0),
            flag: downloading.pusher(),
        });
        let downloader = Arc::clone(&translator);
        // Downloads are never coalesced away or cut short by the stage timeout.
        let downloads: Downloads = KeyedSingleFlight::new(
            "download",
            operation_fn(move |language: LanguageCode| {
                let translator = Arc::clone(&downloader);
                let tracker = Arc::clone(&tracker);
                async move {
                    let _guard = tracker.begin();
                    tracing::info!(%language, "downloading translation model");
                    translator.download_model(&language).await
                }
            }),
            FlightOptions::default(),
        )?;

        let identify = SingleFlight::with_options(
            "identify",
            operation_fn(move |text: String| {
                let identifier = Arc::clone(&identifier);
                async move { identifier.identify(&text).await }
            }),
            flight_options.clone(),
        )?;

        let missing_models = downloads.clone();
        let translate = SingleFlight::with_options(
            "translate",
            operation_fn(move |request: TranslationRequest| {
                let translator = Arc::clone(&translator);
                let downloads = missing_models.clone();
                async move {
                    translate_with_models(translator.as_ref(), &downloads, &request).await
                }
            }),
            flight_options,
        )?;

        let composer = Composer::new(
            "translation",
            TranslationSnapshot {
                target: Some(LanguageCode::new(crate::defaults::DEFAULT_TARGET_LANGUAGE)),
                ..TranslationSnapshot::default()
            },
        );
        composer.bind_store(&text, |snapshot: &mut TranslationSnapshot, text: &String| {
            snapshot.text = Some(text.clone());
        });
        composer.feed_stage_results(&identify, |snapshot, result| {
            if let Ok(language) = result
                && !language.is_undetermined()
            {
                snapshot.source = Some(language.clone());
            }
        });
        composer.bind_stage(&translate, TranslationSnapshot::request);

        let identify_trigger = identify.clone();
        text.subscribe(move |text: &String| {
            if text.trim().is_empty() {
                return;
            }
            let admission = identify_trigger.request(text.clone());
            tracing::trace!(?admission, "identification requested");
        });

        downloads.subscribe(|(language, result): &KeyedResult<LanguageCode, (), TranslateError>| {
            match result {
                Ok(()) => tracing::info!(%language, "model ready"),
                Err(e) => tracing::warn!(%language, error = %e, "model download failed"),
            }
        });

        Ok(Self {
            text,
            downloading,
            composer,
            identify,
            translate,
            downloads,
        })
    }

    /// Feeds one raw OCR observation.
    pub fn push_text(&self, raw: impl Into<String>) -> Result<()> {
        self.text.push(raw.into())
    }

    /// A cloneable producer for camera/analyzer threads.
    pub fn text_pusher(&self) -> StorePusher<String> {
        self.text.pusher()
    }

    /// Selects the target language. Returns `true` if it changed.
    pub fn set_target_language(&self, language: LanguageCode) -> bool {
        self.composer.set(|snapshot| snapshot.target = Some(language))
    }

    /// Downloads the model for `language` ahead of time.
    pub fn download_model(&self, language: LanguageCode) -> Admission {
        self.downloads.request(language.clone(), language)
    }

    pub fn subscribe_translations<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&StageResult<String, TranslateError>) + Send + Sync + 'static,
    {
        self.translate.subscribe(observer)
    }

    pub fn subscribe_identification<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&StageResult<LanguageCode, TranslateError>) + Send + Sync + 'static,
    {
        self.identify.subscribe(observer)
    }

    /// Observes the debounced "a model download is running" flag.
    pub fn subscribe_downloading<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.downloading.subscribe(observer)
    }

    pub fn subscribe_downloads<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&KeyedResult<LanguageCode, (), TranslateError>) + Send + Sync + 'static,
    {
        self.downloads.subscribe(observer)
    }

    pub fn snapshot(&self) -> TranslationSnapshot {
        self.composer.snapshot()
    }

    /// The settled source text.
    pub fn settled_text(&self) -> Option<String> {
        self.text.current()
    }

    /// The settled downloading flag.
    pub fn is_downloading(&self) -> bool {
        self.downloading.current().unwrap_or(false)
    }

    pub fn is_translating(&self) -> bool {
        self.translate.phase() != FlightPhase::Idle
    }

    /// Languages that have had a download requested and not been released.
    pub fn requested_models(&self) -> HashSet<LanguageCode> {
        self.downloads.keys().into_iter().collect()
    }

    /// Forgets the download stage for `language`, aborting it if running.
    pub fn release_model(&self, language: &LanguageCode) -> bool {
        self.downloads.release(language)
    }

    /// Resolves once identification, translation and downloads are all idle.
    ///
    /// Text still waiting to settle is not covered.
    pub async fn wait_idle(&self) {
        loop {
            self.identify.wait_idle().await;
            self.translate.wait_idle().await;
            self.downloads.wait_all_idle().await;
            if self.identify.phase() == FlightPhase::Idle
                && self.translate.phase() == FlightPhase::Idle
                && self.downloads.is_idle()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Tears everything down; no observer runs after this returns.
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        // Stages and the composer hold each other; teardown breaks the cycle.
        self.composer.teardown();
        self.identify.teardown();
        self.translate.teardown();
        self.downloads.teardown();
        let text = self.text.stop();
        let downloading = self.downloading.stop();
        text.and(downloading)
    }
}

impl Drop for TranslationPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "translation pipeline did not stop cleanly");
        }
    }
}

/// Language identifier for tests: answers from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct MockLanguageIdentifier {
    rules: Vec<(String, LanguageCode)>,
    fallback: Option<LanguageCode>,
    should_fail: bool,
}

impl MockLanguageIdentifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text containing `needle` is identified as `language`.
    pub fn with_rule(mut self, needle: &str, language: &str) -> Self {
        self.rules.push((needle.to_string(), LanguageCode::new(language)));
        self
    }

    /// Language for text no rule matches; `und` when unset.
    pub fn with_fallback(mut self, language: &str) -> Self {
        self.fallback = Some(LanguageCode::new(language));
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

#[async_trait]
impl LanguageIdentifier for MockLanguageIdentifier {
    async fn identify(
        &self,
        text: &str,
    ) -> std::result::Result<LanguageCode, Failure<TranslateError>> {
        if self.should_fail {
            return Err(TranslateError::Identification("mock failure".to_string()).into());
        }
        let language = self
            .rules
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, language)| language.clone())
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| LanguageCode::new(crate::defaults::UNDETERMINED_LANGUAGE));
        Ok(language)
    }
}

/// Translator for tests: prefixes the text with the target language.
#[derive(Debug, Clone)]
pub struct MockTranslator {
    installed: Arc<Mutex<HashSet<LanguageCode>>>,
    failing_downloads: HashSet<LanguageCode>,
    phantom_downloads: HashSet<LanguageCode>,
    delay: Duration,
    requests: Arc<Mutex<Vec<TranslationRequest>>>,
    downloads: Arc<Mutex<Vec<LanguageCode>>>,
}

impl Default for MockTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTranslator {
    pub fn new() -> Self {
        Self {
            installed: Arc::new(Mutex::new(HashSet::new())),
            failing_downloads: HashSet::new(),
            phantom_downloads: HashSet::new(),
            delay: Duration::ZERO,
            requests: Arc::new(Mutex::new(Vec::new())),
            downloads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Marks the models for `languages` as already installed.
    pub fn with_installed(self, languages: &[&str]) -> Self {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(languages.iter().map(|code| LanguageCode::new(*code)));
        self
    }

    pub fn with_failing_download(mut self, language: &str) -> Self {
        self.failing_downloads.insert(LanguageCode::new(language));
        self
    }

    /// Downloads of `language` report success but never install the model.
    pub fn with_phantom_download(mut self, language: &str) -> Self {
        self.phantom_downloads.insert(LanguageCode::new(language));
        self
    }

    /// Makes translations and downloads take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Translation requests seen so far.
    pub fn requests(&self) -> Vec<TranslationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Languages downloaded so far.
    pub fn downloads(&self) -> Vec<LanguageCode> {
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_installed(&self, language: &LanguageCode) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(language)
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> std::result::Result<String, Failure<TranslateError>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        for language in [&request.source, &request.target] {
            if !self.is_installed(language) {
                return Err(TranslateError::ModelUnavailable {
                    language: language.clone(),
                }
                .into());
            }
        }
        Ok(format!("[{}] {}", request.target, request.text))
    }

    async fn download_model(
        &self,
        language: &LanguageCode,
    ) -> std::result::Result<(), Failure<TranslateError>> {
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(language.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing_downloads.contains(language) {
            return Err(TranslateError::Download {
                language: language.clone(),
                message: "mock download failure".to_string(),
            }
            .into());
        }
        if !self.phantom_downloads.contains(language) {
            self.installed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(language.clone());
        }
        Ok(())
    }
}
