//! Translation pipeline end to end, with mock providers.

use settle::config::Config;
use settle::error::SettleError;
use settle::flight::{StageError, StageResult};
use settle::translate::{
    LanguageCode, MockLanguageIdentifier, MockTranslator, TranslateError, TranslationPipeline,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Translations = Arc<Mutex<Vec<StageResult<String, TranslateError>>>>;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.debounce.quiet_period_ms = 10;
    config.debounce.poll_interval_ms = 2;
    config
}

fn build(identifier: MockLanguageIdentifier, translator: MockTranslator) -> TranslationPipeline {
    TranslationPipeline::new(Arc::new(identifier), Arc::new(translator), &fast_config()).unwrap()
}

fn collect_translations(pipeline: &TranslationPipeline) -> Translations {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    pipeline.subscribe_translations(move |result: &StageResult<String, TranslateError>| {
        sink.lock().unwrap().push(result.clone())
    });
    seen
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn translates_once_text_and_language_settle() {
    let translator = MockTranslator::new().with_installed(&["es", "en"]);
    let pipeline = build(
        MockLanguageIdentifier::new().with_rule("hola", "es"),
        translator.clone(),
    );
    let translations = collect_translations(&pipeline);

    for raw in ["ho", "hol", "hola mundo", "hola mundo", "hola mundo"] {
        pipeline.push_text(raw).unwrap();
    }

    eventually(|| !translations.lock().unwrap().is_empty()).await;
    pipeline.wait_idle().await;

    assert_eq!(
        *translations.lock().unwrap(),
        vec![Ok("[en] hola mundo".to_string())]
    );
    assert_eq!(pipeline.settled_text(), Some("hola mundo".to_string()));
    assert_eq!(pipeline.snapshot().source, Some(LanguageCode::from("es")));
    // Nothing is translated before the source language is known.
    assert_eq!(translator.requests().len(), 1);
    pipeline.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_model_is_downloaded_then_translated() {
    let translator = MockTranslator::new()
        .with_installed(&["es"])
        .with_delay(Duration::from_millis(50));
    let pipeline = build(
        MockLanguageIdentifier::new().with_rule("hola", "es"),
        translator.clone(),
    );
    let translations = collect_translations(&pipeline);
    let flags = Arc::new(Mutex::new(Vec::new()));
    let sink = flags.clone();
    pipeline.subscribe_downloading(move |downloading: &bool| {
        sink.lock().unwrap().push(*downloading)
    });

    pipeline.push_text("hola").unwrap();

    eventually(|| !translations.lock().unwrap().is_empty()).await;
    // The attempt that found the model missing is never reported.
    assert_eq!(
        *translations.lock().unwrap(),
        vec![Ok("[en] hola".to_string())]
    );
    assert_eq!(translator.downloads(), vec![LanguageCode::from("en")]);
    assert!(pipeline.requested_models().contains(&LanguageCode::from("en")));

    eventually(|| flags.lock().unwrap().len() == 2).await;
    assert_eq!(*flags.lock().unwrap(), vec![true, false]);
    assert!(!pipeline.is_downloading());
    pipeline.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_download_is_reported_to_translation_observers() {
    let translator = MockTranslator::new()
        .with_installed(&["es"])
        .with_failing_download("en");
    let pipeline = build(
        MockLanguageIdentifier::new().with_rule("hola", "es"),
        translator.clone(),
    );
    let translations = collect_translations(&pipeline);

    pipeline.push_text("hola").unwrap();
    eventually(|| !translations.lock().unwrap().is_empty()).await;
    pipeline.wait_idle().await;

    assert_eq!(
        *translations.lock().unwrap(),
        vec![Err(StageError::Failed(TranslateError::Download {
            language: "en".into(),
            message: "mock download failure".to_string(),
        }))]
    );
    assert_eq!(translator.downloads(), vec![LanguageCode::from("en")]);
    assert_eq!(translator.requests().len(), 1);
    pipeline.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_still_missing_after_download_is_reported_once() {
    let translator = MockTranslator::new()
        .with_installed(&["es"])
        .with_phantom_download("en");
    let pipeline = build(
        MockLanguageIdentifier::new().with_rule("hola", "es"),
        translator.clone(),
    );
    let translations = collect_translations(&pipeline);

    pipeline.push_text("hola").unwrap();
    eventually(|| !translations.lock().unwrap().is_empty()).await;
    pipeline.wait_idle().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        *translations.lock().unwrap(),
        vec![Err(StageError::Failed(TranslateError::ModelUnavailable {
            language: "en".into(),
        }))]
    );
    // One download, then a single retry.
    assert_eq!(translator.downloads(), vec![LanguageCode::from("en")]);
    assert_eq!(translator.requests().len(), 2);
    assert!(!pipeline.is_translating());
    pipeline.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changing_target_retranslates_settled_text() {
    let pipeline = build(
        MockLanguageIdentifier::new().with_rule("hola", "es"),
        MockTranslator::new().with_installed(&["es", "en", "fr"]),
    );
    let translations = collect_translations(&pipeline);

    pipeline.push_text("hola").unwrap();
    eventually(|| translations.lock().unwrap().len() == 1).await;
    pipeline.wait_idle().await;

    assert!(pipeline.set_target_language("fr".into()));
    assert!(!pipeline.set_target_language("fr".into()));
    eventually(|| translations.lock().unwrap().len() == 2).await;

    assert_eq!(
        translations.lock().unwrap()[1],
        Ok("[fr] hola".to_string())
    );
    pipeline.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undetermined_language_is_ignored() {
    let translator = MockTranslator::new().with_installed(&["en"]);
    let pipeline = build(MockLanguageIdentifier::new(), translator.clone());
    let identified = Arc::new(Mutex::new(Vec::new()));
    let sink = identified.clone();
    pipeline.subscribe_identification(move |result: &StageResult<LanguageCode, TranslateError>| {
        sink.lock().unwrap().push(result.clone())
    });

    pipeline.push_text("???").unwrap();
    eventually(|| !identified.lock().unwrap().is_empty()).await;
    pipeline.wait_idle().await;

    assert_eq!(
        *identified.lock().unwrap(),
        vec![Ok(LanguageCode::from("und"))]
    );
    assert_eq!(pipeline.snapshot().source, None);
    assert!(translator.requests().is_empty());
    pipeline.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identification_failure_is_reported_and_source_kept() {
    let pipeline = build(
        MockLanguageIdentifier::new().with_failure(),
        MockTranslator::new(),
    );
    let identified = Arc::new(Mutex::new(Vec::new()));
    let sink = identified.clone();
    pipeline.subscribe_identification(move |result: &StageResult<LanguageCode, TranslateError>| {
        sink.lock().unwrap().push(result.clone())
    });

    pipeline.push_text("hola").unwrap();
    eventually(|| !identified.lock().unwrap().is_empty()).await;

    assert!(matches!(
        identified.lock().unwrap()[0],
        Err(StageError::Failed(TranslateError::Identification(_)))
    ));
    assert_eq!(pipeline.snapshot().source, None);
    pipeline.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pushes_after_shutdown_are_rejected() {
    let pipeline = build(MockLanguageIdentifier::new(), MockTranslator::new());
    let pusher = pipeline.text_pusher();
    pipeline.shutdown().unwrap();

    assert!(matches!(
        pusher.push("late".to_string()),
        Err(SettleError::TornDown)
    ));
}
