//! Integration tests for html-to-png-core.
//!
//! Everything here runs against the in-process mock backend. The Chrome
//! tests at the bottom additionally need the `cdp` feature and a Chrome or
//! Chromium binary on `PATH`.
//!
//! Run with: cargo test --package html-to-png-core --test integration_tests

use html_to_png_core::backend::mock::{MockControl, MockFactory};
use html_to_png_core::{
    package, BackendError, ConversionError, ConversionRequest, Converter, ConverterConfig,
    OutputFormat, PoolConfig, RenderOutput, WorkerId, WorkerPool,
};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready};

const CARDS: &str = r#"<!DOCTYPE html>
<html><head><style>.card { margin: 0 }</style></head><body>
  <section class="deck">
    <div class="card" style="width: 240px; height: 160px"><h2>Alpha</h2></div>
    <div class="card" style="width: 240px; height: 160px"><h2>Beta</h2></div>
    <div class="card" style="width: 240px; height: 160px"><h2>Gamma</h2></div>
    <div class="card" style="width: 240px; height: 160px"><h2>Delta</h2></div>
  </section>
  <footer class="card-footer" style="height: 10px">tiny</footer>
</body></html>"#;

fn request(document: &str) -> ConversionRequest {
    ConversionRequest::new(document)
        .with_viewport(320, 240)
        .with_scale(1.0)
}

async fn converter(pool_size: usize) -> (Arc<Converter>, MockControl) {
    let factory = MockFactory::new();
    let control = factory.control();
    let mut config = ConverterConfig::new(pool_size);
    config.encode.encode_threads = 2;
    let converter = Converter::new(config, Arc::new(factory)).await.unwrap();
    (Arc::new(converter), control)
}

async fn pool(pool_size: usize) -> (Arc<WorkerPool>, MockControl) {
    let factory = MockFactory::new();
    let control = factory.control();
    let pool = WorkerPool::new(PoolConfig::with_pool_size(pool_size), Arc::new(factory))
        .await
        .unwrap();
    (Arc::new(pool), control)
}

// ============================================================================
// Pool invariants
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_never_exceeded_under_stress() {
    let (pool, _control) = pool(3).await;
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let holders = Arc::new(Mutex::new(HashSet::<WorkerId>::new()));

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let (pool, in_use, peak, holders) = (
                Arc::clone(&pool),
                Arc::clone(&in_use),
                Arc::clone(&peak),
                Arc::clone(&holders),
            );
            tokio::spawn(async move {
                let worker = pool.acquire_timeout(Duration::from_secs(10)).await.unwrap();
                assert!(
                    holders.lock().unwrap().insert(worker.id()),
                    "{} handed out twice",
                    worker.id()
                );
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(2 + (i % 5))).await;

                in_use.fetch_sub(1, Ordering::SeqCst);
                holders.lock().unwrap().remove(&worker.id());
                if i % 7 == 0 {
                    worker.retire("stress retire").await;
                } else {
                    worker.release().await;
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert!(stats.total <= 3);
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.acquires, 40);
    assert_eq!(stats.acquires, stats.releases + stats.retires);
}

#[tokio::test]
async fn test_acquire_timeout_is_honoured() {
    let (pool, _control) = pool(1).await;
    let held = pool.acquire().await.unwrap();

    let start = Instant::now();
    let err = assert_err!(pool.acquire_timeout(Duration::from_millis(200)).await);
    let elapsed = start.elapsed();

    assert!(matches!(err, ConversionError::AcquireTimeout { .. }));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    assert_eq!(err.status_code(), 503);

    held.release().await;
}

#[tokio::test]
async fn test_acquire_timeout_mid_probe_leaves_pool_intact() {
    let (pool, control) = pool(1).await;
    control.set_probe_delay(Duration::from_millis(200));
    let before = pool.stats();

    let err = assert_err!(pool.acquire_timeout(Duration::from_millis(50)).await);
    assert!(matches!(err, ConversionError::AcquireTimeout { .. }));

    let after = pool.stats();
    assert_eq!((after.total, after.idle), (before.total, before.idle));
    assert_eq!(after.evictions, 0);
    assert_eq!(control.created(), 1);
}

#[tokio::test]
async fn test_waiter_is_woken_by_release() {
    let (pool, _control) = pool(1).await;
    let held = pool.acquire().await.unwrap();

    let mut waiter = tokio_test::task::spawn(pool.acquire_timeout(Duration::from_secs(5)));
    assert_pending!(waiter.poll());

    held.release().await;
    assert!(waiter.is_woken());
    let worker = assert_ready!(waiter.poll()).unwrap();
    worker.release().await;
}

#[tokio::test]
async fn test_unhealthy_worker_never_handed_out() {
    let (pool, control) = pool(3).await;
    control.fail_probe(WorkerId(0));
    control.fail_probe(WorkerId(2));

    let mut seen = Vec::new();
    for _ in 0..3 {
        let worker = pool.acquire().await.unwrap();
        seen.push(worker.id());
        worker.release().await;
    }
    assert!(!seen.contains(&WorkerId(0)));
    assert!(!seen.contains(&WorkerId(2)));
    assert_eq!(pool.stats().evictions, 2);
}

#[tokio::test]
async fn test_health_report_after_eviction() {
    let (pool, control) = pool(2).await;
    control.fail_probe(WorkerId(1));

    let health = pool.health_check().await;
    assert_eq!(health.healthy_count(), 1);
    assert!(!health.is_shutdown);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["instances"][1]["liveness"], "unresponsive");
}

// ============================================================================
// Conversion pipeline
// ============================================================================

#[tokio::test]
async fn test_dimensions_are_reproducible() {
    let (converter, _control) = converter(2).await;
    let document = r#"<div style="height: 700px"><p>tall page</p></div>"#;

    let mut sizes = Vec::new();
    for _ in 0..3 {
        let result = assert_ok!(converter.convert(request(document)).await);
        match result.output {
            RenderOutput::Single(image) => sizes.push((image.width, image.height)),
            RenderOutput::Cards(_) => panic!("Expected single image"),
        }
    }
    assert_eq!(sizes, vec![(320, 700); 3]);
}

#[tokio::test]
async fn test_cards_indexed_in_document_order() {
    let (converter, _control) = converter(1).await;
    let result = converter.convert(request(CARDS).cards()).await.unwrap();
    let RenderOutput::Cards(cards) = &result.output else {
        panic!("Expected cards");
    };

    assert_eq!(cards.len(), 4);
    let indices: Vec<usize> = cards.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    assert!(cards.windows(2).all(|w| w[0].rect.y < w[1].rect.y));
    assert!(cards.iter().all(|c| c.image.width == 240 && c.image.height == 160));
}

#[tokio::test]
async fn test_cards_are_packaged_as_zip() {
    let (converter, _control) = converter(1).await;
    let result = converter.convert(request(CARDS).cards()).await.unwrap();
    let packaged = package(&result).unwrap();

    assert_eq!(packaged.filename, "cards.zip");
    assert_eq!(packaged.header("X-Cards-Count"), Some("4"));
    assert!(packaged.header("X-Processing-Time").is_some());

    let archive = zip::ZipArchive::new(Cursor::new(packaged.body)).unwrap();
    let mut names: Vec<&str> = archive.file_names().collect();
    names.sort();
    assert_eq!(names, vec!["card_1.png", "card_2.png", "card_3.png", "card_4.png"]);
}

#[tokio::test]
async fn test_card_grid_wrapper_yields_each_card() {
    let (converter, _control) = converter(1).await;
    let document = r#"<div class="card-grid" style="width: 300px">
      <div class="card" style="width: 240px; height: 160px">A</div>
      <div class="card" style="width: 240px; height: 160px">B</div>
      <div class="card" style="width: 240px; height: 160px">C</div>
    </div>"#;
    let result = converter.convert(request(document).cards()).await.unwrap();
    let RenderOutput::Cards(cards) = &result.output else {
        panic!("Expected cards");
    };
    assert_eq!(cards.len(), 3);
    assert_eq!(cards.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(cards.iter().all(|c| (c.image.width, c.image.height) == (240, 160)));
}

#[tokio::test]
async fn test_sized_wrapper_yields_each_block() {
    let (converter, _control) = converter(1).await;
    let document = r#"<div style="width: 300px">
      <div style="width: 200px; height: 100px">one</div>
      <div style="width: 200px; height: 100px">two</div>
    </div>"#;
    let result = converter.convert(request(document).cards()).await.unwrap();
    assert_eq!(package(&result).unwrap().header("X-Cards-Count"), Some("2"));
}

#[tokio::test]
async fn test_single_card_is_raw_image() {
    let (converter, _control) = converter(1).await;
    let document = r#"<div class="card" style="width: 200px; height: 90px">only</div>"#;
    let result = converter
        .convert(request(document).cards().with_format(OutputFormat::Webp))
        .await
        .unwrap();
    let packaged = package(&result).unwrap();
    assert_eq!(packaged.filename, "card.webp");
    assert_eq!(packaged.content_type, "image/webp");
    assert_eq!(&packaged.body[0..4], b"RIFF");
}

#[tokio::test]
async fn test_zero_cards_is_a_client_error() {
    let (converter, _control) = converter(1).await;
    let err = assert_err!(converter.convert(request("<p>no cards</p>").cards()).await);
    assert!(matches!(err, ConversionError::NoCardsFound));
    assert_eq!(err.status_code(), 400);

    let stats = converter.stats().pool;
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.acquires, stats.releases + stats.retires);
}

#[tokio::test]
async fn test_invalid_width_rejected_before_acquire() {
    let (converter, control) = converter(1).await;
    let err = assert_err!(
        converter
            .convert(ConversionRequest::new("<p/>").with_viewport(50, 400))
            .await
    );
    assert!(matches!(err, ConversionError::InvalidOptions(_)));
    assert_eq!(converter.stats().pool.acquires, 0);
    assert_eq!(control.sessions_opened(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_conversions_share_small_pool() {
    let (converter, control) = converter(2).await;

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let converter = Arc::clone(&converter);
            tokio::spawn(async move {
                let document = format!(r#"<div style="height: {}px">doc {}</div>"#, 300 + i * 10, i);
                converter.convert(request(&document)).await
            })
        })
        .collect();

    for task in tasks {
        assert_ok!(task.await.unwrap());
    }

    let stats = converter.stats();
    assert_eq!(stats.conversions_succeeded, 5);
    assert_eq!(stats.pool.idle, 2);
    assert_eq!(stats.pool.checked_out, 0);
    assert_eq!(stats.pool.acquires, 5);
    assert_eq!(stats.pool.releases, 5);
    assert_eq!(control.open_sessions(), 0);
}

#[tokio::test]
async fn test_cancelled_conversion_retires_worker() {
    let (converter, control) = converter(1).await;
    control.set_load_delay(Duration::from_secs(5));

    let task = {
        let converter = Arc::clone(&converter);
        tokio::spawn(async move { converter.convert(request("<p>slow</p>")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let stats = converter.stats().pool;
    assert_eq!(stats.retires, 1);
    assert_eq!(stats.acquires, stats.releases + stats.retires);

    control.set_load_delay(Duration::ZERO);
    assert_ok!(converter.convert(request("<p>fast</p>")).await);
}

#[tokio::test]
async fn test_worker_failure_then_recovery() {
    let (converter, control) = converter(1).await;
    control.script_captures(vec![Some(BackendError::new(
        html_to_png_core::BackendErrorKind::OutOfMemory,
        "Out of memory",
    ))]);

    let err = assert_err!(converter.convert(request("<p>big</p>")).await);
    assert!(matches!(err, ConversionError::ResourceExhausted(_)));
    assert_eq!(err.status_code(), 507);
    assert!(control.is_closed(WorkerId(0)));

    assert_ok!(converter.convert(request("<p>small</p>")).await);
    assert_eq!(control.created(), 2);
}

#[tokio::test]
async fn test_request_json_round_trip_through_pipeline() {
    let (converter, _control) = converter(1).await;
    let json = r#"{
        "document": "<div class='card' style='width: 120px; height: 80px'>x</div>",
        "width": 400,
        "height": 300,
        "scale": 2,
        "mode": "cards",
        "format": "jpeg",
        "quality": 70
    }"#;
    let request: ConversionRequest = serde_json::from_str(json).unwrap();
    let result = converter.convert(request).await.unwrap();
    let RenderOutput::Cards(cards) = result.output else {
        panic!("Expected cards");
    };
    assert_eq!(cards.len(), 1);
    assert_eq!((cards[0].image.width, cards[0].image.height), (240, 160));
    assert_eq!(cards[0].image.format, OutputFormat::Jpeg);
}

// ============================================================================
// Chrome
// ============================================================================

#[cfg(feature = "cdp")]
mod chrome {
    use super::*;
    use html_to_png_core::backend::chrome::{ChromeConfig, ChromeFactory};

    fn chrome_available() -> bool {
        ["chromium", "chromium-browser", "google-chrome", "chrome"]
            .iter()
            .any(|name| which::which(name).is_ok())
    }

    macro_rules! require_chrome {
        () => {
            if !chrome_available() {
                eprintln!("Skipping test: Chrome not found");
                return;
            }
        };
    }

    #[tokio::test]
    async fn test_chrome_renders_cards() {
        require_chrome!();

        let factory = ChromeFactory::new(ChromeConfig::default()).unwrap();
        let converter = Converter::new(ConverterConfig::new(1), Arc::new(factory))
            .await
            .unwrap();

        let result = converter.convert(request(CARDS).cards()).await.unwrap();
        assert_eq!(result.image_count(), 4);

        let health = converter.health().await;
        assert_eq!(health.healthy_count(), 1);
        converter.shutdown().await;
    }
}
