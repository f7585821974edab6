//! Headless Chrome backend over the DevTools protocol.
//!
//! `headless_chrome` is synchronous, so every protocol call runs on the
//! blocking thread pool. Each instance gets its own throwaway profile
//! directory.

use super::{
    BackendError, BackendErrorKind, BackendFactory, BackendResult, CaptureRequest, CaptureTarget,
    ElementSnapshot, RenderBackend, RenderSession, Viewport, WorkerId,
};
use crate::config::OutputFormat;
use crate::error::{ConversionError, Result};
use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::{Emulation, Page, DOM};
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const BINARY_NAMES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

/// Number of settled polls before the network counts as idle.
const QUIET_POLLS: u32 = 5;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Launch settings for Chrome instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromeConfig {
    /// Browser binary. Searched on `PATH` when unset.
    pub executable: Option<PathBuf>,
    /// Run with the Chrome sandbox. Containers usually need it off.
    /// Default: false.
    pub sandbox: bool,
    /// Extra command line switches.
    pub extra_args: Vec<String>,
    /// Close the browser after this long without protocol traffic.
    /// Default: 10 minutes.
    pub idle_timeout: Duration,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            executable: None,
            sandbox: false,
            extra_args: vec![
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--font-render-hinting=none".to_string(),
            ],
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Starts headless Chrome processes.
#[derive(Debug, Clone)]
pub struct ChromeFactory {
    config: ChromeConfig,
    executable: Option<PathBuf>,
}

impl ChromeFactory {
    pub fn new(config: ChromeConfig) -> Result<Self> {
        let executable = match &config.executable {
            Some(path) if !path.exists() => {
                return Err(ConversionError::InvalidConfig(format!(
                    "Chrome executable {:?} does not exist",
                    path
                )))
            }
            Some(path) => Some(path.clone()),
            None => BINARY_NAMES.iter().find_map(|name| which::which(name).ok()),
        };

        match &executable {
            Some(path) => info!("Using Chrome at {:?}", path),
            None => warn!("No Chrome binary on PATH, relying on headless_chrome discovery"),
        }

        Ok(Self { config, executable })
    }
}

#[async_trait]
impl BackendFactory for ChromeFactory {
    async fn create(&self, id: WorkerId) -> BackendResult<Arc<dyn RenderBackend>> {
        let config = self.config.clone();
        let executable = self.executable.clone();

        let backend = blocking(move || {
            let profile = tempfile::Builder::new()
                .prefix("html-to-png-")
                .tempdir()?;
            let args: Vec<&OsStr> = config.extra_args.iter().map(OsStr::new).collect();
            let options = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(config.sandbox)
                .path(executable)
                .user_data_dir(Some(profile.path().to_path_buf()))
                .idle_browser_timeout(config.idle_timeout)
                .args(args)
                .build()
                .map_err(|e| anyhow::anyhow!("invalid launch options: {}", e))?;
            let browser = Browser::new(options)?;
            Ok(ChromeBackend {
                id,
                browser: Mutex::new(Some(browser)),
                _profile: profile,
            })
        })
        .await?;

        debug!("Launched Chrome for {}", id);
        Ok(Arc::new(backend))
    }
}

/// One Chrome process.
pub struct ChromeBackend {
    id: WorkerId,
    browser: Mutex<Option<Browser>>,
    _profile: TempDir,
}

impl ChromeBackend {
    fn browser(&self) -> BackendResult<Browser> {
        self.browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BackendError::crashed(format!("{} is closed", self.id)))
    }
}

#[async_trait]
impl RenderBackend for ChromeBackend {
    async fn probe(&self) -> BackendResult<String> {
        let browser = self.browser()?;
        blocking(move || Ok(browser.get_version()?.product)).await
    }

    async fn open_session(&self, viewport: Viewport) -> BackendResult<Box<dyn RenderSession>> {
        let browser = self.browser()?;
        let tab = blocking(move || {
            let tab = browser.new_tab()?;
            tab.set_bounds(Bounds::Normal {
                left: Some(0),
                top: Some(0),
                width: Some(f64::from(viewport.width)),
                height: Some(f64::from(viewport.height)),
            })?;
            Ok(tab)
        })
        .await?;
        Ok(Box::new(ChromeSession { tab, viewport }))
    }

    async fn close(&self) {
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(browser) = browser {
            // Dropping the last handle kills the process.
            if let Err(e) = tokio::task::spawn_blocking(move || drop(browser)).await {
                warn!("Failed to stop Chrome for {}: {}", self.id, e);
            }
            debug!("Closed Chrome for {}", self.id);
        }
    }
}

struct ChromeSession {
    tab: Arc<Tab>,
    viewport: Viewport,
}

impl ChromeSession {
    async fn evaluate(
        &self,
        expression: String,
        await_promise: bool,
    ) -> BackendResult<serde_json::Value> {
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            let result = tab.evaluate(&expression, await_promise)?;
            Ok(result.value.unwrap_or(serde_json::Value::Null))
        })
        .await
    }
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn load(&self, document: &str) -> BackendResult<()> {
        let tab = Arc::clone(&self.tab);
        let markup = serde_json::to_string(document)
            .map_err(|e| BackendError::new(BackendErrorKind::Navigation, e.to_string()))?;
        blocking(move || {
            tab.navigate_to("about:blank")?.wait_until_navigated()?;
            tab.evaluate(
                &format!("document.open(); document.write({}); document.close();", markup),
                false,
            )?;
            Ok(())
        })
        .await
    }

    async fn wait_for_network_idle(&self) -> BackendResult<()> {
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            let script = "JSON.stringify([document.readyState, performance.getEntriesByType('resource').length])";
            let mut last = String::new();
            let mut quiet = 0;
            let started = Instant::now();
            while quiet < QUIET_POLLS {
                let state = tab
                    .evaluate(script, false)?
                    .value
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                if state == last && state.contains("complete") {
                    quiet += 1;
                } else {
                    quiet = 0;
                    last = state;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            debug!("Network idle after {:?}", started.elapsed());
            Ok(())
        })
        .await
    }

    async fn wait_for_fonts(&self) -> BackendResult<()> {
        self.evaluate("document.fonts.ready.then(() => true)".to_string(), true)
            .await
            .map(|_| ())
    }

    async fn image_count(&self) -> BackendResult<usize> {
        let script = format!("document.querySelectorAll('{}').length", IMAGE_SELECTOR);
        let value = self.evaluate(script, false).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn wait_for_image(&self, index: usize) -> BackendResult<()> {
        // SVG `<image>` has no `complete`; its href is fetched through a
        // detached `Image` instead.
        let script = format!(
            "(() => {{ const el = document.querySelectorAll('{selector}')[{index}]; \
             if (!el) return true; \
             const settle = img => new Promise(r => {{ \
                 img.addEventListener('load', () => r(true)); \
                 img.addEventListener('error', () => r(true)); }}); \
             if (el instanceof HTMLImageElement) return el.complete ? true : settle(el); \
             const href = el.getAttribute('href') || el.getAttribute('xlink:href'); \
             if (!href) return true; \
             const img = new Image(); const done = settle(img); img.src = href; \
             return done; }})()",
            selector = IMAGE_SELECTOR,
            index = index
        );
        self.evaluate(script, true).await.map(|_| ())
    }

    async fn snapshot_elements(&self) -> BackendResult<ElementSnapshot> {
        let value = self.evaluate(SNAPSHOT_SCRIPT.to_string(), false).await?;
        let json = value.as_str().unwrap_or("[]");
        serde_json::from_str(json).map_err(|e| {
            BackendError::new(
                BackendErrorKind::Protocol,
                format!("malformed element snapshot: {}", e),
            )
        })
    }

    async fn capture(&self, request: &CaptureRequest) -> BackendResult<Vec<u8>> {
        let tab = Arc::clone(&self.tab);
        let viewport = self.viewport;
        let request = *request;

        blocking(move || {
            if request.transparent {
                tab.call_method(Emulation::SetDefaultBackgroundColorOverride {
                    color: Some(DOM::RGBA {
                        r: 0,
                        g: 0,
                        b: 0,
                        a: Some(0.0),
                    }),
                })?;
            }

            let clip = match request.target {
                CaptureTarget::Clip(rect) => Page::Viewport {
                    x: rect.x,
                    y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    scale: viewport.scale,
                },
                CaptureTarget::Viewport => Page::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: f64::from(viewport.width),
                    height: f64::from(viewport.height),
                    scale: viewport.scale,
                },
                CaptureTarget::FullPage => {
                    let height = tab
                        .evaluate("document.documentElement.scrollHeight", false)?
                        .value
                        .and_then(|v| v.as_f64())
                        .unwrap_or(f64::from(viewport.height))
                        .max(f64::from(viewport.height));
                    tab.set_bounds(Bounds::Normal {
                        left: Some(0),
                        top: Some(0),
                        width: Some(f64::from(viewport.width)),
                        height: Some(height),
                    })?;
                    Page::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: f64::from(viewport.width),
                        height,
                        scale: viewport.scale,
                    }
                }
            };

            let format = match request.format {
                OutputFormat::Png => Page::CaptureScreenshotFormatOption::Png,
                OutputFormat::Jpeg => Page::CaptureScreenshotFormatOption::Jpeg,
                OutputFormat::Webp => Page::CaptureScreenshotFormatOption::Webp,
            };
            let quality = request.quality.map(u32::from);
            Ok(tab.capture_screenshot(format, quality, Some(clip), true)?)
        })
        .await
    }

    async fn close(&self) {
        let tab = Arc::clone(&self.tab);
        if let Err(e) = blocking(move || Ok(tab.close(true)?)).await {
            debug!("Closing tab failed: {}", e);
        }
    }
}

/// Run a blocking protocol call and classify its failure.
async fn blocking<T, F>(call: F) -> BackendResult<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| BackendError::crashed(format!("protocol task failed: {}", e)))?
        .map_err(|e| BackendError::classify(format!("{:#}", e)))
}

/// Serializes every element with its document-relative box and the index
/// of its closest element ancestor.
/// HTML images and SVG `<image>` elements.
const IMAGE_SELECTOR: &str = "img, image";

const SNAPSHOT_SCRIPT: &str = r#"
(() => {
  const all = Array.from(document.querySelectorAll('*'));
  const index = new Map(all.map((el, i) => [el, i]));
  const sx = window.scrollX, sy = window.scrollY;
  return JSON.stringify(all.map(el => {
    const r = el.getBoundingClientRect();
    const attributes = {};
    for (const a of el.attributes) attributes[a.name.toLowerCase()] = a.value;
    const parent = el.parentElement ? index.get(el.parentElement) : undefined;
    return {
      tag: el.tagName.toLowerCase(),
      attributes,
      rect: { x: r.left + sx, y: r.top + sy, width: r.width, height: r.height },
      parent: parent === undefined ? null : parent,
      markup: el.outerHTML,
    };
  }));
})()
"#;
