//! In-process backend for tests.
//!
//! Documents are parsed with `scraper` and laid out with a naive block
//! model: every element takes the width of its parent unless it sets one,
//! children stack vertically, and explicit `width`/`height` (inline style in
//! px, or an attribute as on SVG shapes) win. Captures are solid images of
//! the right pixel size. [`MockControl`] injects failures and delays.

use super::{
    BackendError, BackendErrorKind, BackendFactory, BackendResult, CaptureRequest, CaptureTarget,
    ElementInfo, ElementSnapshot, Rect, RenderBackend, RenderSession, Viewport, WorkerId,
};
use crate::config::OutputFormat;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use scraper::{ElementRef, Html};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const LINE_HEIGHT: f64 = 20.0;
const NOT_RENDERED: &[&str] = &["head", "script", "style", "title", "meta", "link", "template"];

struct MockState {
    created: usize,
    fail_next_creates: usize,
    fail_all_creates: bool,
    failing_probes: HashSet<WorkerId>,
    probe_delay: Duration,
    closed: HashSet<WorkerId>,
    load_delay: Duration,
    load_errors: VecDeque<BackendError>,
    network_idle_delay: Duration,
    font_delay: Duration,
    image_delay: Duration,
    capture_script: VecDeque<Option<BackendError>>,
    native_formats: Vec<OutputFormat>,
    open_sessions: usize,
    sessions_opened: usize,
    captures: Vec<CaptureRequest>,
    loaded: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            created: 0,
            fail_next_creates: 0,
            fail_all_creates: false,
            failing_probes: HashSet::new(),
            probe_delay: Duration::ZERO,
            closed: HashSet::new(),
            load_delay: Duration::ZERO,
            load_errors: VecDeque::new(),
            network_idle_delay: Duration::ZERO,
            font_delay: Duration::ZERO,
            image_delay: Duration::ZERO,
            capture_script: VecDeque::new(),
            native_formats: vec![OutputFormat::Png],
            open_sessions: 0,
            sessions_opened: 0,
            captures: Vec::new(),
            loaded: Vec::new(),
        }
    }
}

/// Shared handle to steer and inspect mock backends.
#[derive(Clone, Default)]
pub struct MockControl {
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` instance startups.
    pub fn fail_next_creates(&self, n: usize) {
        self.state().fail_next_creates = n;
    }

    /// Fail every instance startup while set.
    pub fn fail_all_creates(&self, fail: bool) {
        self.state().fail_all_creates = fail;
    }

    /// Make the liveness probe of `id` fail.
    pub fn fail_probe(&self, id: WorkerId) {
        self.state().failing_probes.insert(id);
    }

    /// Delay every liveness probe.
    pub fn set_probe_delay(&self, delay: Duration) {
        self.state().probe_delay = delay;
    }

    /// Fail the next `load` with `error`.
    pub fn fail_next_load(&self, error: BackendError) {
        self.state().load_errors.push_back(error);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.state().load_delay = delay;
    }

    pub fn set_network_idle_delay(&self, delay: Duration) {
        self.state().network_idle_delay = delay;
    }

    pub fn set_font_delay(&self, delay: Duration) {
        self.state().font_delay = delay;
    }

    /// Delay of every embedded image.
    pub fn set_image_delay(&self, delay: Duration) {
        self.state().image_delay = delay;
    }

    /// Outcomes of the next captures, in order. `None` succeeds.
    pub fn script_captures(&self, outcomes: Vec<Option<BackendError>>) {
        self.state().capture_script = outcomes.into();
    }

    /// Formats the backend can encode itself.
    pub fn set_native_formats(&self, formats: Vec<OutputFormat>) {
        self.state().native_formats = formats;
    }

    /// Instances started so far.
    pub fn created(&self) -> usize {
        self.state().created
    }

    pub fn is_closed(&self, id: WorkerId) -> bool {
        self.state().closed.contains(&id)
    }

    /// Sessions currently open across all instances.
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    /// Every capture request seen so far.
    pub fn captures(&self) -> Vec<CaptureRequest> {
        self.state().captures.clone()
    }

    /// Markup of every document loaded so far, as the backend received it.
    pub fn loaded_documents(&self) -> Vec<String> {
        self.state().loaded.clone()
    }
}

/// Factory producing [`MockBackend`]s.
#[derive(Clone, Default)]
pub struct MockFactory {
    control: MockControl,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> MockControl {
        self.control.clone()
    }
}

#[async_trait]
impl BackendFactory for MockFactory {
    async fn create(&self, id: WorkerId) -> BackendResult<Arc<dyn RenderBackend>> {
        let mut state = self.control.state();
        if state.fail_all_creates {
            return Err(BackendError::crashed("mock startup disabled"));
        }
        if state.fail_next_creates > 0 {
            state.fail_next_creates -= 1;
            return Err(BackendError::crashed(format!("mock startup of {} failed", id)));
        }
        state.created += 1;
        Ok(Arc::new(MockBackend {
            id,
            control: self.control.clone(),
        }))
    }
}

/// A fake browser instance.
pub struct MockBackend {
    id: WorkerId,
    control: MockControl,
}

#[async_trait]
impl RenderBackend for MockBackend {
    async fn probe(&self) -> BackendResult<String> {
        let delay = self.control.state().probe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.control.state();
        if state.closed.contains(&self.id) {
            return Err(BackendError::crashed(format!("{} is closed", self.id)));
        }
        if state.failing_probes.contains(&self.id) {
            return Err(BackendError::new(
                BackendErrorKind::Protocol,
                format!("{} did not answer", self.id),
            ));
        }
        Ok("MockBrowser/1.0".to_string())
    }

    async fn open_session(&self, viewport: Viewport) -> BackendResult<Box<dyn RenderSession>> {
        {
            let mut state = self.control.state();
            if state.closed.contains(&self.id) {
                return Err(BackendError::crashed(format!("{} is closed", self.id)));
            }
            state.open_sessions += 1;
            state.sessions_opened += 1;
        }
        Ok(Box::new(MockSession {
            control: self.control.clone(),
            viewport,
            page: Mutex::new(None),
            closed: Mutex::new(false),
        }))
    }

    async fn close(&self) {
        self.control.state().closed.insert(self.id);
    }
}

struct LoadedPage {
    elements: ElementSnapshot,
    height: f64,
    images: usize,
}

struct MockSession {
    control: MockControl,
    viewport: Viewport,
    page: Mutex<Option<LoadedPage>>,
    closed: Mutex<bool>,
}

impl MockSession {
    fn page(&self) -> MutexGuard<'_, Option<LoadedPage>> {
        self.page.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RenderSession for MockSession {
    async fn load(&self, document: &str) -> BackendResult<()> {
        let (delay, error) = {
            let mut state = self.control.state();
            state.loaded.push(document.to_string());
            (state.load_delay, state.load_errors.pop_front())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(error);
        }
        let page = layout_document(document, f64::from(self.viewport.width));
        *self.page() = Some(page);
        Ok(())
    }

    async fn wait_for_network_idle(&self) -> BackendResult<()> {
        let delay = self.control.state().network_idle_delay;
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn wait_for_fonts(&self) -> BackendResult<()> {
        let delay = self.control.state().font_delay;
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn image_count(&self) -> BackendResult<usize> {
        Ok(self.page().as_ref().map_or(0, |p| p.images))
    }

    async fn wait_for_image(&self, _index: usize) -> BackendResult<()> {
        let delay = self.control.state().image_delay;
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn snapshot_elements(&self) -> BackendResult<ElementSnapshot> {
        Ok(self
            .page()
            .as_ref()
            .map(|p| p.elements.clone())
            .unwrap_or_default())
    }

    async fn capture(&self, request: &CaptureRequest) -> BackendResult<Vec<u8>> {
        {
            let mut state = self.control.state();
            state.captures.push(*request);
            if let Some(Some(error)) = state.capture_script.pop_front() {
                return Err(error);
            }
            if !state.native_formats.contains(&request.format) {
                return Err(BackendError::unsupported_format(request.format));
            }
        }

        let page_height = self.page().as_ref().map_or(0.0, |p| p.height);
        let scale = self.viewport.scale;
        let (css_width, css_height) = match request.target {
            CaptureTarget::FullPage => (
                f64::from(self.viewport.width),
                page_height.max(f64::from(self.viewport.height)),
            ),
            CaptureTarget::Viewport => (
                f64::from(self.viewport.width),
                f64::from(self.viewport.height),
            ),
            CaptureTarget::Clip(rect) => (rect.width, rect.height),
        };
        let width = device_pixels(css_width, scale);
        let height = device_pixels(css_height, scale);

        solid_image(width, height, request.transparent, request.format)
    }

    async fn close(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if !*closed {
            *closed = true;
            self.control.state().open_sessions -= 1;
        }
    }
}

fn device_pixels(css: f64, scale: f64) -> u32 {
    (css * scale).round().max(1.0) as u32
}

fn solid_image(
    width: u32,
    height: u32,
    transparent: bool,
    format: OutputFormat,
) -> BackendResult<Vec<u8>> {
    let pixel = if transparent {
        Rgba([0, 0, 0, 0])
    } else {
        Rgba([255, 255, 255, 255])
    };
    let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, pixel));
    let (image, format) = match format {
        OutputFormat::Png => (image, ImageFormat::Png),
        OutputFormat::Jpeg => (DynamicImage::ImageRgb8(image.to_rgb8()), ImageFormat::Jpeg),
        OutputFormat::Webp => (image, ImageFormat::WebP),
    };
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), format)
        .map_err(|e| BackendError::capture(e.to_string()))?;
    Ok(out)
}

fn layout_document(markup: &str, viewport_width: f64) -> LoadedPage {
    let html = Html::parse_document(markup);
    let mut elements = Vec::new();
    let mut images = 0;
    let height = layout(
        html.root_element(),
        None,
        (0.0, 0.0),
        viewport_width,
        &mut elements,
        &mut images,
    );
    LoadedPage {
        elements,
        height,
        images,
    }
}

fn layout(
    element: ElementRef<'_>,
    parent: Option<usize>,
    origin: (f64, f64),
    available_width: f64,
    out: &mut ElementSnapshot,
    images: &mut usize,
) -> f64 {
    let tag = element.value().name().to_ascii_lowercase();
    let rendered = !NOT_RENDERED.contains(&tag.as_str());
    // `<img>`, or `<image>` inside SVG
    if tag == "img" || tag == "image" {
        *images += 1;
    }

    let index = out.len();
    out.push(ElementInfo {
        tag,
        attributes: element
            .value()
            .attrs()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        rect: Rect::default(),
        parent,
        markup: element.html(),
    });
    if !rendered {
        return 0.0;
    }

    let width = dimension(element, "width").unwrap_or(available_width);
    let mut content = 0.0;
    for child in element.children().filter_map(ElementRef::wrap) {
        content += layout(
            child,
            Some(index),
            (origin.0, origin.1 + content),
            width,
            out,
            images,
        );
    }
    let has_text = element
        .children()
        .any(|c| c.value().as_text().is_some_and(|t| !t.trim().is_empty()));
    if content == 0.0 && has_text {
        content = LINE_HEIGHT;
    }
    let height = dimension(element, "height").unwrap_or(content);

    out[index].rect = Rect::new(origin.0, origin.1, width, height);
    height
}

/// Explicit size from inline style or attribute.
fn dimension(element: ElementRef<'_>, name: &str) -> Option<f64> {
    let from_style = element.value().attr("style").and_then(|style| {
        style.split(';').find_map(|decl| {
            let (key, value) = decl.split_once(':')?;
            if key.trim().eq_ignore_ascii_case(name) {
                parse_px(value)
            } else {
                None
            }
        })
    });
    from_style.or_else(|| element.value().attr(name).and_then(parse_px))
}

fn parse_px(value: &str) -> Option<f64> {
    value
        .trim()
        .trim_end_matches("px")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_stacks_sized_blocks() {
        let page = layout_document(
            r#"<html><body>
                <div class="card" style="width: 300px; height: 200px">A</div>
                <div class="card" style="width: 300px; height: 150px">B</div>
            </body></html>"#,
            800.0,
        );
        let cards: Vec<&ElementInfo> = page
            .elements
            .iter()
            .filter(|e| e.attr("class") == Some("card"))
            .collect();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].rect, Rect::new(0.0, 0.0, 300.0, 200.0));
        assert_eq!(cards[1].rect, Rect::new(0.0, 200.0, 300.0, 150.0));
        assert_eq!(page.height, 350.0);
        assert!(page
            .elements
            .iter()
            .enumerate()
            .all(|(i, e)| e.parent.map_or(true, |p| p < i)));
    }

    #[test]
    fn test_layout_reads_svg_attributes() {
        let page = layout_document(
            r#"<svg width="400" height="300"><rect width="120" height="80" fill="url(#p)"/></svg>"#,
            800.0,
        );
        let rect = page.elements.iter().find(|e| e.tag == "rect").unwrap();
        assert_eq!(rect.rect.width, 120.0);
        assert_eq!(rect.rect.height, 80.0);
    }

    #[test]
    fn test_layout_counts_images() {
        let page = layout_document(r#"<p><img src="a.png"><img src="b.png"></p>"#, 800.0);
        assert_eq!(page.images, 2);
    }

    #[test]
    fn test_layout_counts_svg_images() {
        let page = layout_document(
            r#"<svg width="400" height="300">
                <image href="a.png" width="100" height="100"/>
                <g><image href="b.png" width="100" height="100"/></g>
            </svg>
            <img src="c.png">"#,
            800.0,
        );
        assert_eq!(page.images, 3);
    }

    #[test]
    fn test_parse_px() {
        assert_eq!(parse_px(" 12px "), Some(12.0));
        assert_eq!(parse_px("7"), Some(7.0));
        assert_eq!(parse_px("50%"), None);
    }
}
