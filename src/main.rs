use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use amp_scheduler::{
    layout_rect_ltwh, AmpElement, Document, ElementError, HookFuture, LayoutPriority, LayoutRect,
    NodeId, Resources, SchedulerConfig, StaticViewport, Viewport, ViewportChange,
};

const VIEWPORT_WIDTH: f64 = 400.0;
const VIEWPORT_HEIGHT: f64 = 600.0;
const ELEMENT_HEIGHT: f64 = 300.0;

#[derive(Debug, Clone)]
struct AppConfig {
    elements: usize,
    scroll_step: f64,
    config_path: Option<String>,
    log_level: Level,
}

impl AppConfig {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--elements" => {
                    if let Some(value) = args.get(i + 1).and_then(|v| v.parse().ok()) {
                        config.elements = value;
                        i += 1;
                    }
                }
                "--scroll-step" => {
                    if let Some(value) = args.get(i + 1).and_then(|v| v.parse().ok()) {
                        config.scroll_step = value;
                        i += 1;
                    }
                }
                "--config" => {
                    if let Some(path) = args.get(i + 1) {
                        config.config_path = Some(path.clone());
                        i += 1;
                    }
                }
                "--debug" => config.log_level = Level::DEBUG,
                "--trace" => config.log_level = Level::TRACE,
                _ => {}
            }
            i += 1;
        }

        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            elements: 12,
            scroll_step: 450.0,
            config_path: None,
            log_level: Level::INFO,
        }
    }
}

/// A fake element positioned at a fixed document offset whose layout takes
/// a little while.
struct DemoElement {
    page_box: LayoutRect,
    viewport: Arc<StaticViewport>,
    priority: LayoutPriority,
    layout_latency: Duration,
    built: RwLock<bool>,
}

impl DemoElement {
    fn new(page_box: LayoutRect, viewport: Arc<StaticViewport>, priority: LayoutPriority) -> Self {
        Self {
            page_box,
            viewport,
            priority,
            layout_latency: Duration::from_millis(15),
            built: RwLock::new(false),
        }
    }
}

impl AmpElement for DemoElement {
    fn is_upgraded(&self) -> bool {
        true
    }

    fn is_built(&self) -> bool {
        *self.built.read()
    }

    fn build_internal(&self) -> HookFuture {
        *self.built.write() = true;
        async { Ok(()) }.boxed()
    }

    fn bounding_client_rect(&self) -> LayoutRect {
        self.page_box.moved(0.0, -self.viewport.scroll_top())
    }

    fn layout_callback(&self) -> HookFuture {
        let latency = self.layout_latency;
        async move {
            tokio::time::sleep(latency).await;
            Ok::<(), ElementError>(())
        }
        .boxed()
    }

    fn layout_priority(&self) -> LayoutPriority {
        self.priority
    }
}

fn setup_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn load_config(app_config: &AppConfig) -> anyhow::Result<SchedulerConfig> {
    let Some(path) = &app_config.config_path else {
        return Ok(SchedulerConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading scheduler config {path}"))?;
    SchedulerConfig::from_json_str(&json).with_context(|| format!("parsing scheduler config {path}"))
}

/// Builds a single column of elements; every fourth one is an ad.
fn build_page(
    document: &Document,
    viewport: &Arc<StaticViewport>,
    count: usize,
) -> anyhow::Result<Vec<(NodeId, Arc<DemoElement>)>> {
    let mut page = Vec::with_capacity(count);
    for index in 0..count {
        let is_ad = index % 4 == 3;
        let node = document.create_element(if is_ad { "amp-ad" } else { "amp-img" });
        document.append_child(document.body(), node)?;
        let page_box = layout_rect_ltwh(0.0, index as f64 * ELEMENT_HEIGHT, VIEWPORT_WIDTH, ELEMENT_HEIGHT);
        let priority = if is_ad {
            LayoutPriority::Ads
        } else {
            LayoutPriority::Content
        };
        page.push((node, Arc::new(DemoElement::new(page_box, Arc::clone(viewport), priority))));
    }
    Ok(page)
}

async fn run(app_config: AppConfig) -> anyhow::Result<()> {
    let config = load_config(&app_config)?;
    info!(?config, "scheduler config");

    let document = Arc::new(Document::new());
    let viewport = Arc::new(StaticViewport::new(VIEWPORT_WIDTH, VIEWPORT_HEIGHT));
    let resources = Resources::new(
        Arc::clone(&document),
        Arc::clone(&viewport) as Arc<dyn Viewport>,
        config,
    );
    resources.set_error_handler(Some(|err: &amp_scheduler::ResourceError, node: NodeId| {
        warn!(%node, "scheduler error: {err}");
    }));

    for (node, element) in build_page(&document, &viewport, app_config.elements)? {
        let resource = resources.add(node, element)?;
        info!(resource = %resource.debug_id(), "managed");
    }

    let page_height = app_config.elements as f64 * ELEMENT_HEIGHT;
    let start = Instant::now();
    let mut previous_scroll = 0.0;
    loop {
        let now_ms = start.elapsed().as_secs_f64() * 1000.0;
        let summary = resources.do_pass(now_ms).await;
        info!(
            scroll_top = viewport.scroll_top(),
            scheduled = summary.scheduled,
            completed = summary.completed,
            "pass"
        );

        let scroll_top = viewport.scroll_top();
        if scroll_top + VIEWPORT_HEIGHT >= page_height {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let next_scroll = (scroll_top + app_config.scroll_step).min(page_height - VIEWPORT_HEIGHT);
        viewport.set_scroll_top(next_scroll);
        resources.on_viewport_changed(ViewportChange {
            velocity: (next_scroll - previous_scroll) / 50.0,
            relayout_all: false,
        });
        previous_scroll = next_scroll;
    }

    let laid_out = resources
        .resources()
        .iter()
        .filter(|resource| !resource.is_layout_pending())
        .count();
    info!(laid_out, total = resources.len(), elapsed = ?start.elapsed(), "scroll finished");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = AppConfig::from_args();
    setup_logging(app_config.log_level);

    info!("Starting resource scheduler demo");

    tokio::select! {
        result = run(app_config) => result,
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            Ok(())
        }
    }
}
