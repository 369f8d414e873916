//! Bridge facade: the command/query surface consumed by the HTTP/SSE layer.
//!
//! The HTTP server itself lives outside this crate; everything it needs is
//! here as plain async calls so the transport stays a thin shell.

use futures::stream::Stream;
use futures::StreamExt;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::adapters::hqp::{HqpAdapter, PipelineView};
use crate::adapters::hqp_discovery::DiscoveredDsp;
use crate::adapters::lms::LmsAdapter;
use crate::adapters::traits::ControlAction;
use crate::aggregator::ZoneAggregator;
use crate::bus::{Event, ImageData, NowPlaying, SharedBus, Zone};
use crate::coordinator::AdapterCoordinator;
use crate::error::{BridgeError, Result};

/// Everything the external surface needs, bundled once at startup.
#[derive(Clone)]
pub struct Bridge {
    pub bus: SharedBus,
    pub aggregator: Arc<ZoneAggregator>,
    pub coordinator: Arc<AdapterCoordinator>,
    pub hqp: Arc<HqpAdapter>,
    pub lms: Arc<LmsAdapter>,
    http: reqwest::Client,
}

impl Bridge {
    pub fn new(
        bus: SharedBus,
        aggregator: Arc<ZoneAggregator>,
        coordinator: Arc<AdapterCoordinator>,
        hqp: Arc<HqpAdapter>,
        lms: Arc<LmsAdapter>,
    ) -> Self {
        Self {
            bus,
            aggregator,
            coordinator,
            hqp,
            lms,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// All zones currently known to the aggregator.
    pub async fn zones(&self) -> Vec<Zone> {
        self.aggregator.list_zones().await
    }

    pub async fn zone(&self, zone_id: &str) -> Result<Zone> {
        self.aggregator
            .get_zone(zone_id)
            .await
            .ok_or_else(|| BridgeError::NotFound(zone_id.to_string()))
    }

    /// Now-playing for a zone, derived on demand from the owning adapter.
    pub async fn now_playing(&self, zone_id: &str) -> Result<NowPlaying> {
        self.coordinator.now_playing(zone_id).await
    }

    /// Route a control action (`play_pause`, `vol_rel`, `seek`, ...) to the
    /// adapter owning the zone.
    pub async fn control(&self, zone_id: &str, action: &str, value: Option<f64>) -> Result<()> {
        let action: ControlAction = action.parse()?;
        if action.needs_value() && value.is_none() {
            return Err(BridgeError::Unsupported("action requires a value"));
        }
        self.coordinator.control(zone_id, action, value).await
    }

    /// Fetch artwork. Absolute URLs are fetched directly (with the owning
    /// adapter's basic auth, when configured); backend-specific keys are
    /// delegated to the adapter identified by the zone prefix.
    pub async fn get_image(&self, image_key: &str, zone_id: &str) -> Result<ImageData> {
        if image_key.starts_with("http://") || image_key.starts_with("https://") {
            return self.fetch_image_url(image_key, zone_id).await;
        }
        self.coordinator.get_image(zone_id, image_key).await
    }

    async fn fetch_image_url(&self, url: &str, zone_id: &str) -> Result<ImageData> {
        let mut request = self.http.get(url);

        let prefix = zone_id.split(':').next().unwrap_or("");
        if let Some(adapter) = self.coordinator.adapter(prefix).await {
            if let Some((user, pass)) = adapter.basic_auth() {
                request = request.basic_auth(user, Some(pass));
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::NotFound(format!("image {url}")));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let data = response.bytes().await?.to_vec();
        Ok(ImageData { content_type, data })
    }

    /// Domain-named DSP pipeline view.
    pub async fn pipeline(&self) -> Result<PipelineView> {
        self.hqp.pipeline().await
    }

    /// Set one pipeline setting by domain name (or Hz for `samplerate`).
    pub async fn set_pipeline(&self, setting: &str, value: &str) -> Result<()> {
        self.hqp.set_pipeline(setting, value).await
    }

    /// Sweep the local network for DSP instances via the multicast probe.
    pub async fn discover_dsp(&self) -> Result<Vec<DiscoveredDsp>> {
        crate::adapters::hqp_discovery::discover(None).await
    }

    /// Async stream of bus events, one JSON-ready value per event. The
    /// stream yields `ShuttingDown` and then terminates.
    pub fn subscribe_events(&self) -> impl Stream<Item = Event> + Send + 'static {
        let rx = self.bus.subscribe();
        let mut done = false;
        BroadcastStream::new(rx)
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(e) => {
                        debug!("event stream lagged: {e}");
                        None
                    }
                }
            })
            .take_while(move |event| {
                let keep = !done;
                if matches!(event, Event::ShuttingDown) {
                    done = true;
                }
                futures::future::ready(keep)
            })
    }
}
