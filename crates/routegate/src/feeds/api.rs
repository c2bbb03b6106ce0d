use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use router_core::drain::DrainWatcher;
use router_core::prelude::*;
use serde::Deserialize;

use crate::feeds::{Backoff, apply_registration};
use crate::registry::Registry;
use crate::telemetry::metrics::{FeedSource, Metrics, MutationKind};
use crate::types::{RegistrationMessage, RouterGroup};

#[derive(Debug, Clone)]
pub struct ApiConfig {
	/// Base URL of the routing API, e.g. `http://routing-api.service:3000`.
	pub url: String,
}

/// One SSE event from the routing API: the registration model plus an action.
#[derive(Debug, Deserialize)]
struct ApiRouteEvent {
	action: ApiAction,
	route: RegistrationMessage,
}

#[derive(Debug, Clone, Copy, Deserialize)]
enum ApiAction {
	Upsert,
	Delete,
}

/// REST-polled registration feed: long-polls the routing API's SSE event
/// stream and refreshes router groups on every (re)connect.
pub struct ApiFeed {
	cfg: ApiConfig,
	registry: Arc<Registry>,
	metrics: Arc<Metrics>,
	client: reqwest::Client,
}

impl ApiFeed {
	pub fn new(cfg: ApiConfig, registry: Arc<Registry>, metrics: Arc<Metrics>) -> ApiFeed {
		ApiFeed {
			cfg,
			registry,
			metrics,
			client: reqwest::Client::new(),
		}
	}

	pub async fn run(self, drain: DrainWatcher) {
		let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
		let drained = drain.wait_for_drain();
		tokio::pin!(drained);
		loop {
			tokio::select! {
				res = self.poll_once(&mut backoff) => {
					if let Err(e) = res {
						let delay = backoff.next();
						warn!("routing api feed failed: {e}; retrying in {delay:?}");
						tokio::select! {
							_ = tokio::time::sleep(delay) => {}
							_ = &mut drained => return,
						}
					}
				}
				_ = &mut drained => {
					debug!("routing api feed stopped, drain started");
					return;
				}
			}
		}
	}

	async fn poll_once(&self, backoff: &mut Backoff) -> anyhow::Result<()> {
		self.fetch_router_groups().await?;

		let url = format!("{}/v1/events", self.cfg.url.trim_end_matches('/'));
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.context("routing api events request")?
			.error_for_status()
			.context("routing api events status")?;
		// A live stream means the last reconnect worked.
		backoff.reset();

		let mut events = response.bytes_stream().eventsource();
		while let Some(event) = events.next().await {
			let event = event.context("routing api event stream")?;
			match event.event.as_str() {
				"http" | "tcp" => self.apply(&event.data),
				other => trace!("ignoring routing api event type {other:?}"),
			}
		}
		anyhow::bail!("routing api event stream ended")
	}

	async fn fetch_router_groups(&self) -> anyhow::Result<()> {
		let url = format!("{}/v1/router_groups", self.cfg.url.trim_end_matches('/'));
		let groups: Vec<RouterGroup> = self
			.client
			.get(&url)
			.send()
			.await
			.context("router groups request")?
			.error_for_status()
			.context("router groups status")?
			.json()
			.await
			.context("router groups body")?;
		debug!(count = groups.len(), "router groups refreshed");
		self.registry.set_router_groups(groups);
		Ok(())
	}

	fn apply(&self, data: &str) {
		let event: ApiRouteEvent = match serde_json::from_str(data) {
			Ok(ev) => ev,
			Err(e) => {
				self.metrics.malformed_registrations.inc();
				warn!("malformed routing api event: {e}");
				return;
			},
		};
		let action = match event.action {
			ApiAction::Upsert => MutationKind::upsert,
			ApiAction::Delete => MutationKind::remove,
		};
		apply_registration(
			&self.registry,
			&self.metrics,
			FeedSource::api,
			&event.route,
			action,
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_http_upsert_event() {
		let data = r#"{
			"action": "Upsert",
			"route": {
				"host": "10.0.0.1",
				"port": 8080,
				"uris": ["app.example.com"],
				"private_instance_id": "i-1",
				"modification_tag": {"guid": "g", "index": 3}
			}
		}"#;
		let ev: ApiRouteEvent = serde_json::from_str(data).unwrap();
		assert!(matches!(ev.action, ApiAction::Upsert));
		assert_eq!(ev.route.modification_tag.as_ref().unwrap().index, 3);
	}

	#[test]
	fn parses_tcp_delete_event() {
		let data = r#"{
			"action": "Delete",
			"route": {
				"host": "10.0.0.9",
				"port": 61001,
				"router_group_guid": "rg-1",
				"external_port": 5000,
				"modification_tag": {"guid": "g", "index": 9}
			}
		}"#;
		let ev: ApiRouteEvent = serde_json::from_str(data).unwrap();
		assert!(matches!(ev.action, ApiAction::Delete));
		assert!(ev.route.tcp_key().is_some());
	}
}
