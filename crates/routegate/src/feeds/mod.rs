pub mod api;
pub mod bus;

use router_core::prelude::*;

use crate::registry::Registry;
use crate::telemetry::metrics::{FeedLabels, FeedSource, Metrics, MutationKind};
use crate::types::RegistrationMessage;

/// Exponential reconnect backoff with jitter, shared by both feeds.
pub(crate) struct Backoff {
	base: Duration,
	max: Duration,
	current: Duration,
}

impl Backoff {
	pub(crate) fn new(base: Duration, max: Duration) -> Backoff {
		Backoff {
			base,
			max,
			current: base,
		}
	}

	pub(crate) fn reset(&mut self) {
		self.current = self.base;
	}

	/// The next delay, then doubles toward the cap. Jittered ±25%.
	pub(crate) fn next(&mut self) -> Duration {
		let delay = self.current;
		self.current = (self.current * 2).min(self.max);
		let jitter = 0.75 + rand::random::<f64>() * 0.5;
		delay.mul_secs_f64_saturating(jitter)
	}
}

trait DurationExt {
	fn mul_secs_f64_saturating(self, f: f64) -> Duration;
}

impl DurationExt for Duration {
	fn mul_secs_f64_saturating(self, f: f64) -> Duration {
		Duration::from_secs_f64((self.as_secs_f64() * f).max(0.001))
	}
}

/// Applies one parsed registration to the registry, counting accepted
/// mutations per feed.
pub(crate) fn apply_registration(
	registry: &Registry,
	metrics: &Metrics,
	feed: FeedSource,
	msg: &RegistrationMessage,
	action: MutationKind,
) {
	let endpoint_template = msg.endpoint();
	let id = endpoint_template.id.clone();
	let tag = endpoint_template.tag();
	let ttl = msg.ttl();
	let route_service_url = msg.route_service_url.as_deref().map(strng::new);

	if let Some(tcp_key) = msg.tcp_key() {
		match action {
			MutationKind::upsert => {
				registry.upsert_tcp(&tcp_key, msg.endpoint(), ttl);
			},
			MutationKind::remove => {
				registry.remove_tcp(&tcp_key, &id, &tag);
			},
		}
		metrics
			.registry_messages
			.get_or_create(&FeedLabels { feed, action })
			.inc();
	}

	for key in msg.route_keys() {
		match action {
			MutationKind::upsert => {
				registry.upsert(&key, msg.endpoint(), ttl, route_service_url.clone());
			},
			MutationKind::remove => {
				registry.remove(&key, &id, &tag);
			},
		}
		metrics
			.registry_messages
			.get_or_create(&FeedLabels { feed, action })
			.inc();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::RegistryConfig;

	#[test]
	fn backoff_doubles_to_cap() {
		let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
		let first = b.next();
		assert!(first >= Duration::from_millis(375) && first <= Duration::from_millis(625));
		for _ in 0..10 {
			b.next();
		}
		let capped = b.next();
		assert!(capped <= Duration::from_secs(38));
		assert!(capped >= Duration::from_secs(22));
		b.reset();
		assert!(b.next() <= Duration::from_millis(625));
	}

	#[test]
	fn registration_applies_all_uris() {
		let mut prom = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(Metrics::new(&mut prom));
		let registry = Registry::new(RegistryConfig::default(), metrics.clone());
		let msg: RegistrationMessage = serde_json::from_str(
			r#"{
				"host": "10.0.0.1",
				"port": 8080,
				"uris": ["a.example.com", "b.example.com/api"],
				"private_instance_id": "i-1",
				"stale_threshold_in_seconds": 120
			}"#,
		)
		.unwrap();
		apply_registration(
			&registry,
			&metrics,
			FeedSource::bus,
			&msg,
			MutationKind::upsert,
		);
		assert!(registry.lookup("a.example.com", "/").is_some());
		assert!(registry.lookup("b.example.com", "/api/v2").is_some());
		assert!(registry.lookup("b.example.com", "/other").is_none());

		// Untagged messages carry a fresh guid, so the unregister applies.
		apply_registration(
			&registry,
			&metrics,
			FeedSource::bus,
			&msg,
			MutationKind::remove,
		);
		assert!(registry.lookup("a.example.com", "/").is_none());
		assert!(registry.lookup("b.example.com", "/api").is_none());
	}

	#[test]
	fn tagged_remove_honors_ordering() {
		let mut prom = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(Metrics::new(&mut prom));
		let registry = Registry::new(RegistryConfig::default(), metrics.clone());
		let mut msg: RegistrationMessage = serde_json::from_str(
			r#"{"host":"10.0.0.1","port":8080,"uris":["a.example.com"],"private_instance_id":"i-1"}"#,
		)
		.unwrap();
		msg.modification_tag = Some(crate::types::ModificationTag {
			guid: strng::new("g"),
			index: 5,
		});
		apply_registration(&registry, &metrics, FeedSource::api, &msg, MutationKind::upsert);

		// A remove carrying an older index of the same guid is stale.
		let mut stale = msg.clone();
		stale.modification_tag = Some(crate::types::ModificationTag {
			guid: strng::new("g"),
			index: 4,
		});
		apply_registration(&registry, &metrics, FeedSource::api, &stale, MutationKind::remove);
		assert!(registry.lookup("a.example.com", "/").is_some());

		let mut newer = msg.clone();
		newer.modification_tag = Some(crate::types::ModificationTag {
			guid: strng::new("g"),
			index: 6,
		});
		apply_registration(&registry, &metrics, FeedSource::api, &newer, MutationKind::remove);
		assert!(registry.lookup("a.example.com", "/").is_none());
	}
}
