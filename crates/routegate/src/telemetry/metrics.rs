use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum FeedSource {
	bus,
	api,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum MutationKind {
	upsert,
	remove,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FeedLabels {
	pub feed: FeedSource,
	pub action: MutationKind,
}

/// Capture-only metrics; exporting them is an external concern.
pub struct Metrics {
	pub routes_pruned: Counter,
	pub dropped_access_logs: Counter,
	pub dropped_route_events: Counter,
	pub route_lookups: Counter,
	pub route_misses: Counter,
	pub registry_messages: Family<FeedLabels, Counter>,
	pub malformed_registrations: Counter,
	pub backend_attempts: Counter,
	pub backend_retries: Counter,
	pub backend_exhausted: Counter,
	pub bus_connected: Gauge,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Metrics {
		let m = Metrics {
			routes_pruned: Counter::default(),
			dropped_access_logs: Counter::default(),
			dropped_route_events: Counter::default(),
			route_lookups: Counter::default(),
			route_misses: Counter::default(),
			registry_messages: Family::default(),
			malformed_registrations: Counter::default(),
			backend_attempts: Counter::default(),
			backend_retries: Counter::default(),
			backend_exhausted: Counter::default(),
			bus_connected: Gauge::default(),
		};
		registry.register(
			"routes_pruned",
			"Endpoints removed by TTL prune sweeps",
			m.routes_pruned.clone(),
		);
		registry.register(
			"dropped_access_logs",
			"Access log records dropped because the channel was full",
			m.dropped_access_logs.clone(),
		);
		registry.register(
			"dropped_route_events",
			"Route change events dropped for lagging subscribers",
			m.dropped_route_events.clone(),
		);
		registry.register(
			"route_lookups",
			"Route table lookups",
			m.route_lookups.clone(),
		);
		registry.register(
			"route_misses",
			"Route table lookups that found no route",
			m.route_misses.clone(),
		);
		registry.register(
			"registry_messages",
			"Accepted registry mutations by feed and action",
			m.registry_messages.clone(),
		);
		registry.register(
			"malformed_registrations",
			"Feed payloads that failed to parse",
			m.malformed_registrations.clone(),
		);
		registry.register(
			"backend_attempts",
			"Round-trip attempts against backends",
			m.backend_attempts.clone(),
		);
		registry.register(
			"backend_retries",
			"Round-trip attempts beyond the first for a request",
			m.backend_retries.clone(),
		);
		registry.register(
			"backend_exhausted",
			"Requests that exhausted their attempt budget",
			m.backend_exhausted.clone(),
		);
		registry.register(
			"bus_connected",
			"Whether the message bus feed is connected",
			m.bus_connected.clone(),
		);
		m
	}
}
