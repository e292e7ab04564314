//! Operational metrics for ACN nodes.
//!
//! A [`Monitor`] is cheap to clone and a disabled monitor records nothing,
//! so nodes call it unconditionally. Latencies are recorded in microseconds.

use acn_types::config::MonitoringConfig;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Instant;

/// Histogram buckets, in microseconds.
pub const LATENCY_BUCKETS_US: [f64; 7] = [100.0, 500.0, 1e3, 1e4, 1e5, 5e5, 1e6];

/// Latency histograms a node records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    /// DHT provide of an agent address.
    DhtStore,
    /// DHT lookup of an agent address.
    DhtLookup,
    /// Relay registration handled by a peer, or performed by a client.
    Register,
    /// A full `route_envelope` call.
    Route,
}

struct Metrics {
    registry: Registry,
    dht_store: Histogram,
    dht_lookup: Histogram,
    register: Histogram,
    route: Histogram,
    routes_in_flight: Gauge,
    routes_all: Counter,
    routes_success: Counter,
    delegate_clients: Gauge,
    delegate_clients_all: Counter,
    relay_clients_all: Counter,
    mailbox_clients: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let latency = || Histogram::new(LATENCY_BUCKETS_US.into_iter());

        let dht_store = latency();
        let dht_lookup = latency();
        let register = latency();
        let route = latency();
        registry.register(
            "acn_dht_op_latency_store",
            "Latency of DHT provide operations (us)",
            dht_store.clone(),
        );
        registry.register(
            "acn_dht_op_latency_lookup",
            "Latency of DHT address lookups (us)",
            dht_lookup.clone(),
        );
        registry.register(
            "acn_op_latency_register",
            "Latency of relay registrations (us)",
            register.clone(),
        );
        registry.register(
            "acn_op_latency_route",
            "Latency of envelope routing (us)",
            route.clone(),
        );

        let routes_in_flight = Gauge::default();
        let routes_all = Counter::default();
        let routes_success = Counter::default();
        registry.register(
            "acn_op_route_count",
            "Envelopes currently being routed",
            routes_in_flight.clone(),
        );
        registry.register(
            "acn_op_route_count_all",
            "Envelopes routed",
            routes_all.clone(),
        );
        registry.register(
            "acn_op_route_count_success",
            "Envelopes routed successfully",
            routes_success.clone(),
        );

        let delegate_clients = Gauge::default();
        let delegate_clients_all = Counter::default();
        let relay_clients_all = Counter::default();
        let mailbox_clients = Gauge::default();
        registry.register(
            "acn_service_delegate_clients_count",
            "Connected delegate clients",
            delegate_clients.clone(),
        );
        registry.register(
            "acn_service_delegate_clients_count_all",
            "Delegate clients ever registered",
            delegate_clients_all.clone(),
        );
        registry.register(
            "acn_service_relay_clients_count_all",
            "Relay clients ever registered",
            relay_clients_all.clone(),
        );
        registry.register(
            "acn_service_mailbox_clients_count",
            "Registered mailbox clients",
            mailbox_clients.clone(),
        );

        Self {
            registry,
            dht_store,
            dht_lookup,
            register,
            route,
            routes_in_flight,
            routes_all,
            routes_success,
            delegate_clients,
            delegate_clients_all,
            relay_clients_all,
            mailbox_clients,
        }
    }

    fn histogram(&self, latency: Latency) -> &Histogram {
        match latency {
            Latency::DhtStore => &self.dht_store,
            Latency::DhtLookup => &self.dht_lookup,
            Latency::Register => &self.register,
            Latency::Route => &self.route,
        }
    }
}

/// Handle to a node's metrics.
#[derive(Clone, Default)]
pub struct Monitor {
    metrics: Option<Arc<Metrics>>,
}

impl Monitor {
    /// An enabled monitor with a fresh registry.
    pub fn new() -> Self {
        Self {
            metrics: Some(Arc::new(Metrics::new())),
        }
    }

    /// A monitor that records nothing.
    pub fn disabled() -> Self {
        Self { metrics: None }
    }

    /// Enabled when an exporter address is configured.
    pub fn from_config(config: &MonitoringConfig) -> Self {
        if config.listen_addr.is_some() {
            Self::new()
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.metrics.is_some()
    }

    /// Record the time elapsed since `started`.
    pub fn observe(&self, latency: Latency, started: Instant) {
        if let Some(m) = &self.metrics {
            m.histogram(latency)
                .observe(started.elapsed().as_micros() as f64);
        }
    }

    /// Track one `route_envelope` call until [`RouteTimer::finish`] or drop.
    pub fn start_route(&self) -> RouteTimer {
        if let Some(m) = &self.metrics {
            m.routes_in_flight.inc();
            m.routes_all.inc();
        }
        RouteTimer {
            monitor: self.clone(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn delegate_client_connected(&self) {
        if let Some(m) = &self.metrics {
            m.delegate_clients.inc();
            m.delegate_clients_all.inc();
        }
    }

    pub fn delegate_client_disconnected(&self) {
        if let Some(m) = &self.metrics {
            m.delegate_clients.dec();
        }
    }

    pub fn relay_client_registered(&self) {
        if let Some(m) = &self.metrics {
            m.relay_clients_all.inc();
        }
    }

    pub fn set_mailbox_clients(&self, count: usize) {
        if let Some(m) = &self.metrics {
            m.mailbox_clients.set(count as i64);
        }
    }

    /// Prometheus text exposition, or `None` when disabled.
    pub fn encode(&self) -> Option<String> {
        let m = self.metrics.as_ref()?;
        let mut out = String::new();
        encode(&mut out, &m.registry).ok()?;
        Some(out)
    }
}

/// In-flight route measurement.
pub struct RouteTimer {
    monitor: Monitor,
    started: Instant,
    finished: bool,
}

impl RouteTimer {
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        if let Some(m) = &self.monitor.metrics {
            m.routes_in_flight.dec();
            if success {
                m.routes_success.inc();
            }
        }
        self.monitor.observe(Latency::Route, self.started);
    }
}

impl Drop for RouteTimer {
    fn drop(&mut self) {
        // Cancelled before completion
        if !self.finished {
            if let Some(m) = &self.monitor.metrics {
                m.routes_in_flight.dec();
            }
        }
    }
}
