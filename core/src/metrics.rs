use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Why a packet was discarded instead of routed. Drops are counted, never
/// raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Loopback,
    BroadcastDisabled,
    OutsideConfiguredNetwork,
    UnsupportedMulticast,
    NoRoute,
    NoReturnRoute,
    IdentityConflict,
    Misrouted,
    Expired,
    QueueFull,
    QueueClosed,
    UnsupportedProtocol,
    Malformed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Loopback => "loopback",
            DropReason::BroadcastDisabled => "broadcast_disabled",
            DropReason::OutsideConfiguredNetwork => "outside_configured_network",
            DropReason::UnsupportedMulticast => "unsupported_multicast",
            DropReason::NoRoute => "no_route",
            DropReason::NoReturnRoute => "no_return_route",
            DropReason::IdentityConflict => "identity_conflict",
            DropReason::Misrouted => "misrouted",
            DropReason::Expired => "expired",
            DropReason::QueueFull => "queue_full",
            DropReason::QueueClosed => "queue_closed",
            DropReason::UnsupportedProtocol => "unsupported_protocol",
            DropReason::Malformed => "malformed",
        }
    }
}

// Fields are registered with the registry; consumers read them back through
// encode() or the per-field helpers.
pub struct Metrics {
    registry: Registry,

    pub packets_dropped: IntCounterVec,
    pub packets_routed: IntCounterVec,
    pub packets_transmitted: IntCounterVec,
    pub transmit_batch_size: Histogram,

    pub registrations: IntCounterVec,
    pub sessions_rotated: IntCounter,
    pub peers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let packets_dropped = IntCounterVec::new(
            Opts::new("weft_packets_dropped_total", "Packets dropped, by reason"),
            &["reason"],
        )
        .expect("valid metric definition");

        let packets_routed = IntCounterVec::new(
            Opts::new(
                "weft_packets_routed_total",
                "Routing decisions that moved a packet, by outcome",
            ),
            &["outcome"],
        )
        .expect("valid metric definition");

        let packets_transmitted = IntCounterVec::new(
            Opts::new(
                "weft_packets_transmitted_total",
                "Packets handed to a peer over HTTP, by result",
            ),
            &["result"],
        )
        .expect("valid metric definition");

        let transmit_batch_size = Histogram::with_opts(
            HistogramOpts::new(
                "weft_transmit_batch_size",
                "Packets per outbound transmit call",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )
        .expect("valid metric definition");

        let registrations = IntCounterVec::new(
            Opts::new(
                "weft_registrations_total",
                "Registration attempts, by result",
            ),
            &["result"],
        )
        .expect("valid metric definition");

        let sessions_rotated = IntCounter::new(
            "weft_sessions_rotated_total",
            "Completed outbound session secret rotations",
        )
        .expect("valid metric definition");

        let peers = IntGauge::new("weft_peers", "Currently known peers")
            .expect("valid metric definition");

        for collector in [
            Box::new(packets_dropped.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(packets_routed.clone()),
            Box::new(packets_transmitted.clone()),
            Box::new(transmit_batch_size.clone()),
            Box::new(registrations.clone()),
            Box::new(sessions_rotated.clone()),
            Box::new(peers.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registered once");
        }

        Self {
            registry,
            packets_dropped,
            packets_routed,
            packets_transmitted,
            transmit_batch_size,
            registrations,
            sessions_rotated,
            peers,
        }
    }

    pub fn drop_packet(&self, reason: DropReason) {
        self.packets_dropped
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.packets_dropped
            .with_label_values(&[reason.as_str()])
            .get()
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode_utf8(&self.registry.gather(), &mut buf) {
            tracing::error!("failed to encode metrics: {}", e);
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
