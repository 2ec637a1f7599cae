//! The routing decision engine.
//!
//! `route_local` handles frames read from the tunnel device and decides which
//! peer, if any, they travel to. `route_remote` handles packets arriving from
//! peers over HTTP and decides whether they are delivered to the local device.
//! Every discarded frame increments a drop counter; routing never raises
//! errors toward its callers.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, warn};

use crate::codec::Packet;
use crate::device::TunnelDevice;
use crate::error::PayloadError;
use crate::ip::IpFrame;
use crate::metrics::DropReason;
use crate::nodes::{NodeContext, RemoteNodePool};
use crate::types::{unix_seconds_f64, Protocol};

pub struct Router {
    ctx: Arc<NodeContext>,
    pool: Arc<RemoteNodePool>,
    device: Arc<dyn TunnelDevice>,
}

impl Router {
    pub fn new(
        ctx: Arc<NodeContext>,
        pool: Arc<RemoteNodePool>,
        device: Arc<dyn TunnelDevice>,
    ) -> Self {
        Self { ctx, pool, device }
    }

    /// Decide the fate of a frame read from the local tunnel device.
    ///
    /// In precedence order: loopback to our own address, subnet broadcast,
    /// destinations outside the mesh range, unicast to a known peer, mesh-wide
    /// broadcast, and finally no-route.
    pub fn route_local(&self, frame: &[u8]) {
        let parsed = match IpFrame::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => return self.drop_unparseable(e),
        };
        let protocol = parsed.protocol();
        let Some(net) = self.ctx.config.node.networks.get(&protocol) else {
            return self.ctx.metrics.drop_packet(DropReason::UnsupportedProtocol);
        };
        let destination = parsed.destination();

        if destination == net.address {
            warn!("tunnel frame addressed to this node's own address; dropping");
            return self.ctx.metrics.drop_packet(DropReason::Loopback);
        }

        if Some(destination) == ipv4_broadcast(&net.subnet) {
            if !self.ctx.config.node.broadcast_enabled {
                return self.ctx.metrics.drop_packet(DropReason::BroadcastDisabled);
            }
            return self.fan_out(parsed.ethertype(), frame, protocol, &net.subnet);
        }

        if !net.network.contains(&destination) {
            let reason = if destination.is_multicast() {
                DropReason::UnsupportedMulticast
            } else {
                DropReason::OutsideConfiguredNetwork
            };
            return self.ctx.metrics.drop_packet(reason);
        }

        if let Some(node) = self.pool.find_by_address(protocol, destination) {
            if let Some(packet) = self.make_packet(parsed.ethertype(), frame) {
                node.enqueue(packet);
                self.ctx
                    .metrics
                    .packets_routed
                    .with_label_values(&["unicast"])
                    .inc();
            }
            return;
        }

        if Some(destination) == ipv4_broadcast(&net.network) {
            if !self.ctx.config.node.broadcast_enabled {
                return self.ctx.metrics.drop_packet(DropReason::BroadcastDisabled);
            }
            return self.fan_out(parsed.ethertype(), frame, protocol, &net.network);
        }

        debug!("no route for {}; dropping", destination);
        self.ctx.metrics.drop_packet(DropReason::NoRoute);
    }

    /// Decide the fate of a packet received from a peer. `sender_id` is the
    /// node the transport layer authenticated, never anything taken from the
    /// packet itself. Only packets whose source address maps back to that
    /// sender, and whose destination is actually us (or a broadcast we
    /// accept), reach the device.
    pub async fn route_remote(&self, packet: Packet, sender_id: &str) {
        let parsed = match IpFrame::parse(packet.data()) {
            Ok(parsed) => parsed,
            Err(e) => return self.drop_unparseable(e),
        };
        let protocol = parsed.protocol();
        let Some(net) = self.ctx.config.node.networks.get(&protocol) else {
            return self.ctx.metrics.drop_packet(DropReason::UnsupportedProtocol);
        };

        match self.pool.resolve_address(protocol, parsed.source()) {
            None => {
                warn!(
                    "packet from {} has no return route for source {}; dropping",
                    sender_id,
                    parsed.source()
                );
                return self.ctx.metrics.drop_packet(DropReason::NoReturnRoute);
            }
            Some(mapped) if mapped != sender_id || packet.source_node_id() != sender_id => {
                warn!(
                    "source {} belongs to node {} but the packet came from {} claiming {}; dropping",
                    parsed.source(),
                    mapped,
                    sender_id,
                    packet.source_node_id()
                );
                return self.ctx.metrics.drop_packet(DropReason::IdentityConflict);
            }
            Some(_) => {}
        }

        let destination = parsed.destination();
        let broadcast = Some(destination) == ipv4_broadcast(&net.subnet)
            || Some(destination) == ipv4_broadcast(&net.network);
        if destination == net.address || (broadcast && self.ctx.config.node.broadcast_enabled) {
            return self.deliver(packet).await;
        }
        if broadcast {
            return self.ctx.metrics.drop_packet(DropReason::BroadcastDisabled);
        }

        warn!(
            "packet from {} destined to {} was misrouted to this node; dropping",
            packet.source_node_id(),
            destination
        );
        self.ctx.metrics.drop_packet(DropReason::Misrouted);
    }

    async fn deliver(&self, packet: Packet) {
        let frame = packet.into_data();
        match self.device.write_frame(&frame).await {
            Ok(()) => {
                self.ctx
                    .metrics
                    .packets_routed
                    .with_label_values(&["delivered"])
                    .inc();
            }
            Err(e) => {
                warn!("tunnel device rejected frame: {}", e);
                self.ctx.metrics.drop_packet(DropReason::QueueClosed);
            }
        }
    }

    /// Copy the frame to every known peer whose tunnel address sits in
    /// `scope`.
    fn fan_out(&self, ethertype: u16, frame: &[u8], protocol: Protocol, scope: &IpNet) {
        for node in self.pool.all() {
            let Some(addr) = node.node_info().address(protocol) else {
                continue;
            };
            if !scope.contains(&addr) {
                continue;
            }
            if let Some(packet) = self.make_packet(ethertype, frame) {
                node.enqueue(packet);
                self.ctx
                    .metrics
                    .packets_routed
                    .with_label_values(&["broadcast"])
                    .inc();
            }
        }
    }

    fn make_packet(&self, ethertype: u16, frame: &[u8]) -> Option<Packet> {
        match Packet::new(
            ethertype,
            frame.to_vec(),
            self.ctx.local_id(),
            unix_seconds_f64(),
        ) {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!("could not frame tunnel payload: {}", e);
                self.ctx.metrics.drop_packet(DropReason::Malformed);
                None
            }
        }
    }

    fn drop_unparseable(&self, error: PayloadError) {
        let reason = match error {
            PayloadError::Malformed("ip version") => DropReason::UnsupportedProtocol,
            _ => DropReason::Malformed,
        };
        debug!("unroutable tunnel payload ({}); dropping", error);
        self.ctx.metrics.drop_packet(reason);
    }
}

/// Broadcast address of an IPv4 range; IPv6 has no broadcast.
fn ipv4_broadcast(net: &IpNet) -> Option<IpAddr> {
    match net {
        IpNet::V4(net) => Some(IpAddr::V4(net.broadcast())),
        IpNet::V6(_) => None,
    }
}
