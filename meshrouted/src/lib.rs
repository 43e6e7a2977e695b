//! Embeddable client/service for the mesh routing daemon core.
//!
//! `Service` owns the neighbor set and the periodic driver and runs as a
//! spawned task; `Client` is the cheaply-cloneable handle callers keep,
//! mirroring the actor shape used elsewhere in this workspace's sibling
//! crates (a channel-driven service task plus a thin client wrapper holding
//! an [`AbortOnDropHandle`]).
//!
//! The outer event loop that also multiplexes a CLI, config reloads, or
//! daemonization is explicitly out of scope (§1); this crate's `Service::run`
//! is the inner loop such an outer process would spawn and hold onto.

use std::{net::SocketAddr, sync::Arc};

use n0_future::task::AbortOnDropHandle;
use snafu::IntoError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info_span, warn, Instrument};

pub mod addr;
pub mod config;
pub mod driver;
pub mod error;
pub mod iface;
pub mod merge;
pub mod neighbor;
pub mod platform;
pub mod route;
pub mod tree;

pub use config::Config;

/// Capacity of the channel used to control the running [`Service`].
const SERVICE_CHANNEL_CAPACITY: usize = 32;
/// Large enough for the largest tree this implementation will serialize
/// (§7 `BufferTooSmall` describes the 65 536-byte ceiling).
const UDP_RECV_BUF: usize = 65_536;

enum Message {
    /// Forces an immediate broadcast run outside the normal cadence.
    TriggerBroadcast {
        result_tx: oneshot::Sender<Result<route::RouteSet, error::Fatal>>,
    },
    /// Manual iface invalidation (§3 Lifecycle: "cleared when ... the
    /// iface-wide invalidate is called"). `None` invalidates every neighbor.
    ReloadInterfaces {
        iface: Option<String>,
        result_tx: oneshot::Sender<()>,
    },
    Shutdown {
        result_tx: oneshot::Sender<()>,
    },
}

/// A cheaply-cloneable handle to a running [`Service`].
#[derive(Clone)]
pub struct Client {
    routes: watch::Receiver<route::RouteSet>,
    service_tx: mpsc::Sender<Message>,
    _service_handle: Arc<AbortOnDropHandle<()>>,
}

impl Client {
    /// Spawns the service task and returns a handle to it.
    pub fn new<I, R>(
        config: Arc<Config>,
        socket: tokio::net::UdpSocket,
        iface_adapter: I,
        route_table: R,
        neighbors: neighbor::NeighborSet,
        direct_nets: route::RouteSet,
        direct_nodes: Vec<tree::Node>,
        interface_changed: watch::Receiver<u64>,
    ) -> Self
    where
        I: iface::IfaceAdapter + 'static,
        R: iface::RouteTable + 'static,
    {
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let (routes_tx, routes_rx) = watch::channel(route::RouteSet::new());

        let driver = driver::Driver::new(
            config.clone(),
            socket,
            iface_adapter,
            route_table,
            direct_nets,
            direct_nodes,
        );
        let service = Service {
            driver,
            neighbors,
            rx: service_rx,
            routes_tx,
            interface_changed,
        };

        let handle = AbortOnDropHandle::new(tokio::spawn(
            async move { service.run().await }.instrument(info_span!("meshrouted.service")),
        ));

        Client {
            routes: routes_rx,
            service_tx,
            _service_handle: Arc::new(handle),
        }
    }

    /// Watches the most recently installed route set.
    pub fn watch_routes(&self) -> watch::Receiver<route::RouteSet> {
        self.routes.clone()
    }

    /// Forces a broadcast run now, outside the normal tick cadence.
    pub async fn trigger_broadcast(&self) -> Result<route::RouteSet, error::Fatal> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(Message::TriggerBroadcast { result_tx })
            .await
            .map_err(|_| error::ChannelClosedSnafu.build())?;
        result_rx.await.map_err(|_| error::ChannelClosedSnafu.build())?
    }

    /// Manually invalidates cached trees: for a specific interface if
    /// `iface` is `Some`, or for every neighbor if `None`. Exposed as the
    /// explicit operation a config reload would perform, in place of an
    /// automatic neighbor-set rebuild on every address change (§9).
    pub async fn reload_interfaces(&self, iface: Option<String>) {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::ReloadInterfaces { iface, result_tx })
            .await
            .is_ok()
        {
            let _ = result_rx.await;
        }
    }

    /// Stops the service and waits for it to exit.
    pub async fn shutdown(&self) {
        let (result_tx, result_rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::Shutdown { result_tx })
            .await
            .is_ok()
        {
            let _ = result_rx.await;
        }
    }
}

/// The actor task: owns the neighbor set and the periodic driver, and
/// multiplexes the alarm timer, the UDP socket, interface-change
/// notifications, and the control channel on a single task (§5 "single-
/// threaded, event-driven").
struct Service<I, R> {
    driver: driver::Driver<I, R>,
    neighbors: neighbor::NeighborSet,
    rx: mpsc::Receiver<Message>,
    routes_tx: watch::Sender<route::RouteSet>,
    interface_changed: watch::Receiver<u64>,
}

impl<I, R> Service<I, R>
where
    I: iface::IfaceAdapter,
    R: iface::RouteTable,
{
    async fn run(mut self) {
        let mut alarm = tokio::time::interval(self.driver.config.alarm_timeout());
        alarm.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut udp_buf = vec![0u8; UDP_RECV_BUF];
        let mut last_change_gen = *self.interface_changed.borrow();

        debug!("meshrouted service starting");
        loop {
            tokio::select! {
                _ = alarm.tick() => {
                    let gen = *self.interface_changed.borrow();
                    let iface_changed = gen != last_change_gen;
                    last_change_gen = gen;

                    match self.driver.tick(&mut self.neighbors, iface_changed).await {
                        Ok(Some(routes)) => { let _ = self.routes_tx.send(routes); }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(%err, "fatal driver error, shutting down service");
                            break;
                        }
                    }
                }
                result = self.driver.socket.recv_from(&mut udp_buf) => {
                    match result {
                        Ok((len, SocketAddr::V4(from))) => {
                            let from_addr = addr::Addr::from(*from.ip());
                            let dump_dir = self
                                .driver
                                .config
                                .debug_packet_dump
                                .then_some(self.driver.config.debug_packet_dump_dir.as_deref())
                                .flatten();
                            if let Err(source) = neighbor::handle_data(
                                &self.neighbors,
                                &udp_buf[..len],
                                from_addr,
                                &self.driver.config.secret_key,
                                dump_dir,
                            ) {
                                let err = error::PacketSnafu.into_error(source);
                                warn!(%err, %from_addr, "dropping malformed/unauthenticated packet");
                            }
                        }
                        Ok((_, SocketAddr::V6(_))) => {
                            debug!("ignoring IPv6 datagram; out of scope (non-goals)");
                        }
                        Err(err) => warn!(%err, "udp recv error"),
                    }
                }
                Ok(()) = self.interface_changed.changed() => {
                    // Generation bump observed; picked up on the next alarm tick.
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(Message::TriggerBroadcast { result_tx }) => {
                            let result = self.driver.broadcast_run(&mut self.neighbors).await;
                            if let Ok(routes) = &result {
                                let _ = self.routes_tx.send(routes.clone());
                            }
                            let _ = result_tx.send(result);
                        }
                        Some(Message::ReloadInterfaces { iface, result_tx }) => {
                            match &iface {
                                Some(name) => neighbor::nuke_trees_for_iface(&self.neighbors, name),
                                None => {
                                    for n in self.neighbors.iter() {
                                        n.clear_tree();
                                    }
                                }
                            }
                            debug!(?iface, "invalidated cached neighbor trees");
                            let _ = result_tx.send(());
                        }
                        Some(Message::Shutdown { result_tx }) => {
                            let _ = result_tx.send(());
                            break;
                        }
                        None => {
                            debug!("control channel dropped, shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}
