use libc::{
    RTNLGRP_IPV4_IFADDR, RTNLGRP_IPV4_ROUTE, RTNLGRP_IPV6_IFADDR, RTNLGRP_IPV6_ROUTE, RTNLGRP_LINK,
};
use n0_future::{
    task::AbortOnDropHandle,
    time::{self, Duration},
    Stream, StreamExt,
};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

const fn nl_mgrp(group: u32) -> u32 {
    if group == 0 {
        0
    } else {
        1 << (group - 1)
    }
}

fn setup_netlink() -> std::io::Result<(
    AbortOnDropHandle<()>,
    impl Stream<Item = (NetlinkMessage<RouteNetlinkMessage>, SocketAddr)>,
)> {
    use netlink_sys::protocols::NETLINK_ROUTE;

    let (mut conn, _handle, messages) =
        netlink_proto::new_connection::<RouteNetlinkMessage>(NETLINK_ROUTE)?;

    let groups = nl_mgrp(RTNLGRP_IPV4_IFADDR)
        | nl_mgrp(RTNLGRP_IPV6_IFADDR)
        | nl_mgrp(RTNLGRP_IPV4_ROUTE)
        | nl_mgrp(RTNLGRP_IPV6_ROUTE)
        | nl_mgrp(RTNLGRP_LINK);

    let addr = SocketAddr::new(0, groups);
    conn.socket_mut().socket_mut().bind(&addr)?;

    let conn_handle = AbortOnDropHandle::new(tokio::task::spawn(conn));
    Ok((conn_handle, messages))
}

/// Consumes netlink notifications, bumping `tx`'s generation on each one.
/// Returns `true` if the stream ended and the caller should reconnect.
async fn process_messages(
    tx: &watch::Sender<u64>,
    messages: &mut (impl Stream<Item = (NetlinkMessage<RouteNetlinkMessage>, SocketAddr)> + Unpin),
) -> bool {
    while let Some((message, _)) = messages.next().await {
        match message.payload {
            NetlinkPayload::Error(err) => {
                warn!("error reading netlink payload: {:?}", err);
            }
            NetlinkPayload::Done(_) => return true,
            NetlinkPayload::InnerMessage(_msg) => {
                tx.send_modify(|gen| *gen = gen.wrapping_add(1));
            }
            _ => {}
        }
    }
    true
}

pub(super) fn spawn(tx: watch::Sender<u64>) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(30);

        loop {
            match setup_netlink() {
                Ok((_conn_handle, mut messages)) => {
                    backoff = Duration::from_secs(1);
                    process_messages(&tx, &mut messages).await;
                    warn!("netlink connection lost, reconnecting");
                }
                Err(err) => {
                    warn!(%err, "failed to set up netlink route monitor");
                }
            }
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    })
}
