//! Keepalive pinger for idle connections.
//!
//! One pinger task runs per physical channel (it is attached when the
//! pool opens the channel, so every subscriber of that channel shares
//! it).  When the channel has seen no outbound send and no inbound frame
//! for the configured interval, the pinger sends a lightweight keepalive
//! payload.  While the network is reported offline, pinging is
//! suspended; on return to online it pings immediately and resumes the
//! interval.

use crate::{channel::WsChannel, models::Payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Spawns the per-channel keepalive task.
pub(crate) struct KeepalivePinger;

impl KeepalivePinger {
    /// Start pinging `channel` every `interval` of silence.
    ///
    /// `network` reports host network presence; pass a receiver that
    /// always reads `true` when no such signal exists.  An interval of
    /// zero disables pinging entirely.
    pub(crate) fn spawn(
        channel: Arc<WsChannel>,
        payload: Payload,
        interval: Duration,
        network: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(ping_loop(channel, payload, interval, network))
    }
}

async fn ping_loop(
    channel: Arc<WsChannel>,
    payload: Payload,
    interval: Duration,
    mut network: watch::Receiver<bool>,
) {
    if interval.is_zero() {
        return;
    }

    let shutdown: CancellationToken = channel.terminated();
    let mut activity = channel.activity();
    let mut online = *network.borrow();
    let mut network_alive = true;
    let mut deadline = Instant::now() + interval;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return,

            changed = network.changed(), if network_alive => {
                if changed.is_err() {
                    // The status source is gone; keep the last known state.
                    network_alive = false;
                    continue;
                }
                let now_online = *network.borrow_and_update();
                if now_online && !online {
                    // Back online: ping immediately, then resume the interval.
                    if !send_ping(&channel, &payload).await {
                        return;
                    }
                    deadline = Instant::now() + interval;
                }
                online = now_online;
            },

            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
                // Traffic in either direction proves the connection is alive.
                deadline = Instant::now() + interval;
            },

            _ = tokio::time::sleep_until(deadline), if online => {
                if !send_ping(&channel, &payload).await {
                    return;
                }
                deadline = Instant::now() + interval;
            },
        }
    }
}

/// Returns `false` when pinging should stop: the channel is already
/// closed, so teardown is someone else's problem.  Any other failure is
/// logged and ignored.
async fn send_ping(channel: &WsChannel, payload: &Payload) -> bool {
    match channel.send(payload.clone()).await {
        Ok(()) => {
            log::debug!("[pulse-link] Keepalive ping sent");
            true
        },
        Err(error) if error.is_closed_class() => {
            log::debug!("[pulse-link] Keepalive stopped: {}", error);
            false
        },
        Err(error) => {
            log::warn!("[pulse-link] Keepalive ping failed: {}", error);
            true
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelOptions;

    fn ping() -> Payload {
        Payload::from("ping")
    }

    fn always_online() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ping_before_interval_then_ping_fires() {
        let (channel, mut stub) = WsChannel::stub(&ChannelOptions::default());
        let (_net_tx, net_rx) = always_online();
        KeepalivePinger::spawn(channel.clone(), ping(), Duration::from_millis(60_000), net_rx);

        tokio::time::sleep(Duration::from_millis(59_000)).await;
        assert!(
            stub.wire_rx.try_recv().is_err(),
            "no ping may be sent before the interval elapses"
        );

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(stub.wire_rx.try_recv().unwrap(), ping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_the_idle_timer() {
        let (channel, mut stub) = WsChannel::stub(&ChannelOptions::default());
        let (_net_tx, net_rx) = always_online();
        KeepalivePinger::spawn(channel.clone(), ping(), Duration::from_millis(1_000), net_rx);

        tokio::time::sleep(Duration::from_millis(600)).await;
        stub.activity.send(()).unwrap();

        // Without the reset a ping would fire at t=1000.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(stub.wire_rx.try_recv().is_err(), "activity must reset the timer");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(stub.wire_rx.try_recv().unwrap(), ping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_suspends_and_online_pings_immediately() {
        let (channel, mut stub) = WsChannel::stub(&ChannelOptions::default());
        let (net_tx, net_rx) = always_online();
        KeepalivePinger::spawn(channel.clone(), ping(), Duration::from_millis(1_000), net_rx);

        net_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert!(stub.wire_rx.try_recv().is_err(), "no pings while offline");

        net_tx.send(true).unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            stub.wire_rx.try_recv().unwrap(),
            ping(),
            "returning online pings immediately"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_stops_the_pinger() {
        let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
        let (_net_tx, net_rx) = always_online();
        let handle =
            KeepalivePinger::spawn(channel.clone(), ping(), Duration::from_millis(1_000), net_rx);

        stub.abort.cancel();
        handle.await.expect("pinger task must end once the channel closes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_send_failure_of_closed_class_stops_silently() {
        let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
        let (_net_tx, net_rx) = always_online();
        let handle =
            KeepalivePinger::spawn(channel.clone(), ping(), Duration::from_millis(1_000), net_rx);

        // The socket side goes away without the channel token firing yet;
        // the ping send fails with a closed-class error.
        drop(stub.wire_rx);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(
            handle.is_finished(),
            "pinger must stop after a closed-class send failure"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_pinging() {
        let (channel, stub) = WsChannel::stub(&ChannelOptions::default());
        let (_net_tx, net_rx) = always_online();
        let handle = KeepalivePinger::spawn(channel.clone(), ping(), Duration::ZERO, net_rx);
        handle.await.unwrap();
        drop(stub);
    }
}
