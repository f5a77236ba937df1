use std::time::Duration;

use tokio::{sync::mpsc::Sender, task::JoinHandle, time};

/// Sends a unit on `tick_tx` every `duration`, the first one right away.
/// The ticker stops once the receiving half is gone.
pub fn start_tick(tick_tx: Sender<()>, duration: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tick_tx.send(()).await.is_err() {
                log::trace!("tick receiver closed, stopping ticker");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn first_tick_is_immediate_and_ticker_stops_with_receiver() {
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let ticker = start_tick(tick_tx, Duration::from_millis(10));

        tick_rx.recv().await.unwrap();
        tick_rx.recv().await.unwrap();
        drop(tick_rx);

        ticker.await.unwrap();
    }
}
