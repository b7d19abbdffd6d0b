use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use crate::channel::Epoch;

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Ticks every `period` for one subscription epoch. The lifecycle manager
/// decides on each tick whether the live channel is down and a snapshot
/// poll is due; this task only keeps time. Aborted on teardown.
pub fn spawn(epoch: Epoch, period: Duration, ticks: mpsc::UnboundedSender<Epoch>) -> JoinHandle<()> {
    tokio::spawn(poll_fallback_task(epoch, period, ticks))
}

pub async fn poll_fallback_task(epoch: Epoch, period: Duration, ticks: mpsc::UnboundedSender<Epoch>) {
    let period = if period < MIN_PERIOD {
        warn!("Fallback poll interval {:?} is too short, using {:?}", period, MIN_PERIOD);
        MIN_PERIOD
    } else {
        period
    };
    info!("Starting fallback poll timer for epoch {} every {:?}", epoch, period);
    // First tick one full period out; the initial snapshot covers t=0.
    let mut interval = interval_at(Instant::now() + period, period);

    loop {
        interval.tick().await;
        if ticks.send(epoch).is_err() {
            debug!("Fallback poll timer for epoch {} has no listener, stopping", epoch);
            return;
        }
    }
}
