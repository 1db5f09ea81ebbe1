//! Periodic background work.
//!
//! Two cycles run next to the RPC front end: device discovery, which
//! tracks tokens appearing and disappearing and reactivates returning
//! ones, and the OCSP refresh.

use std::sync::Arc;
use std::time::Duration;
use log::{error, warn};
use tokio::time::{self, MissedTickBehavior};
use crate::manager::TokenManager;
use crate::ocsp::OcspRefresher;


//------------ Scheduler -----------------------------------------------------

pub struct Scheduler {
    manager: Arc<TokenManager>,
    refresher: OcspRefresher,
    discovery_interval: Duration,
    refresh_interval: Duration,
}

impl Scheduler {
    pub fn new(
        manager: Arc<TokenManager>,
        refresher: OcspRefresher,
        discovery_interval: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Scheduler {
            manager, refresher, discovery_interval, refresh_interval
        }
    }

    /// Runs both cycles. Only returns if one of them does.
    pub async fn run(&self) {
        tokio::join!(self.run_discovery(), self.run_ocsp_refresh());
    }

    async fn run_discovery(&self) {
        let mut interval = time::interval(self.discovery_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let manager = self.manager.clone();
            // A cycle may take long with slow hardware. The next one only
            // starts after it finished.
            match tokio::task::spawn_blocking(move || manager.discover()).await {
                Ok(Ok(())) => { }
                Ok(Err(err)) => warn!("Device discovery failed: {err}"),
                Err(err) => error!("Device discovery aborted: {err}"),
            }
        }
    }

    async fn run_ocsp_refresh(&self) {
        let mut interval = time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.refresher.refresh().await {
                warn!("OCSP refresh cycle failed: {err}");
            }
        }
    }
}
