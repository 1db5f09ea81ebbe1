//! Lazy, rate limited probing of device libraries.
//!
//! Loading and initialising a vendor library may block for a long time if
//! the device behind it is unreachable. We therefore do not probe at
//! startup but on first use, and after a failed attempt wait for the probe
//! interval before trying again.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use log::info;
use super::error::DeviceError;


//------------ ProbeError ----------------------------------------------------

#[derive(Debug)]
pub enum ProbeError {
    /// The last probe failed recently, we are cooling off.
    AwaitingNextProbe,

    /// Probing completed and found the library unusable for good.
    CompletedUnusable,

    /// The probe failed but may succeed later.
    CallbackFailed(DeviceError),
}

impl From<ProbeError> for DeviceError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::AwaitingNextProbe => {
                DeviceError::Unavailable("awaiting next probe".into())
            }
            ProbeError::CompletedUnusable => {
                DeviceError::Unavailable("library is unusable".into())
            }
            ProbeError::CallbackFailed(err) => err,
        }
    }
}


//------------ ProbeStatus ---------------------------------------------------

enum ProbeStatus<S> {
    Probing { last_probe_time: Option<Instant> },
    Unusable,
    Usable(Arc<S>),
}


//------------ StatefulProbe -------------------------------------------------

/// Access to some state that is only available after a successful probe.
pub struct StatefulProbe<C, S> {
    name: String,
    config: Arc<C>,
    status: RwLock<ProbeStatus<S>>,
    probe_interval: Duration,
}

impl<C, S> StatefulProbe<C, S> {
    pub fn new(name: &str, config: C, probe_interval: Duration) -> Self {
        StatefulProbe {
            name: name.to_string(),
            config: Arc::new(config),
            status: RwLock::new(ProbeStatus::Probing { last_probe_time: None }),
            probe_interval,
        }
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    /// Returns whether the last probe succeeded.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.status.read().as_deref(), Ok(ProbeStatus::Usable(_))
        )
    }

    pub fn last_probe_time(&self) -> Option<Instant> {
        match self.status.read().as_deref() {
            Ok(ProbeStatus::Probing { last_probe_time }) => *last_probe_time,
            _ => None,
        }
    }

    /// Returns the usable state, probing first if it is time to do so.
    pub fn status<F>(&self, probe: F) -> Result<Arc<S>, ProbeError>
    where
        F: FnOnce(&C) -> Result<S, ProbeError>,
    {
        {
            let status = self.status.read().map_err(|_| {
                ProbeError::CompletedUnusable
            })?;
            match &*status {
                ProbeStatus::Usable(state) => return Ok(state.clone()),
                ProbeStatus::Unusable => {
                    return Err(ProbeError::CompletedUnusable)
                }
                ProbeStatus::Probing { last_probe_time } => {
                    if let Some(remaining) = self.cooling_off(*last_probe_time) {
                        info!(
                            "[{}] Availability checking is cooling off: \
                             {}s remaining",
                            self.name, remaining.as_secs()
                        );
                        return Err(ProbeError::AwaitingNextProbe)
                    }
                }
            }
        }

        // Only one thread probes, the others behave as if cooling off.
        let mut status = self.status.try_write().map_err(|_| {
            ProbeError::AwaitingNextProbe
        })?;
        match &*status {
            ProbeStatus::Usable(state) => return Ok(state.clone()),
            ProbeStatus::Unusable => return Err(ProbeError::CompletedUnusable),
            ProbeStatus::Probing { .. } => { }
        }
        *status = ProbeStatus::Probing { last_probe_time: Some(Instant::now()) };

        match probe(&self.config) {
            Ok(state) => {
                let state = Arc::new(state);
                *status = ProbeStatus::Usable(state.clone());
                Ok(state)
            }
            Err(ProbeError::CompletedUnusable) => {
                *status = ProbeStatus::Unusable;
                Err(ProbeError::CompletedUnusable)
            }
            Err(err) => Err(err),
        }
    }

    /// Forgets the usable state so that the next access probes again.
    pub fn reset(&self) {
        if let Ok(mut status) = self.status.write() {
            if matches!(*status, ProbeStatus::Usable(_)) {
                *status = ProbeStatus::Probing {
                    last_probe_time: Some(Instant::now())
                };
            }
        }
    }

    fn cooling_off(&self, last_probe_time: Option<Instant>) -> Option<Duration> {
        let elapsed = last_probe_time?.elapsed();
        self.probe_interval.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}


//------------ Tests ---------------------------------------------------------
