//! Reference-counted clock-state governor.
//!
//! Latency-sensitive work requests the high-performance operating point for
//! its duration and releases it afterwards. Requests nest: the scaler is
//! raised on the first outstanding request and lowered when the last one is
//! released. The guard returned by [`DvfsGovernor::request_max`] releases on
//! drop, so the operating point is restored on every exit path, early
//! returns and panics included.
//!
//! This is purely a performance lever — correctness never depends on it.

use parking_lot::Mutex;
use tracing::debug;

/// Process-wide operating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingPoint {
    /// Low-power clock state.
    Min,
    /// High-performance clock state.
    Max,
}

/// Platform hook that actually switches clock states.
pub trait ClockScaler: Send + Sync + 'static {
    fn set_point(&self, point: OperatingPoint);
}

/// Scaler for hosts without frequency control.
pub struct NoopScaler;

impl ClockScaler for NoopScaler {
    fn set_point(&self, _point: OperatingPoint) {}
}

pub struct DvfsGovernor {
    scaler: Box<dyn ClockScaler>,
    state: Mutex<GovernorState>,
}

struct GovernorState {
    outstanding: u32,
    point: OperatingPoint,
}

impl DvfsGovernor {
    pub fn new(scaler: Box<dyn ClockScaler>) -> Self {
        Self {
            scaler,
            state: Mutex::new(GovernorState {
                outstanding: 0,
                point: OperatingPoint::Min,
            }),
        }
    }

    /// Request the high-performance point until the guard is dropped.
    pub fn request_max(&self) -> OppGuard<'_> {
        let mut st = self.state.lock();
        st.outstanding += 1;
        if st.point == OperatingPoint::Min {
            self.scaler.set_point(OperatingPoint::Max);
            st.point = OperatingPoint::Max;
            debug!("operating point raised to max");
        }
        OppGuard { governor: self }
    }

    /// Current operating point.
    pub fn operating_point(&self) -> OperatingPoint {
        self.state.lock().point
    }

    fn release(&self) {
        let mut st = self.state.lock();
        st.outstanding = st.outstanding.saturating_sub(1);
        if st.outstanding == 0 && st.point == OperatingPoint::Max {
            self.scaler.set_point(OperatingPoint::Min);
            st.point = OperatingPoint::Min;
            debug!("operating point lowered to min");
        }
    }
}

/// RAII handle for one outstanding high-performance request.
pub struct OppGuard<'a> {
    governor: &'a DvfsGovernor,
}

impl Drop for OppGuard<'_> {
    fn drop(&mut self) {
        self.governor.release();
    }
}
