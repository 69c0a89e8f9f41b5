//! Moisture-driven irrigation decisions and the relay safety cutoff.
//!
//! Two orthogonal state machines: the sampling window
//! (`Idle → SensorPowered → Idle`, driven by the SampleStart and Measure
//! tasks) and the relay (`Off ↔ On(deadline)`). Whenever the relay turns
//! on, a cutoff task is armed at the deadline, and the deadline lives in
//! local scheduler state — the pump turns off on schedule even if every
//! hub-facing call is failing.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::binding::DeviceBinding;
use crate::hardware::{RelayPin, SoilProbe};
use crate::scheduler::{DutyCycleScheduler, TaskId};
use crate::transport::{ConnectionManager, Transport};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelayState {
    Off,
    /// On with the instant by which the cutoff must have fired.
    On { deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SamplePhase {
    Idle,
    /// Probe energized, waiting out the settle delay.
    SensorPowered,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

pub struct IrrigationPolicy {
    /// Readings strictly below this voltage trigger watering.
    threshold_volts: f64,
    /// Probe settle delay between power-up and measurement.
    settle: Duration,
    /// How long the relay may stay on per activation.
    relay_on_duration: Duration,
    phase: SamplePhase,
    relay: RelayState,
}

impl IrrigationPolicy {
    pub fn new(threshold_volts: f64, settle: Duration, relay_on_duration: Duration) -> Self {
        Self {
            threshold_volts,
            settle,
            relay_on_duration,
            phase: SamplePhase::Idle,
            relay: RelayState::Off,
        }
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay
    }

    /// Open a sampling window: energize the probe and schedule the
    /// measurement for when it has settled.
    pub fn start_sample(
        &mut self,
        probe: &mut dyn SoilProbe,
        sched: &mut DutyCycleScheduler,
        now: Instant,
    ) {
        probe.power_on();
        self.phase = SamplePhase::SensorPowered;
        sched.rearm(TaskId::Measure, now + self.settle);
    }

    /// Close the sampling window: read, de-energize, publish, decide.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_sample<T: Transport>(
        &mut self,
        probe: &mut dyn SoilProbe,
        relay: &mut dyn RelayPin,
        moisture: &mut DeviceBinding,
        relay_binding: &mut DeviceBinding,
        conn: &mut ConnectionManager<T>,
        sched: &mut DutyCycleScheduler,
        now: Instant,
    ) {
        let volts = probe.read_volts();
        probe.power_off();
        self.phase = SamplePhase::Idle;

        let reading = format!("{volts:.2}");
        if let Err(e) = moisture.publish_state(conn, &reading) {
            warn!("moisture publish failed, will retry next cycle: {e}");
        }

        if volts < self.threshold_volts {
            info!(
                reading = %reading,
                threshold = self.threshold_volts,
                "moisture below threshold, watering"
            );
            self.relay_on(relay, relay_binding, conn, sched, now);
        } else {
            debug!(reading = %reading, "moisture adequate");
        }
    }

    /// Turn the relay on with a hard auto-off deadline. The retained
    /// `"ON"` goes out before the pin is asserted so remote state is never
    /// stale relative to physical actuation; a publish failure still
    /// actuates, degraded. Re-entry while already on replaces the pending
    /// cutoff deadline — exactly one cutoff is ever armed.
    pub fn relay_on<T: Transport>(
        &mut self,
        relay: &mut dyn RelayPin,
        relay_binding: &mut DeviceBinding,
        conn: &mut ConnectionManager<T>,
        sched: &mut DutyCycleScheduler,
        now: Instant,
    ) {
        if let Err(e) = relay_binding.publish_state(conn, "ON") {
            warn!("relay state publish failed, actuating anyway: {e}");
        }
        relay.set(true);
        let deadline = now + self.relay_on_duration;
        self.relay = RelayState::On { deadline };
        sched.rearm(TaskId::RelayCutoff, deadline);
    }

    /// Turn the relay off and drop any pending cutoff. Pin first, then the
    /// retained `"OFF"` — transport trouble must never delay de-actuation.
    pub fn relay_off<T: Transport>(
        &mut self,
        relay: &mut dyn RelayPin,
        relay_binding: &mut DeviceBinding,
        conn: &mut ConnectionManager<T>,
        sched: &mut DutyCycleScheduler,
    ) {
        relay.set(false);
        self.relay = RelayState::Off;
        sched.disable(TaskId::RelayCutoff);
        if let Err(e) = relay_binding.publish_state(conn, "OFF") {
            warn!("relay state publish failed, retained value heals later: {e}");
        }
    }

    /// The armed deadline arrived: force the relay off.
    pub fn cutoff<T: Transport>(
        &mut self,
        relay: &mut dyn RelayPin,
        relay_binding: &mut DeviceBinding,
        conn: &mut ConnectionManager<T>,
        sched: &mut DutyCycleScheduler,
    ) {
        info!("relay cutoff deadline reached");
        self.relay_off(relay, relay_binding, conn, sched);
    }

    /// Remote command: exactly `"ON"` opens the relay; any other payload
    /// is treated as off, so a garbled command fails safe.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_command<T: Transport>(
        &mut self,
        command: &str,
        relay: &mut dyn RelayPin,
        relay_binding: &mut DeviceBinding,
        conn: &mut ConnectionManager<T>,
        sched: &mut DutyCycleScheduler,
        now: Instant,
    ) {
        if command.trim() == "ON" {
            info!("remote command: relay on");
            self.relay_on(relay, relay_binding, conn, sched, now);
        } else {
            if command.trim() != "OFF" {
                warn!(command, "unrecognized command, treating as OFF");
            } else {
                info!("remote command: relay off");
            }
            self.relay_off(relay, relay_binding, conn, sched);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
