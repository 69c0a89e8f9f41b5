//! Soil-moisture node firmware: announces a moisture sensor and a pump
//! relay to the hub, samples on a duty cycle, and waters when the soil
//! reads dry. Single-threaded and cooperative end to end.

mod binding;
mod config;
mod device;
mod error;
mod hardware;
mod policy;
mod scheduler;
mod topic;
mod transport;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::env;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use binding::DeviceBinding;
use policy::IrrigationPolicy;
use scheduler::{DutyCycleScheduler, Repeat, TaskId};
use transport::{ConnectionManager, MqttSession};

/// Pause between scheduler passes.
const TICK: Duration = Duration::from_millis(50);

/// How often the broker session is drained.
const PUMP_PERIOD: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(config = %config_path, node_id = %cfg.device.node_id, "starting moisture node");

    // ── Broker session ──────────────────────────────────────────────
    // One session for both devices, identified by the sensor.
    let client_id = cfg.sensor_identity().client_id();
    let credentials = cfg
        .broker
        .username
        .clone()
        .zip(cfg.broker.password.clone());
    let session = MqttSession::new(&cfg.broker.host, cfg.broker.port, &client_id, credentials);
    let mut conn = ConnectionManager::new(session, client_id);

    // ── Device bindings ─────────────────────────────────────────────
    let mut moisture = DeviceBinding::new(cfg.sensor_identity());
    let mut pump = DeviceBinding::new(cfg.relay_identity());

    // Startup is bounded: if the hub cannot be reached within the retry
    // budget the node still runs its control loop and retries later.
    for (binding, what) in [(&mut moisture, "moisture sensor"), (&mut pump, "pump relay")] {
        if let Err(e) = binding.announce(&mut conn) {
            warn!("{what} announce failed, continuing degraded: {e}");
        }
    }

    let commands: Rc<RefCell<VecDeque<String>>> = Rc::new(RefCell::new(VecDeque::new()));
    let queue = Rc::clone(&commands);
    if let Err(e) = pump.subscribe_commands(
        &mut conn,
        Box::new(move |cmd| queue.borrow_mut().push_back(cmd.to_string())),
    ) {
        warn!("command subscription failed, relay is local-only: {e}");
    }

    moisture.make_available(&mut conn);
    pump.make_available(&mut conn);

    // ── Hardware + policy ───────────────────────────────────────────
    let (mut probe, mut relay) = hardware::init(&cfg)?;
    let mut policy = IrrigationPolicy::new(
        cfg.control.moisture_threshold_volts,
        cfg.settle(),
        cfg.relay_on_duration(),
    );

    let now = Instant::now();
    let mut sched = build_task_table(
        cfg.heartbeat(),
        cfg.sample_interval(),
        cfg.awake_window(),
        now,
    );

    // ── Steady state ────────────────────────────────────────────────
    'cycle: loop {
        let now = Instant::now();
        for id in sched.due(now) {
            match id {
                TaskId::Heartbeat => {
                    info!(relay = ?policy.relay_state(), state = ?conn.state(), "heartbeat");
                }
                TaskId::TransportPump => {
                    for msg in conn.poll() {
                        pump.dispatch(&msg);
                    }
                    // Collected first so the handler's queue borrow is
                    // released before the policy runs.
                    let queued: Vec<String> = commands.borrow_mut().drain(..).collect();
                    for cmd in queued {
                        policy.handle_command(
                            &cmd,
                            relay.as_mut(),
                            &mut pump,
                            &mut conn,
                            &mut sched,
                            now,
                        );
                    }
                }
                TaskId::SampleStart => {
                    probe.note_watering(relay.is_on());
                    policy.start_sample(probe.as_mut(), &mut sched, now);
                }
                TaskId::Measure => {
                    policy.finish_sample(
                        probe.as_mut(),
                        relay.as_mut(),
                        &mut moisture,
                        &mut pump,
                        &mut conn,
                        &mut sched,
                        now,
                    );
                }
                TaskId::RelayCutoff => {
                    policy.cutoff(relay.as_mut(), &mut pump, &mut conn, &mut sched);
                }
                TaskId::DeepSleep => {
                    info!("awake window over, entering deep sleep");
                    break 'cycle;
                }
            }
        }
        thread::sleep(TICK);
    }

    // ── Teardown ────────────────────────────────────────────────────
    // Deep sleep discards all state, so leave the pump off and mark both
    // devices offline. Discovery configs stay retained for the wake-up.
    policy.relay_off(relay.as_mut(), &mut pump, &mut conn, &mut sched);
    moisture.make_unavailable(&mut conn);
    pump.make_unavailable(&mut conn);
    Ok(())
}

/// Fixed task table for one awake cycle. `Measure` and `RelayCutoff` start
/// unarmed; the policy arms them as second halves of `SampleStart` and
/// relay-on. The first sample fires immediately.
fn build_task_table(
    heartbeat: Duration,
    sample_interval: Duration,
    awake: Option<Duration>,
    now: Instant,
) -> DutyCycleScheduler {
    let mut sched = DutyCycleScheduler::new();
    sched.register(TaskId::Heartbeat, heartbeat, Repeat::Forever, Some(now + heartbeat));
    sched.register(TaskId::TransportPump, PUMP_PERIOD, Repeat::Forever, Some(now));
    sched.register(TaskId::SampleStart, sample_interval, Repeat::Forever, Some(now));
    sched.register(TaskId::Measure, Duration::ZERO, Repeat::UntilRearmed, None);
    sched.register(TaskId::RelayCutoff, Duration::ZERO, Repeat::UntilRearmed, None);
    if let Some(window) = awake {
        sched.register(TaskId::DeepSleep, window, Repeat::Once, Some(now + window));
    }
    sched
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HEARTBEAT: Duration = Duration::from_secs(30);
    const SAMPLE: Duration = Duration::from_secs(60);

    #[test]
    fn first_pass_fires_pump_and_sample_but_not_heartbeat() {
        let now = Instant::now();
        let mut sched = build_task_table(HEARTBEAT, SAMPLE, None, now);
        let fired = sched.due(now);
        assert!(fired.contains(&TaskId::TransportPump));
        assert!(fired.contains(&TaskId::SampleStart));
        assert!(!fired.contains(&TaskId::Heartbeat));
    }

    #[test]
    fn measure_and_cutoff_start_unarmed() {
        let now = Instant::now();
        let mut sched = build_task_table(HEARTBEAT, SAMPLE, None, now);
        let fired = sched.due(now + SAMPLE * 10);
        assert!(!fired.contains(&TaskId::Measure));
        assert!(!fired.contains(&TaskId::RelayCutoff));
    }

    #[test]
    fn deep_sleep_registered_only_with_awake_window() {
        let now = Instant::now();
        let mut sched = build_task_table(HEARTBEAT, SAMPLE, None, now);
        assert!(!sched.due(now + SAMPLE * 100).contains(&TaskId::DeepSleep));

        let window = Duration::from_secs(300);
        let mut sched = build_task_table(HEARTBEAT, SAMPLE, Some(window), now);
        assert_eq!(sched.next_fire(TaskId::DeepSleep), Some(now + window));
    }
}
