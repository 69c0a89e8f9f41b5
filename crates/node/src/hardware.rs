//! Probe and relay hardware seams.
//!
//! The `sim` feature (default) provides a software probe and relay for
//! development without hardware; the `gpio` feature drives a real relay
//! pin and an ADS1115 probe via rppal. The policy layer only sees the
//! traits, so the two worlds stay interchangeable.

use crate::config::Config;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Moisture probe with a switchable power rail. The probe is energized
/// only around a measurement to limit electrolytic corrosion.
pub trait SoilProbe {
    fn power_on(&mut self);
    fn power_off(&mut self);
    /// Sample the moisture voltage. Only meaningful while powered.
    fn read_volts(&mut self) -> f64;
    /// Hint that the pump is running. Real probes ignore this; the
    /// simulated probe uses it to model soil recovery.
    fn note_watering(&mut self, _active: bool) {}
}

/// The pump relay output.
pub trait RelayPin {
    fn set(&mut self, on: bool);
    fn is_on(&self) -> bool;
}

/// Build the probe and relay for the enabled backend.
#[cfg(feature = "gpio")]
pub fn init(cfg: &Config) -> anyhow::Result<(Box<dyn SoilProbe>, Box<dyn RelayPin>)> {
    let probe = AdcProbe::new(cfg.hardware.adc_addr, cfg.hardware.probe_power_pin)?;
    let relay = GpioRelay::new(cfg.hardware.relay_pin, cfg.hardware.relay_active_low)?;
    Ok((Box::new(probe), Box::new(relay)))
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
pub fn init(_cfg: &Config) -> anyhow::Result<(Box<dyn SoilProbe>, Box<dyn RelayPin>)> {
    Ok((
        Box::new(SimProbe::new(1.4)),
        Box::new(SimRelay::default()),
    ))
}

// ---------------------------------------------------------------------------
// Simulated hardware (development — no wiring)
// ---------------------------------------------------------------------------

/// Software probe: drifts toward dry with per-sample noise, and recovers
/// while the (simulated) pump runs. Lower voltage means drier soil.
#[cfg(feature = "sim")]
pub struct SimProbe {
    volts: f64,
    powered: bool,
    watering: bool,
}

#[cfg(feature = "sim")]
impl SimProbe {
    /// Drying drift per sample, in volts.
    const DRIFT: f64 = 0.02;
    /// Recovery per sample while watering.
    const WET_RATE: f64 = 0.15;
    /// Uniform electronic-noise amplitude.
    const NOISE: f64 = 0.01;

    pub fn new(start_volts: f64) -> Self {
        Self {
            volts: start_volts,
            powered: false,
            watering: false,
        }
    }
}

#[cfg(feature = "sim")]
impl SoilProbe for SimProbe {
    fn power_on(&mut self) {
        self.powered = true;
        tracing::trace!("[sim] probe powered on");
    }

    fn power_off(&mut self) {
        self.powered = false;
        tracing::trace!("[sim] probe powered off");
    }

    fn read_volts(&mut self) -> f64 {
        if !self.powered {
            tracing::warn!("[sim] probe read while unpowered");
        }
        let step = if self.watering {
            Self::WET_RATE
        } else {
            -Self::DRIFT
        };
        let noise = (fastrand::f64() - 0.5) * 2.0 * Self::NOISE;
        self.volts = (self.volts + step).clamp(0.0, 3.3);
        (self.volts + noise).clamp(0.0, 3.3)
    }

    fn note_watering(&mut self, active: bool) {
        self.watering = active;
    }
}

#[cfg(feature = "sim")]
#[derive(Default)]
pub struct SimRelay {
    on: bool,
}

#[cfg(feature = "sim")]
impl RelayPin for SimRelay {
    fn set(&mut self, on: bool) {
        self.on = on;
        tracing::info!("[sim] relay set {}", if on { "ON" } else { "OFF" });
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Real hardware (gpio feature — Raspberry Pi)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioRelay {
    pin: rppal::gpio::OutputPin,
    active_low: bool,
    on: bool,
}

#[cfg(feature = "gpio")]
impl GpioRelay {
    pub fn new(pin_num: u8, active_low: bool) -> anyhow::Result<Self> {
        let mut pin = rppal::gpio::Gpio::new()?.get(pin_num)?.into_output();
        // Fail-safe: OFF at startup.
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(Self {
            pin,
            active_low,
            on: false,
        })
    }
}

#[cfg(feature = "gpio")]
impl RelayPin for GpioRelay {
    fn set(&mut self, on: bool) {
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        self.on = on;
        tracing::info!("relay set {}", if on { "ON" } else { "OFF" });
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

/// ADS1115 register addresses.
#[cfg(feature = "gpio")]
const REG_CONVERSION: u8 = 0x00;
#[cfg(feature = "gpio")]
const REG_CONFIG: u8 = 0x01;

/// Single-shot read of AIN0 vs GND: OS=1, MUX=100, PGA=001 (±4.096 V),
/// MODE=1, DR=100 (128 SPS), comparator disabled.
#[cfg(feature = "gpio")]
const CONFIG_SINGLE_A0: u16 = 0b1_100_001_1_100_0_0_0_11;

/// Full-scale voltage at PGA ±4.096 V over the 15-bit positive range.
#[cfg(any(feature = "gpio", test))]
fn ads_volts(raw: i16) -> f64 {
    f64::from(raw.max(0)) * 4.096 / 32768.0
}

/// ADS1115-backed probe with a GPIO-switched power rail.
#[cfg(feature = "gpio")]
pub struct AdcProbe {
    i2c: rppal::i2c::I2c,
    power: rppal::gpio::OutputPin,
}

#[cfg(feature = "gpio")]
impl AdcProbe {
    pub fn new(addr: u16, power_pin: u8) -> anyhow::Result<Self> {
        let mut i2c = rppal::i2c::I2c::new()?;
        i2c.set_slave_address(addr)?;
        let mut power = rppal::gpio::Gpio::new()?.get(power_pin)?.into_output();
        power.set_low();
        Ok(Self { i2c, power })
    }
}

#[cfg(feature = "gpio")]
impl SoilProbe for AdcProbe {
    fn power_on(&mut self) {
        self.power.set_high();
    }

    fn power_off(&mut self) {
        self.power.set_low();
    }

    fn read_volts(&mut self) -> f64 {
        let mut read = || -> anyhow::Result<i16> {
            self.i2c
                .block_write(REG_CONFIG, &CONFIG_SINGLE_A0.to_be_bytes())?;
            // Conversion at 128 SPS takes ~7.8 ms.
            std::thread::sleep(std::time::Duration::from_millis(9));
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONVERSION, &mut buf)?;
            Ok(i16::from_be_bytes(buf))
        };
        match read() {
            Ok(raw) => ads_volts(raw),
            Err(e) => {
                tracing::error!("adc read failed: {e}");
                0.0
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
