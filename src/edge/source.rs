//! Raw metric sources
//!
//! Sensor-read primitives sit behind [`MetricSource`]; the debouncer only ever
//! sees [`RawReading`]s. Concrete sources:
//!
//! - `gpio` / `ultrasonic`: Raspberry Pi GPIO through rppal (feature `gpio`)
//! - `value_file`: any text file holding a number, e.g. a sysfs GPIO value
//!   or an IIO proximity channel
//! - [`FnSource`]: wraps a closure, for simulations and tests

use super::debounce::{InvalidReading, RawReading};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[cfg(feature = "gpio")]
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("Source '{0}' is not available in this build")]
    Unsupported(String),
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    Up,
    Down,
    #[default]
    Off,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Binary,
    Continuous,
}

/// Where a channel's raw metric comes from.
///
/// ```toml
/// source = { kind = "gpio", pin = 12, pull = "up", active_low = true }
/// source = { kind = "ultrasonic", trig_pin = 14, echo_pin = 27 }
/// source = { kind = "value_file", path = "/sys/bus/iio/devices/iio:device0/in_proximity_raw", signal = "continuous", scale = 0.1 }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Gpio {
        pin: u8,
        #[serde(default)]
        pull: Pull,
        #[serde(default)]
        active_low: bool,
    },
    Ultrasonic {
        trig_pin: u8,
        echo_pin: u8,
        #[serde(default = "default_echo_timeout_us")]
        timeout_us: u64,
    },
    ValueFile {
        path: PathBuf,
        signal: SignalKind,
        #[serde(default)]
        active_low: bool,
        #[serde(default = "default_scale")]
        scale: f32,
    },
}

fn default_echo_timeout_us() -> u64 {
    30_000
}

fn default_scale() -> f32 {
    1.0
}

pub trait MetricSource: Send {
    /// Takes one sample. Failures are reported in-band as
    /// [`RawReading::Invalid`] so a flaky sensor never stops the loop.
    fn read(&mut self) -> RawReading;

    fn describe(&self) -> String;
}

/// Closure-backed source.
pub struct FnSource<F>(pub F);

impl<F> MetricSource for FnSource<F>
where
    F: FnMut() -> RawReading + Send,
{
    fn read(&mut self) -> RawReading {
        (self.0)()
    }

    fn describe(&self) -> String {
        "closure".to_string()
    }
}

/// Reads a value from a text file on every sample.
#[derive(Debug, Clone)]
pub struct ValueFileSource {
    path: PathBuf,
    signal: SignalKind,
    active_low: bool,
    scale: f32,
}

impl ValueFileSource {
    pub fn new(path: PathBuf, signal: SignalKind, active_low: bool, scale: f32) -> Self {
        Self {
            path,
            signal,
            active_low,
            scale,
        }
    }

    fn parse(&self, content: &str) -> RawReading {
        let text = content.trim();
        match self.signal {
            SignalKind::Binary => {
                let level = match text {
                    "1" | "true" | "high" => true,
                    "0" | "false" | "low" => false,
                    _ => return RawReading::Invalid(InvalidReading::Unreadable),
                };
                RawReading::Level(level != self.active_low)
            }
            SignalKind::Continuous => match text.parse::<f32>() {
                Ok(value) => RawReading::Metric(value * self.scale),
                Err(_) => RawReading::Invalid(InvalidReading::Unreadable),
            },
        }
    }
}

impl MetricSource for ValueFileSource {
    fn read(&mut self) -> RawReading {
        // sysfs attributes are served from memory; a blocking read is fine
        match std::fs::read_to_string(&self.path) {
            Ok(content) => self.parse(&content),
            Err(e) => {
                debug!("Unable to read {}: {}", self.path.display(), e);
                RawReading::Invalid(InvalidReading::Unreadable)
            }
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(feature = "gpio")]
pub use self::gpio::{LevelInput, UltrasonicRanger};

#[cfg(feature = "gpio")]
mod gpio {
    use super::{InvalidReading, MetricSource, Pull, RawReading, SourceError};
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use std::time::{Duration, Instant};

    /// Echo pulses shorter than this are below the ranger's resolution.
    const MIN_ECHO: Duration = Duration::from_micros(150);

    /// Speed of sound in cm/µs, halved for the round trip.
    const CM_PER_US: f32 = 0.0343 * 0.5;

    /// Digital input such as a PIR sensor or a flow switch.
    pub struct LevelInput {
        pin: InputPin,
        active_low: bool,
    }

    impl LevelInput {
        pub fn open(gpio: &Gpio, pin: u8, pull: Pull, active_low: bool) -> Result<Self, SourceError> {
            let pin = gpio.get(pin)?;
            let pin = match pull {
                Pull::Up => pin.into_input_pullup(),
                Pull::Down => pin.into_input_pulldown(),
                Pull::Off => pin.into_input(),
            };
            Ok(Self { pin, active_low })
        }
    }

    impl MetricSource for LevelInput {
        fn read(&mut self) -> RawReading {
            RawReading::Level(self.pin.is_high() != self.active_low)
        }

        fn describe(&self) -> String {
            format!("gpio {}", self.pin.pin())
        }
    }

    /// HC-SR04 style trigger/echo ranger.
    pub struct UltrasonicRanger {
        trig: OutputPin,
        echo: InputPin,
        timeout: Duration,
    }

    impl UltrasonicRanger {
        pub fn open(gpio: &Gpio, trig_pin: u8, echo_pin: u8, timeout: Duration) -> Result<Self, SourceError> {
            let trig = gpio.get(trig_pin)?.into_output_low();
            let echo = gpio.get(echo_pin)?.into_input();
            Ok(Self { trig, echo, timeout })
        }

        fn wait_while(&self, level: bool, started: Instant) -> bool {
            while self.echo.is_high() == level {
                if started.elapsed() > self.timeout {
                    return false;
                }
            }
            true
        }
    }

    impl MetricSource for UltrasonicRanger {
        fn read(&mut self) -> RawReading {
            // Let a late echo from the previous ping settle
            if !self.wait_while(true, Instant::now()) {
                return RawReading::Invalid(InvalidReading::Timeout);
            }

            self.trig.set_high();
            let pulse = Instant::now();
            while pulse.elapsed() < Duration::from_micros(10) {}
            self.trig.set_low();

            if !self.wait_while(false, Instant::now()) {
                return RawReading::Invalid(InvalidReading::Timeout);
            }
            let rise = Instant::now();
            if !self.wait_while(true, rise) {
                return RawReading::Invalid(InvalidReading::Timeout);
            }
            let echo = rise.elapsed();

            if echo < MIN_ECHO {
                return RawReading::Invalid(InvalidReading::TooClose);
            }
            RawReading::Metric(echo.as_micros() as f32 * CM_PER_US)
        }

        fn describe(&self) -> String {
            format!("ultrasonic trig {} echo {}", self.trig.pin(), self.echo.pin())
        }
    }
}

/// Builds the source a channel is configured with.
pub fn build_source(config: &SourceConfig) -> Result<Box<dyn MetricSource>, SourceError> {
    let source: Box<dyn MetricSource> = match config {
        SourceConfig::ValueFile {
            path,
            signal,
            active_low,
            scale,
        } => Box::new(ValueFileSource::new(path.clone(), *signal, *active_low, *scale)),

        #[cfg(feature = "gpio")]
        SourceConfig::Gpio {
            pin,
            pull,
            active_low,
        } => {
            let gpio = rppal::gpio::Gpio::new()?;
            Box::new(LevelInput::open(&gpio, *pin, *pull, *active_low)?)
        }

        #[cfg(feature = "gpio")]
        SourceConfig::Ultrasonic {
            trig_pin,
            echo_pin,
            timeout_us,
        } => {
            let gpio = rppal::gpio::Gpio::new()?;
            Box::new(UltrasonicRanger::open(
                &gpio,
                *trig_pin,
                *echo_pin,
                std::time::Duration::from_micros(*timeout_us),
            )?)
        }

        #[cfg(not(feature = "gpio"))]
        SourceConfig::Gpio { .. } | SourceConfig::Ultrasonic { .. } => {
            return Err(SourceError::Unsupported(
                "gpio (rebuild with the `gpio` feature)".to_string(),
            ))
        }
    };
    info!("Opened raw metric source: {}", source.describe());
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(signal: SignalKind, active_low: bool, scale: f32) -> ValueFileSource {
        ValueFileSource::new(PathBuf::from("/unused"), signal, active_low, scale)
    }

    #[test]
    fn binary_values_respect_active_low_wiring() {
        let flow = source(SignalKind::Binary, true, 1.0);
        assert_eq!(flow.parse("0\n"), RawReading::Level(true));
        assert_eq!(flow.parse("1\n"), RawReading::Level(false));
        assert_eq!(
            flow.parse("maybe"),
            RawReading::Invalid(InvalidReading::Unreadable)
        );
    }

    #[test]
    fn continuous_values_are_scaled() {
        let ranger = source(SignalKind::Continuous, false, 0.1);
        assert_eq!(ranger.parse("105\n"), RawReading::Metric(10.5));
        assert_eq!(
            ranger.parse(""),
            RawReading::Invalid(InvalidReading::Unreadable)
        );
    }

    #[test]
    fn unreadable_file_is_an_invalid_sample() {
        let mut missing = ValueFileSource::new(
            PathBuf::from("/nonexistent/suctionsense/value"),
            SignalKind::Binary,
            false,
            1.0,
        );
        assert_eq!(missing.read(), RawReading::Invalid(InvalidReading::Unreadable));
    }

    #[test]
    fn closure_sources_replay_scripted_readings() {
        let mut script = vec![RawReading::Level(true), RawReading::Level(false)].into_iter();
        let mut source = FnSource(move || script.next().unwrap_or(RawReading::Invalid(InvalidReading::Timeout)));
        assert_eq!(source.read(), RawReading::Level(true));
        assert_eq!(source.read(), RawReading::Level(false));
        assert_eq!(source.read(), RawReading::Invalid(InvalidReading::Timeout));
    }
}
