// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Simulated signals.
//!
//! A signal is a pure function of the tick number, except for noise.

use client::{Error, Value};

use rand::Rng;

use std::f64::consts::PI;

/// Signal generated by a simulated channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// From `min` to `max` by `step`, then back to `min`.
    Ramp { min: f64, max: f64, step: f64 },
    /// Sine between `min` and `max`, one period every `samples` ticks.
    Sine { min: f64, max: f64, samples: f64 },
    /// Uniform noise in `[min, max)`.
    Noise { min: f64, max: f64 },
    /// Alternating `true` and `false`.
    FlipFlop,
    /// The same value, once.
    Const(Value),
}

impl Signal {
    /// Parses the part of a channel name after the scheme, for instance
    /// `ramp(0, 10, 0.5)`. Arguments are optional except for `const`.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelNotFound`] for an unknown signal and
    /// [`Error::Config`] for bad arguments.
    pub fn parse(name: &str) -> Result<Signal, Error> {
        let name = name.trim();
        let (function, args) = match name.find('(') {
            Some(open) => {
                let args = name[open + 1..].strip_suffix(')').ok_or_else(|| {
                    Error::Config(format!("unbalanced arguments in {}", name))
                })?;
                (name[..open].trim(), Some(args))
            }
            None => (name, None),
        };

        if function == "const" {
            let literal = args.ok_or_else(|| {
                Error::Config("const needs a value, as in const(3)".to_owned())
            })?;
            return Value::parse(literal)
                .map(Signal::Const)
                .ok_or_else(|| Error::Config(format!("invalid value in {}", name)));
        }

        let numbers = match args {
            Some(args) => args
                .split(',')
                .map(|arg| arg.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| Error::Config(format!("{} in {}", e, name)))?,
            None => Vec::new(),
        };
        let arity = |expected: usize| -> Result<(), Error> {
            if numbers.is_empty() || numbers.len() == expected {
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "{} takes {} arguments, {} given",
                    function,
                    expected,
                    numbers.len()
                )))
            }
        };
        let arg = |index: usize, default: f64| numbers.get(index).copied().unwrap_or(default);

        let signal = match function {
            "ramp" => {
                arity(3)?;
                Signal::Ramp {
                    min: arg(0, -5.0),
                    max: arg(1, 5.0),
                    step: arg(2, 1.0),
                }
            }
            "sine" => {
                arity(3)?;
                Signal::Sine {
                    min: arg(0, -5.0),
                    max: arg(1, 5.0),
                    samples: arg(2, 10.0),
                }
            }
            "noise" => {
                arity(2)?;
                Signal::Noise {
                    min: arg(0, -5.0),
                    max: arg(1, 5.0),
                }
            }
            "flipflop" => {
                arity(0)?;
                Signal::FlipFlop
            }
            _ => return Err(Error::ChannelNotFound(name.to_owned())),
        };
        signal.validate()?;
        Ok(signal)
    }

    fn validate(&self) -> Result<(), Error> {
        let valid = match self {
            Signal::Ramp { min, max, step } => {
                min <= max && *step > 0.0 && ramp_steps(*min, *max, *step).is_some()
            }
            Signal::Sine { min, max, samples } => {
                finite(&[*min, *max, *samples]) && min <= max && *samples > 0.0
            }
            Signal::Noise { min, max } => finite(&[*min, *max]) && min < max,
            Signal::FlipFlop | Signal::Const(_) => true,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::Config(format!("invalid parameters {:?}", self)))
        }
    }

    /// True if the signal only ever produces one value.
    pub fn is_constant(&self) -> bool {
        matches!(self, Signal::Const(_))
    }

    /// Value at `tick`.
    pub fn sample(&self, tick: u64) -> Value {
        match self {
            Signal::Ramp { min, max, step } => {
                let count = ramp_steps(*min, *max, *step)
                    .unwrap_or(0)
                    .saturating_add(1);
                Value::Double(min + step * (tick % count) as f64)
            }
            Signal::Sine { min, max, samples } => {
                let middle = (min + max) / 2.0;
                let amplitude = (max - min) / 2.0;
                Value::Double(middle + amplitude * (2.0 * PI * tick as f64 / samples).sin())
            }
            Signal::Noise { min, max } => {
                Value::Double(rand::thread_rng().gen_range(*min..*max))
            }
            Signal::FlipFlop => Value::Bool(tick % 2 == 0),
            Signal::Const(value) => value.clone(),
        }
    }
}

fn finite(numbers: &[f64]) -> bool {
    numbers.iter().all(|number| number.is_finite())
}

/// Steps a ramp takes from `min` to `max`, if that count is representable.
fn ramp_steps(min: f64, max: f64, step: f64) -> Option<u64> {
    if !finite(&[min, max, step]) || step <= 0.0 {
        return None;
    }
    let steps = ((max - min) / step).floor();
    if steps.is_finite() && steps >= 0.0 && steps < u64::MAX as f64 {
        Some(steps as u64)
    } else {
        None
    }
}
