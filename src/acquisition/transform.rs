//! Value transform: raw register words to engineering units.
//!
//! Pure functions only. `engineering = raw * scale + offset`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::Channel;
use crate::types::Sample;

/// How a multi-register read is turned into samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterMode {
    /// One sample per register, addressed `start + index`
    #[default]
    PerRegister,
    /// Only the first register produces a sample
    FirstOnly,
}

#[inline]
pub fn engineering_value(raw: u16, scale: f64, offset: f64) -> f64 {
    f64::from(raw) * scale + offset
}

/// Build the samples for one successful read of `channel`.
///
/// Extra words beyond the channel's register count are ignored.
pub fn to_samples(channel: &Channel, raw: &[u16], timestamp: DateTime<Utc>) -> Vec<Sample> {
    let take = match channel.register_mode {
        RegisterMode::PerRegister => usize::from(channel.count),
        RegisterMode::FirstOnly => 1,
    };

    raw.iter()
        .take(take)
        .zip(0u16..)
        .map(|(&word, index)| Sample {
            channel: channel.name.clone(),
            slave_id: channel.slave_id,
            address: channel.address.wrapping_add(index),
            function_code: channel.function_code,
            timestamp,
            raw: word,
            value: engineering_value(word, channel.scale, channel.offset),
            unit: channel.unit.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use std::time::Duration;

    fn channel(count: u16, mode: RegisterMode) -> Channel {
        let mut cfg = ChannelConfig::new("boiler", 5, 100);
        cfg.count = count;
        cfg.scale = 0.1;
        cfg.unit = "degC".into();
        cfg.register_mode = mode;
        Channel::from_config(&cfg, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_scale_and_offset() {
        assert!((engineering_value(250, 0.1, 0.0) - 25.0).abs() < 1e-9);
        assert!((engineering_value(100, 2.0, -50.0) - 150.0).abs() < 1e-9);
        assert!((engineering_value(0, 1.0, 3.5) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_single_register_sample() {
        let now = Utc::now();
        let samples = to_samples(&channel(1, RegisterMode::PerRegister), &[250], now);
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.slave_id, 5);
        assert_eq!(s.address, 100);
        assert_eq!(s.raw, 250);
        assert!((s.value - 25.0).abs() < 1e-9);
        assert_eq!(&*s.unit, "degC");
        assert_eq!(s.timestamp, now);
    }

    #[test]
    fn test_per_register_addresses() {
        let samples = to_samples(&channel(3, RegisterMode::PerRegister), &[10, 20, 30], Utc::now());
        let addresses: Vec<u16> = samples.iter().map(|s| s.address).collect();
        assert_eq!(addresses, vec![100, 101, 102]);
        assert!((samples[2].value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_only_mode() {
        let samples = to_samples(&channel(3, RegisterMode::FirstOnly), &[10, 20, 30], Utc::now());
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].raw, 10);
    }

    #[test]
    fn test_register_mode_serde_names() {
        let mode: RegisterMode = serde_json::from_str("\"first_only\"").unwrap();
        assert_eq!(mode, RegisterMode::FirstOnly);
    }
}
