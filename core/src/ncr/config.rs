//! Adapter configuration

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DriverError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Force port mapped register access
    pub io_mapped: bool,
    /// Complete commands through INTFLY where the chip supports it
    pub intfly: bool,
    pub sync_negotiation: bool,
    /// Attach and identify only, never issue commands
    pub probe_only: bool,
    /// Memory-to-memory and register round trip self tests at attach
    pub selftest_memory: bool,
    /// INQUIRY every target through the bootstrap descriptor at attach
    pub selftest_inquiry: bool,
    /// Allow targets to disconnect
    pub disconnect: bool,
    pub host_id: u8,
    /// Command descriptor cap
    pub can_queue: usize,
    pub sg_tablesize: usize,
    /// STIME0 selection timeout code
    pub selection_timeout: u8,
    /// Requested SDTR period, in units of 4ns
    pub sync_period_factor: u8,
    pub sync_offset: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            io_mapped: false,
            intfly: true,
            sync_negotiation: true,
            probe_only: false,
            selftest_memory: true,
            selftest_inquiry: false,
            disconnect: true,
            host_id: 7,
            can_queue: 16,
            sg_tablesize: 16,
            selection_timeout: 0x0D,
            sync_period_factor: 25,
            sync_offset: 8,
        }
    }
}

fn parse_num<T: FromStr>(key: &str, val: Option<&str>) -> Result<T, DriverError> {
    let val = val.ok_or_else(|| DriverError::InvalidOption(format!("{} needs a value", key)))?;
    let parsed = if let Some(hex) = val.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| v.to_string().parse().ok())
    } else {
        val.parse().ok()
    };
    parsed.ok_or_else(|| DriverError::InvalidOption(format!("{}={}", key, val)))
}

impl FromStr for HostConfig {
    type Err = DriverError;

    /// Parses a comma separated option string such as
    /// `io_mapped,nosync,host_id=6`. Flags prefixed with `no` turn an
    /// option off.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cfg = Self::default();
        for opt in s.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, val) = match opt.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (opt, None),
            };
            let (flag, on) = match key.strip_prefix("no") {
                Some(rest) if !rest.is_empty() => (rest, false),
                _ => (key, true),
            };
            match flag {
                "io_mapped" | "io" => cfg.io_mapped = on,
                "intfly" => cfg.intfly = on,
                "sync" | "sync_negotiation" => cfg.sync_negotiation = on,
                "probe_only" | "probe" => cfg.probe_only = on,
                "selftest" | "selftest_memory" => cfg.selftest_memory = on,
                "inquiry" | "selftest_inquiry" => cfg.selftest_inquiry = on,
                "disconnect" => cfg.disconnect = on,
                "host_id" => cfg.host_id = parse_num(key, val)?,
                "can_queue" => cfg.can_queue = parse_num(key, val)?,
                "sg_tablesize" => cfg.sg_tablesize = parse_num(key, val)?,
                "selection_timeout" => cfg.selection_timeout = parse_num(key, val)?,
                "sync_period" | "sync_period_factor" => {
                    cfg.sync_period_factor = parse_num(key, val)?;
                }
                "sync_offset" => cfg.sync_offset = parse_num(key, val)?,
                _ => return Err(DriverError::InvalidOption(opt.to_string())),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.host_id > 7 {
            return Err(DriverError::InvalidOption(format!(
                "host_id {} out of range",
                self.host_id
            )));
        }
        if self.can_queue == 0 || self.sg_tablesize == 0 {
            return Err(DriverError::InvalidOption(
                "can_queue and sg_tablesize must be non-zero".to_string(),
            ));
        }
        if self.sync_offset > 8 {
            return Err(DriverError::InvalidOption(format!(
                "sync_offset {} exceeds the chip's limit of 8",
                self.sync_offset
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_string() {
        let c: HostConfig = "io_mapped,nosync,intfly,probe_only".parse().unwrap();
        assert!(c.io_mapped);
        assert!(!c.sync_negotiation);
        assert!(c.intfly);
        assert!(c.probe_only);
        assert_eq!(c.host_id, 7);
    }

    #[test]
    fn option_values() {
        let c: HostConfig = "host_id=6, can_queue=0x20, nodisconnect".parse().unwrap();
        assert_eq!(c.host_id, 6);
        assert_eq!(c.can_queue, 32);
        assert!(!c.disconnect);
    }

    #[test]
    fn option_errors() {
        assert!("bogus".parse::<HostConfig>().is_err());
        assert!("host_id".parse::<HostConfig>().is_err());
        assert!("host_id=9".parse::<HostConfig>().is_err());
        assert!("sync_offset=x".parse::<HostConfig>().is_err());
    }

    #[test]
    fn json_defaults() {
        let c: HostConfig = serde_json::from_str(r#"{"intfly": false}"#).unwrap();
        assert!(!c.intfly);
        assert_eq!(c.sg_tablesize, HostConfig::default().sg_tablesize);
    }
}
