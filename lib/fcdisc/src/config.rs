// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables for discovery and login.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loop_id::{EXTENDED_HANDLES, LEGACY_SNS_FIRST_LOOP_ID};

/// Which handle numbering the adapter firmware uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HandleSpace {
    /// 2048 N_Port handles, with the top few reserved for fabric services.
    Extended,
    /// 8-bit loop IDs.  Handles above `max_loop_id` but below the first
    /// name-server handle are unusable.
    Legacy { max_loop_id: u16 },
}

impl Default for HandleSpace {
    fn default() -> Self {
        HandleSpace::Extended
    }
}

/// Which FC-4 protocol to try first when a port supports more than one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fc4Priority {
    #[default]
    Fcp,
    Nvme,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("max_loop_id {0:#x} is outside the legacy loop ID range")]
    MaxLoopId(u16),
    #[error(
        "max_outstanding {0} exceeds the {EXTENDED_HANDLES} exchange handles"
    )]
    TooManyOutstanding(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Login attempts allowed per port before it is given up on.
    pub login_retry_count: u8,
    /// Bound on rescans triggered by empty results or handle exhaustion.
    pub max_scan_retries: u8,
    pub exchange_timeout_ms: u64,
    pub max_outstanding: usize,
    pub handle_space: HandleSpace,
    /// How long a point-to-point peer gets to log in to us before we
    /// escalate with resets.
    pub n2n_login_wait_ms: u64,
    pub n2n_link_reset_limit: u8,
    pub n2n_chip_reset_limit: u8,
    pub prli_link_reset_limit: u8,
    /// After the peer logs in to us, how long we wait for it to finish
    /// before taking over the login ourselves.
    pub plogi_ack_wait_ms: u64,
    /// Periodic revalidation of logged-in ports; disabled when unset.
    pub adisc_interval_ms: Option<u64>,
    pub reconcile_interval_ms: u64,
    pub fc4_priority: Fc4Priority,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            login_retry_count: 8,
            max_scan_retries: 5,
            exchange_timeout_ms: 22_000,
            max_outstanding: 128,
            handle_space: HandleSpace::Extended,
            n2n_login_wait_ms: 3_000,
            n2n_link_reset_limit: 2,
            n2n_chip_reset_limit: 1,
            prli_link_reset_limit: 3,
            plogi_ack_wait_ms: 2_000,
            adisc_interval_ms: None,
            reconcile_interval_ms: 1_000,
            fc4_priority: Fc4Priority::Fcp,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.login_retry_count == 0 {
            return Err(ConfigError::Zero("login_retry_count"));
        }
        if self.exchange_timeout_ms == 0 {
            return Err(ConfigError::Zero("exchange_timeout_ms"));
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::Zero("max_outstanding"));
        }
        if self.max_outstanding > EXTENDED_HANDLES {
            return Err(ConfigError::TooManyOutstanding(self.max_outstanding));
        }
        if self.reconcile_interval_ms == 0 {
            return Err(ConfigError::Zero("reconcile_interval_ms"));
        }
        if self.adisc_interval_ms == Some(0) {
            return Err(ConfigError::Zero("adisc_interval_ms"));
        }
        if let HandleSpace::Legacy { max_loop_id } = self.handle_space {
            if max_loop_id == 0 || max_loop_id >= LEGACY_SNS_FIRST_LOOP_ID {
                return Err(ConfigError::MaxLoopId(max_loop_id));
            }
        }
        Ok(())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
    pub fn n2n_login_wait(&self) -> Duration {
        Duration::from_millis(self.n2n_login_wait_ms)
    }
    pub fn plogi_ack_wait(&self) -> Duration {
        Duration::from_millis(self.plogi_ack_wait_ms)
    }
    pub fn adisc_interval(&self) -> Option<Duration> {
        self.adisc_interval_ms.map(Duration::from_millis)
    }
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(HostConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = HostConfig { login_retry_count: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("login_retry_count")));

        let cfg = HostConfig {
            handle_space: HandleSpace::Legacy { max_loop_id: 0x90 },
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::MaxLoopId(0x90)));

        let cfg = HostConfig { max_outstanding: 4096, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::TooManyOutstanding(4096)));
    }

    #[test]
    fn parse_toml() {
        let cfg: HostConfig = toml::from_str(
            r#"
            login_retry_count = 3
            adisc_interval_ms = 60000
            fc4_priority = "nvme"
            handle_space = { kind = "legacy", max_loop_id = 0x7d }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.login_retry_count, 3);
        assert_eq!(cfg.adisc_interval(), Some(Duration::from_secs(60)));
        assert_eq!(cfg.fc4_priority, Fc4Priority::Nvme);
        assert_eq!(cfg.handle_space, HandleSpace::Legacy { max_loop_id: 0x7d });
        assert_eq!(cfg.max_scan_retries, 5);
        assert_eq!(cfg.validate(), Ok(()));

        let bad: Result<HostConfig, _> = toml::from_str("bogus = 1");
        assert!(bad.is_err());
    }
}
