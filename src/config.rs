//! Tunable knobs for ICE sessions and RUDP channels.
//!
//! Follows `nyx-core::config`'s pattern of `#[derive(Deserialize)]` structs with
//! `#[serde(default)]` and a hand-written `Default` impl carrying the literal
//! defaults, so a caller can load a partial TOML/JSON document and still get
//! sane values for anything it omits.

use std::time::Duration;

use serde::Deserialize;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Configuration for one [`crate::ice::IceSession`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IceSessionConfig {
    /// Interval between keep-alive STUN indications while nominated. `0` disables.
    #[serde(with = "duration_secs")]
    pub keep_alive_interval: Duration,
    /// If no data or STUN has been received within this window, issue an
    /// alive-check request. `0` (the default) disables expecting-data liveness.
    #[serde(with = "duration_secs")]
    pub expect_stun_or_data_within: Duration,
    /// Bound on the alive-check STUN transaction.
    #[serde(with = "duration_millis")]
    pub alive_check_timeout: Duration,
    /// No activity for this long while backgrounded triggers shutdown. `0` disables.
    #[serde(with = "duration_secs")]
    pub backgrounding_timeout: Duration,
    /// Hard cap on the candidate-pair table (RFC 5245 recommends 100).
    pub max_candidate_pairs: usize,
    /// Giveup window: no valid pair and no outstanding work for this long means
    /// `CandidateSearchFailed`.
    #[serde(with = "duration_secs")]
    pub max_wait_for_activation_when_all_done: Duration,
    /// After this long searching, accept a valid-but-not-top-priority pair.
    #[serde(with = "duration_secs")]
    pub search_giveup_ideal_window: Duration,
    /// Activate-timer period: how often a new pair is allowed to be probed.
    #[serde(with = "duration_millis")]
    pub activate_interval: Duration,
    /// Step-timer period: drives nomination/giveup decisions.
    #[serde(with = "duration_secs")]
    pub step_interval: Duration,
}

impl Default for IceSessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: secs(15),
            expect_stun_or_data_within: Duration::ZERO,
            alive_check_timeout: millis(500),
            backgrounding_timeout: Duration::ZERO,
            max_candidate_pairs: 100,
            max_wait_for_activation_when_all_done: secs(60),
            search_giveup_ideal_window: secs(4),
            activate_interval: millis(20),
            step_interval: secs(2),
        }
    }
}

/// Configuration for one [`crate::rudp::RudpChannel`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RudpChannelConfig {
    /// Requested channel lifetime, refreshed before expiry.
    #[serde(with = "duration_secs")]
    pub lifetime: Duration,
    /// Advertised minimum RTT, used by the peer's reliable stream as a floor.
    #[serde(with = "duration_millis")]
    pub minimum_rtt: Duration,
}

impl Default for RudpChannelConfig {
    fn default() -> Self {
        Self {
            lifetime: secs(30),
            minimum_rtt: millis(50),
        }
    }
}

impl RudpChannelConfig {
    /// How long after open before a refresh is due (half the lifetime, per spec §4.3.2).
    pub fn refresh_interval(&self) -> Duration {
        self.lifetime / 2
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
