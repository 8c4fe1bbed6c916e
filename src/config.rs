use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ChirpError, Result};

/// Parameters governing a single [`Chirp`](crate::chirp::Chirp) instance.
///
/// Mirrors the teacher's `endpoint::Config`: a plain struct with a
/// `Default` impl and range validation performed once, at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Idle-connection lifetime. Lower-bounded by `timeout * 3`. Range 0.5-3600s.
    pub reuse_time: Duration,
    /// Send/connect timeout base. Range 0.1-1200s.
    pub timeout: Duration,
    /// Listening port (must be > 1024).
    pub port: u16,
    /// `listen()` backlog (must be < 128).
    pub backlog: u8,
    /// Per-inbound-connection concurrency. 0 means 16 (async) or 1 (sync).
    pub max_slots: u8,
    /// If true, every send sets REQ_ACK and the Remote enforces one in flight.
    pub synchronous: bool,
    /// Read/write buffer size; 0 = default (64 KiB). Must be >= 1 KiB and
    /// >= the handshake size if set.
    pub buffer_size: usize,
    /// Hard per-message cap (default 100 MiB).
    pub max_msg_size: usize,
    pub bind_v4: Ipv4Addr,
    pub bind_v6: Ipv6Addr,
    /// Fixed identity; all-zero means "generate one randomly on start".
    pub identity: [u8; 16],
    pub cert_chain_pem: Option<PathBuf>,
    pub dh_params_pem: Option<PathBuf>,
    pub disable_encryption: bool,
    pub disable_signals: bool,
    /// Process-wide "always encrypt loopback too" override (see DESIGN.md
    /// for the chosen per-instance semantics).
    pub always_encrypt: bool,
}

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_MSG_SIZE: usize = 100 * 1024 * 1024;

impl Default for Config {
    fn default() -> Self {
        Config {
            reuse_time: Duration::from_secs(600),
            timeout: Duration::from_secs(5),
            port: 2998,
            backlog: 10,
            max_slots: 0,
            synchronous: false,
            buffer_size: 0,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            bind_v4: Ipv4Addr::UNSPECIFIED,
            bind_v6: Ipv6Addr::UNSPECIFIED,
            identity: [0; 16],
            cert_chain_pem: None,
            dh_params_pem: None,
            disable_encryption: false,
            disable_signals: false,
            always_encrypt: false,
        }
    }
}

impl Config {
    /// Resolve `max_slots = 0` into the mode-dependent default and
    /// validate every range/invariant named in the wire-protocol
    /// configuration table. Called once by [`Chirp::new`](crate::chirp::Chirp::new);
    /// failures are returned synchronously, never via a callback.
    pub fn validate(mut self) -> Result<Self> {
        let reuse_secs = self.reuse_time.as_secs_f64();
        if !(0.5..=3600.0).contains(&reuse_secs) {
            return Err(ChirpError::ValueError(format!(
                "reuse_time {} out of range [0.5, 3600]",
                reuse_secs
            )));
        }
        let timeout_secs = self.timeout.as_secs_f64();
        if !(0.1..=1200.0).contains(&timeout_secs) {
            return Err(ChirpError::ValueError(format!(
                "timeout {} out of range [0.1, 1200]",
                timeout_secs
            )));
        }
        if reuse_secs < timeout_secs * 3.0 {
            return Err(ChirpError::ValueError(
                "reuse_time must be >= timeout * 3".into(),
            ));
        }
        if self.port <= 1024 {
            return Err(ChirpError::ValueError("port must be > 1024".into()));
        }
        if self.backlog >= 128 {
            return Err(ChirpError::ValueError("backlog must be < 128".into()));
        }
        if self.max_slots > 32 {
            return Err(ChirpError::ValueError("max_slots must be <= 32".into()));
        }
        if self.max_slots == 0 {
            self.max_slots = if self.synchronous { 1 } else { 16 };
        }
        if self.synchronous && self.max_slots != 1 {
            return Err(ChirpError::ValueError(
                "synchronous mode requires max_slots == 1".into(),
            ));
        }
        if self.buffer_size != 0
            && (self.buffer_size < 1024
                || self.buffer_size < crate::serializer::HANDSHAKE_SIZE)
        {
            return Err(ChirpError::ValueError(
                "buffer_size must be >= 1KiB and >= handshake size".into(),
            ));
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if !self.disable_encryption {
            if self.cert_chain_pem.is_none() || self.dh_params_pem.is_none() {
                return Err(ChirpError::ValueError(
                    "cert_chain_pem and dh_params_pem are required unless encryption is disabled"
                        .into(),
                ));
            }
            for p in [&self.cert_chain_pem, &self.dh_params_pem]
                .iter()
                .filter_map(|o| o.as_ref())
            {
                if !p.exists() {
                    return Err(ChirpError::ValueError(format!(
                        "{} does not exist",
                        p.display()
                    )));
                }
            }
        }
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64((self.timeout.as_secs_f64() * 2.0).min(60.0))
    }

    /// Addresses `127.0.0.1` and `::1` are never encrypted unless
    /// `always_encrypt` is set on this instance's config.
    pub fn should_encrypt(&self, addr: &IpAddr) -> bool {
        if self.disable_encryption {
            return false;
        }
        if self.always_encrypt {
            return true;
        }
        !is_loopback(addr)
    }
}

fn is_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => a.is_loopback(),
        IpAddr::V6(a) => a.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_time_must_be_at_least_three_times_timeout() {
        let mut cfg = Config::default();
        cfg.disable_encryption = true;
        cfg.timeout = Duration::from_secs(300);
        cfg.reuse_time = Duration::from_secs(600);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_slots_zero_resolves_by_mode() {
        let mut cfg = Config::default();
        cfg.disable_encryption = true;
        cfg.synchronous = true;
        let cfg = cfg.validate().unwrap();
        assert_eq!(cfg.max_slots, 1);

        let mut cfg = Config::default();
        cfg.disable_encryption = true;
        let cfg = cfg.validate().unwrap();
        assert_eq!(cfg.max_slots, 16);
    }

    #[test]
    fn loopback_not_encrypted_by_default() {
        let mut cfg = Config::default();
        cfg.disable_encryption = true;
        let cfg = cfg.validate().unwrap();
        assert!(!cfg.should_encrypt(&"127.0.0.1".parse().unwrap()));
    }
}
