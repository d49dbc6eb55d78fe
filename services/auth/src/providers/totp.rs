//! Time-based one-time codes and the bounded retry around them

use crate::Broker;
use crate::config::TotpPolicy;
use crate::error::{BrokerError, BrokerResult};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, warn};

/// Normalise a base32 seed as authenticator apps display it
fn clean_seed(seed: &str) -> String {
    seed.trim().replace(' ', "").to_uppercase()
}

/// Generate the current 6-digit code for a base32 seed
///
/// # Errors
/// Returns `CredentialsInvalid` if the seed is not valid base32 or too short
pub fn generate_code(broker: Broker, seed: &str) -> BrokerResult<String> {
    let invalid = |message: String| BrokerError::CredentialsInvalid { broker, message };

    let secret_bytes = Secret::Encoded(clean_seed(seed))
        .to_bytes()
        .map_err(|e| invalid(format!("TOTP seed is not base32: {e:?}")))?;

    let totp = TOTP::new(
        Algorithm::SHA1,
        6,  // 6 digits
        1,  // 1 step
        30, // 30 second period
        secret_bytes,
    )
    .map_err(|e| invalid(format!("TOTP seed rejected: {e}")))?;

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| invalid(format!("system clock before epoch: {e}")))?
        .as_secs();

    debug!("Generated {} TOTP code", broker);
    Ok(totp.generate(current_time))
}

/// What to do after the provider rejected a one-time code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the next code window, then try again
    Retry { after: Duration },
    /// Attempts exhausted
    GiveUp,
}

/// Attempt counter for one password+TOTP login
#[derive(Debug, Clone)]
pub struct TotpRetry {
    policy: TotpPolicy,
    attempts: u32,
}

impl TotpRetry {
    #[must_use]
    pub const fn new(policy: TotpPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Count the attempt about to be made, returning its 1-based number
    pub fn start_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts made so far
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decide after a stale-code rejection
    #[must_use]
    pub fn on_rejected(&self) -> RetryDecision {
        if self.attempts >= self.policy.max_attempts.max(1) {
            warn!("TOTP rejected {} times, giving up", self.attempts);
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                after: self.policy.window(),
            }
        }
    }
}
