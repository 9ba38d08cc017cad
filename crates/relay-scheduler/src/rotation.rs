//! Credential profile rotation with per-profile cooldowns.
//!
//! Profiles are grouped into one ring per backend family, in configuration
//! order. `acquire` hands out the first available profile from the ring's
//! cursor; an auth or rate-limit release puts the profile into cooldown and
//! moves the cursor past it. Cooldown expiry is checked lazily on `acquire`.
//!
//! All state sits behind one `std::sync::Mutex`, so an acquire or release is
//! a single short critical section and never spans a backend call.

use relay_config::{CredentialProfileConfig, CredentialsConfig, MAX_COOLDOWN_SECONDS};
use relay_core::FailureClass;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);
const MAX_COOLDOWN: Duration = Duration::from_secs(MAX_COOLDOWN_SECONDS);

/// A credential profile as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialProfile {
    pub id: String,
    pub family: String,
    pub secret_ref: String,
}

impl CredentialProfile {
    pub fn new(id: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            family: family.into(),
            secret_ref: String::new(),
        }
    }

    pub fn with_secret_ref(mut self, secret_ref: impl Into<String>) -> Self {
        self.secret_ref = secret_ref.into();
        self
    }
}

impl From<&CredentialProfileConfig> for CredentialProfile {
    fn from(config: &CredentialProfileConfig) -> Self {
        Self {
            id: config.id.clone(),
            family: config.family.clone(),
            secret_ref: config.secret_ref.clone(),
        }
    }
}

/// What the backend invoker receives: the profile id and its opaque secret
/// reference. Status and counters stay inside the rotator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRef {
    pub id: String,
    pub family: String,
    pub secret_ref: String,
}

/// How an attempt made with a leased credential ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure {
        class: FailureClass,
        retry_after: Option<Duration>,
    },
    /// Attempt never completed; bookkeeping only.
    Canceled,
}

impl ReleaseOutcome {
    pub fn failure(class: FailureClass) -> Self {
        Self::Failure {
            class,
            retry_after: None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("No credential profile available for backend family '{family}'")]
pub struct NoneAvailable {
    pub family: String,
}

/// Observability view of one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileView {
    pub id: String,
    pub family: String,
    pub available: bool,
    pub cooldown_remaining: Option<Duration>,
    pub usage: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct ProfileState {
    profile: CredentialProfile,
    cooldown_until: Option<Instant>,
    usage: u64,
    failures: u64,
}

impl ProfileState {
    fn is_available(&self, now: Instant) -> bool {
        self.cooldown_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct Ring {
    /// Indices into `RotatorState::profiles`, in rotation order.
    members: Vec<usize>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct RotatorState {
    profiles: Vec<ProfileState>,
    rings: HashMap<String, Ring>,
}

impl RotatorState {
    fn expire_cooldowns(&mut self, now: Instant) {
        for state in &mut self.profiles {
            if state.cooldown_until.is_some_and(|until| until <= now) {
                state.cooldown_until = None;
                debug!(credential = %state.profile.id, "Credential cooldown expired");
            }
        }
    }

    fn pick(&self, family: &str, avoid: &[String], now: Instant) -> Option<usize> {
        let ring = self.rings.get(family)?;
        let len = ring.members.len();
        let mut avoided = None;
        for offset in 0..len {
            let slot = ring.members[(ring.cursor + offset) % len];
            let state = &self.profiles[slot];
            if !state.is_available(now) {
                continue;
            }
            if !avoid.iter().any(|id| *id == state.profile.id) {
                return Some(slot);
            }
            avoided.get_or_insert(slot);
        }
        avoided
    }

    fn advance_past(&mut self, slot: usize) {
        let family = family_key(&self.profiles[slot].profile.family);
        if let Some(ring) = self.rings.get_mut(&family)
            && let Some(position) = ring.members.iter().position(|m| *m == slot)
        {
            ring.cursor = (position + 1) % ring.members.len();
        }
    }
}

fn family_key(family: &str) -> String {
    family.trim().to_ascii_lowercase()
}

/// Shared, lock-guarded credential rotator. Cloning shares state.
#[derive(Debug, Clone)]
pub struct CredentialRotator {
    inner: Arc<Mutex<RotatorState>>,
    cooldown: Duration,
    honor_retry_after: bool,
}

impl CredentialRotator {
    pub fn new(profiles: impl IntoIterator<Item = CredentialProfile>) -> Self {
        let mut state = RotatorState::default();
        for profile in profiles {
            let slot = state.profiles.len();
            state
                .rings
                .entry(family_key(&profile.family))
                .or_default()
                .members
                .push(slot);
            state.profiles.push(ProfileState {
                profile,
                cooldown_until: None,
                usage: 0,
                failures: 0,
            });
        }
        Self {
            inner: Arc::new(Mutex::new(state)),
            cooldown: DEFAULT_COOLDOWN,
            honor_retry_after: true,
        }
    }

    pub fn from_config(config: &CredentialsConfig) -> Self {
        Self::new(config.profiles.iter().map(CredentialProfile::from))
            .with_cooldown(config.cooldown())
            .with_honor_retry_after(config.honor_retry_after)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    fn lock(&self) -> MutexGuard<'_, RotatorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease the next available profile for `family`.
    ///
    /// Profiles listed in `avoid` are skipped while any other profile is
    /// available, and handed out anyway when they are the only ones left.
    pub fn acquire(&self, family: &str, avoid: &[String]) -> Result<CredentialLease, NoneAvailable> {
        let key = family_key(family);
        let now = Instant::now();
        let (slot, credential) = {
            let mut state = self.lock();
            state.expire_cooldowns(now);
            let slot = state.pick(&key, avoid, now).ok_or_else(|| NoneAvailable {
                family: key.clone(),
            })?;
            let profile = &state.profiles[slot].profile;
            debug!(family = %key, credential = %profile.id, "Acquired credential");
            (
                slot,
                CredentialRef {
                    id: profile.id.clone(),
                    family: key,
                    secret_ref: profile.secret_ref.clone(),
                },
            )
        };
        Ok(CredentialLease {
            rotator: self.clone(),
            slot,
            credential,
            settled: false,
        })
    }

    /// Return a lease with the outcome of the attempt it was used for.
    pub fn release(&self, mut lease: CredentialLease, outcome: ReleaseOutcome) {
        lease.settled = true;
        lease.rotator.settle(lease.slot, &outcome);
    }

    fn settle(&self, slot: usize, outcome: &ReleaseOutcome) {
        let mut state = self.lock();
        let Some(profile) = state.profiles.get_mut(slot) else {
            return;
        };
        match outcome {
            ReleaseOutcome::Success => profile.usage += 1,
            ReleaseOutcome::Failure { class, retry_after } if class.is_credential_fault() => {
                let cooldown = match retry_after {
                    Some(hint) if self.honor_retry_after => *hint,
                    _ => self.cooldown,
                }
                .min(MAX_COOLDOWN);
                profile.failures += 1;
                profile.cooldown_until = Some(Instant::now() + cooldown);
                warn!(
                    credential = %profile.profile.id,
                    family = %profile.profile.family,
                    class = %class,
                    cooldown_secs = cooldown.as_secs_f64(),
                    "Credential cooling down"
                );
                state.advance_past(slot);
            }
            ReleaseOutcome::Failure { .. } => profile.failures += 1,
            ReleaseOutcome::Canceled => {}
        }
    }

    pub fn snapshot(&self) -> Vec<ProfileView> {
        let now = Instant::now();
        let state = self.lock();
        state
            .profiles
            .iter()
            .map(|s| ProfileView {
                id: s.profile.id.clone(),
                family: family_key(&s.profile.family),
                available: s.is_available(now),
                cooldown_remaining: s
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| until - now),
                usage: s.usage,
                failures: s.failures,
            })
            .collect()
    }
}

/// A leased credential. Dropping it without `release` counts as canceled.
#[derive(Debug)]
pub struct CredentialLease {
    rotator: CredentialRotator,
    slot: usize,
    credential: CredentialRef,
    settled: bool,
}

impl CredentialLease {
    pub fn credential(&self) -> &CredentialRef {
        &self.credential
    }

    pub fn id(&self) -> &str {
        &self.credential.id
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if !self.settled {
            self.rotator.settle(self.slot, &ReleaseOutcome::Canceled);
        }
    }
}

#[cfg(test)]
#[path = "rotation_tests.rs"]
mod tests;
