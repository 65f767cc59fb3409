// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for a [`Locker`](crate::Locker).

use std::time::Duration;

use derive_builder::Builder;

use crate::lock::{Error, ErrorKind};

/// Shortest accepted lease duration.
pub const MIN_LEASE_DURATION: Duration = Duration::from_millis(100);
/// Longest accepted lease duration.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(600);

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10);

/// Options accepted by [`Locker::new`](crate::Locker::new).
///
/// Build one with [`LockerOptionsBuilder`]; every field has a default.
#[derive(Builder, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct LockerOptions {
    /// DynamoDB endpoint override, e.g. a DynamoDB Local URL.
    #[builder(default, setter(into, strip_option))]
    pub endpoint: Option<String>,
    /// AWS region override. Falls back to `AWS_REGION`/`AWS_DEFAULT_REGION`
    /// and the SDK's default provider chain.
    #[builder(default, setter(into, strip_option))]
    pub region: Option<String>,
    /// How long a granted lease lasts if no heartbeat renews it.
    /// Must lie within [`MIN_LEASE_DURATION`]..=[`MAX_LEASE_DURATION`].
    #[builder(default = "DEFAULT_LEASE_DURATION")]
    pub lease_duration: Duration,
    /// On contention, wait for the holder's lease to lapse instead of
    /// returning immediately.
    #[builder(default)]
    pub delay: bool,
    /// Record errors on the handle instead of panicking in
    /// [`lock`](crate::Locker::lock)/[`unlock`](crate::Locker::unlock).
    #[builder(default)]
    pub no_panic: bool,
}

impl LockerOptions {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.lease_duration < MIN_LEASE_DURATION || self.lease_duration > MAX_LEASE_DURATION {
            return Err(ErrorKind::InvalidConfiguration(format!(
                "lease duration {:?} is outside {MIN_LEASE_DURATION:?}..={MAX_LEASE_DURATION:?}",
                self.lease_duration
            ))
            .into());
        }
        Ok(())
    }
}

impl Default for LockerOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: None,
            lease_duration: DEFAULT_LEASE_DURATION,
            delay: false,
            no_panic: false,
        }
    }
}

impl LockerOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(lease) = self.lease_duration {
            if lease < MIN_LEASE_DURATION || lease > MAX_LEASE_DURATION {
                return Err(format!(
                    "lease duration {lease:?} is outside {MIN_LEASE_DURATION:?}..={MAX_LEASE_DURATION:?}"
                ));
            }
        }
        Ok(())
    }
}
