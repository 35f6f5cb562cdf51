//! Configuration-declared defaults.
//!
//! Each merge appends; calling one twice appends twice.

use secpol_oci::ContainerPolicy;

use crate::config::{DefaultUserMount, EnvDefaults, GlobalMount};
use crate::input::InputContainer;

/// Append the default environment groups to every container.
pub fn merge_env_defaults(containers: &mut [InputContainer], defaults: &EnvDefaults) {
    for container in containers {
        container.env_rules.extend(defaults.rules().cloned());
    }
}

/// Append the default user mounts, as input mounts, to every container.
pub fn merge_user_mounts(containers: &mut [InputContainer], mounts: &[DefaultUserMount]) {
    for container in containers {
        container
            .mounts
            .extend(mounts.iter().map(DefaultUserMount::to_input));
    }
}

/// Append the global mounts to a compiled container.
pub fn merge_global_mounts(policy: &mut ContainerPolicy, mounts: &[GlobalMount]) {
    for mount in mounts {
        let key = policy.mounts.push(mount.to_constraint());
        tracing::trace!(key = %key, destination = %mount.destination, "Global mount injected");
    }
}
