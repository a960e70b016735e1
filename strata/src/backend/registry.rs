//! Backend factory using the inventory pattern for compile-time registration.
//!
//! Backend implementations register themselves with `inventory::submit!`.
//! Which of them are usable is decided per host when the factories run.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_shared::errors::StrataResult;

use super::Backend;
use crate::options::BackendOptions;

/// Type alias for backend factory functions.
pub type BackendFactoryFn = fn(&BackendOptions) -> StrataResult<Arc<dyn Backend>>;

/// Registration entry submitted by backend implementations via inventory.
pub struct BackendRegistration {
    pub name: &'static str,
    pub factory: BackendFactoryFn,
}

inventory::collect!(BackendRegistration);

/// Instantiate every registered backend whose factory succeeds on this host.
///
/// Factories that fail (overlay without kernel support, bind on a non-Linux
/// host) are skipped and logged at debug level.
pub fn create_backends(options: &BackendOptions) -> BTreeMap<String, Arc<dyn Backend>> {
    let mut backends = BTreeMap::new();

    for registration in inventory::iter::<BackendRegistration> {
        match (registration.factory)(options) {
            Ok(backend) => {
                tracing::debug!(backend = registration.name, "Created backend");
                backends.insert(registration.name.to_string(), backend);
            }
            Err(e) => {
                tracing::debug!(
                    backend = registration.name,
                    error = %e,
                    "Backend not usable on this host"
                );
            }
        }
    }

    backends
}

/// Check if a backend name is registered.
pub fn is_registered(name: &str) -> bool {
    inventory::iter::<BackendRegistration>().any(|r| r.name == name)
}

/// Get a list of all registered backend names.
pub fn available_backends() -> Vec<&'static str> {
    let mut names: Vec<_> = inventory::iter::<BackendRegistration>()
        .map(|r| r.name)
        .collect();
    names.sort_unstable();
    names
}
