//! Execution adapters.
//!
//! One adapter per [`AdapterKind`] except `human`, which the engine handles
//! itself. [`build_registry`] wires all of them from [`Settings`].

pub mod container;
pub mod eval;
pub mod http;
pub mod llm;
pub mod process;

use petal_core::adapter::AdapterRegistry;
use petal_types::config::Settings;

pub use container::ContainerAdapter;
pub use eval::EvalAdapter;
pub use http::HttpAdapter;
pub use llm::LlmAdapter;
pub use process::ProcessAdapter;

/// Version reported by every built-in adapter and pinned into locks.
pub const ADAPTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Register every built-in adapter.
pub fn build_registry(settings: &Settings) -> AdapterRegistry {
    let http_timeout = settings.http_timeout.as_duration();
    let mut registry = AdapterRegistry::new();
    registry
        .register(ProcessAdapter::new())
        .register(ContainerAdapter::new(&settings.container_runtime))
        .register(EvalAdapter::new())
        .register(HttpAdapter::new(http_timeout))
        .register(LlmAdapter::new(http_timeout));
    tracing::debug!(adapters = ?registry, "adapter registry built");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_types::step::AdapterKind;

    #[test]
    fn test_registry_covers_every_dispatched_kind() {
        let registry = build_registry(&Settings::default());
        for kind in AdapterKind::ALL {
            assert_eq!(registry.get(kind).is_some(), kind != AdapterKind::Human, "{kind}");
        }
        let pins = registry.pins();
        assert_eq!(pins.len(), 5);
        assert!(pins.values().all(|v| v == ADAPTER_VERSION));
    }
}
