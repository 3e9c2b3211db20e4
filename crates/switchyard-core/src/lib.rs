pub mod error;
pub mod types;
pub mod model;
pub mod config;
pub mod bus;
pub mod provider;
pub mod health;
pub mod equivalence;
pub mod normalize;
pub mod fallback;
pub mod orchestrator;
pub mod stream;
pub mod util;

pub use bus::{EventBus, ResilienceEvent};
pub use equivalence::{EquivalenceResolver, Tier};
pub use error::{ProviderError, RegistryError, SwitchyardError};
pub use fallback::{ErrorClass, FallbackPolicy};
pub use health::{BackendHealth, CircuitState, HealthTracker};
pub use model::{ModelDescriptor, ModelRef};
pub use normalize::{normalize, NormalizeOptions, NormalizedRequest, ReasoningEffort};
pub use orchestrator::{StreamOrchestrator, StreamRequest};
pub use provider::{BackendPool, LanguageBackend, ModelRegistry, StaticRegistry};
pub use stream::ResilientStream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
