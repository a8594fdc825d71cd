//! Router over registered providers.
//!
//! The public surface is [`Router`] plus the [`ProviderAdapter`] seam adapters implement.
//! Implementation details are split into submodules under `src/client/`.

pub mod builder;
pub mod core;
pub mod pricing;
pub mod provider;

pub use builder::RouterBuilder;
pub use core::{Router, RouterResponse};
pub use pricing::{ModelPricing, Pricing};
pub use provider::{ProviderAdapter, ProviderContext, ProviderFactory, ProviderRegistry};
