//! Fleet domain model
//!
//! A fleet is a named group of game-server instances managed as one scaling
//! unit. [`FleetWrapper`] caches the settings parsed from the fleet resource
//! and tracks runtime state (cooldowns, enabled flag, instance snapshot);
//! [`FleetRegistry`] maps fleet names to wrappers with copy-on-read
//! accessors.

pub mod registry;
pub mod settings;
pub mod wrapper;

pub use registry::FleetRegistry;
pub use settings::DeploymentType;
pub use settings::QueueStrategy;
pub use settings::ScaleStrategy;
pub use settings::ScalingSettings;
pub use settings::SettingsError;
pub use wrapper::FleetWrapper;
