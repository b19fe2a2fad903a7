//! stratus-placement: node registry and placement engine.
//!
//! Nodes publish their own stats; the registry scores each report with
//! the configured score plugin and the placer picks the best eligible
//! executor-host for every new instance.
//!
//! # Architecture
//!
//! ```text
//!   node ─► NodeReporter ─► StatsPipeline ─► NodeRegistry.report ─► ScorePlugin
//!                                                  │
//!                                                  ▼
//!                                            StateStore (nodes)
//!                                                  │
//!   workflow ─► InstanceRequirements ─► Placer.choose(snapshot) ─► NodeRecord
//! ```
//!
//! All three plugin kinds (score, stats, placement filter) are looked up
//! by id in a [`PluginRegistry`] built once at startup.

pub mod error;
pub mod filter;
pub mod placer;
pub mod plugins;
pub mod registry;
pub mod reporter;
pub mod scorer;
pub mod stats;

pub use error::{PlacementError, PlacementResult, PluginError, PluginResult, RegistryError, RegistryResult};
pub use filter::{NotDraining, PlacementFilter};
pub use placer::{InstanceRequirements, Placer};
pub use plugins::{FilterFactory, PluginRegistry, ScoreFactory, StatsFactory};
pub use registry::NodeRegistry;
pub use reporter::NodeReporter;
pub use scorer::{KeyScore, ScorePlugin, WeightedScore, sanitize_score, stat_f64};
pub use stats::{ReportSequence, StaticStats, StatsCollector, StatsPipeline};
