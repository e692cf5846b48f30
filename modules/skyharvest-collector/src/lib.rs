pub mod batch;
pub mod checkpoint;
pub mod error;
pub mod expand;
pub mod feeds;
pub mod job;
pub mod orchestrator;
pub mod partition;
pub mod registry;
pub mod relation;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use batch::{BatchCollector, BatchResult, BatchShare};
pub use error::{CollectError, Result};
pub use expand::{ExpandSettings, Expanded, TreeBuilder};
pub use feeds::FeedCollector;
pub use job::{CollectionJob, HarvestDeps, JobResult, JobState};
pub use orchestrator::{merge_artifacts, AggregateResult, Orchestrator, WorkerArtifact, WorkerOutcome};
pub use partition::partition;
pub use registry::ParticipantRegistry;
pub use stats::HarvestStats;
pub use traits::{BskyConnector, Connector, Paced, PlatformApi};
