//! The worker pool: polls for claimable runs, executes them through the
//! engine, and heartbeats their lease while they run.
//!
//! ```text
//!  ┌─────────┐  claim  ┌──────────────┐  execute_pass  ┌────────────┐
//!  │ N slots │ ──────> │ claimed a run │ ─────────────> │ engine pass│
//!  └─────────┘         └──────────────┘                └────────────┘
//!       ^ idle slots sleep ~100ms between rounds (no backoff at this layer)
//! ```

mod pool;
mod poller;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use poller::{Poller, PollerConfig};
