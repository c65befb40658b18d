/// Control-plane API access
pub mod api;

/// Retry delays
pub mod backoff;

/// Versioned condition writes
pub mod problem_client;

/// Sliding-window write limits
pub mod rate_limiter;

/// Background delivery tasks
pub mod reporter;

pub use api::{KubeApiClient, MockNodeApi, NodeApi, NodeObject};
pub use backoff::Backoff;
pub use problem_client::ProblemClient;
pub use rate_limiter::RateLimiter;
pub use reporter::{wait_for_api, Reporter, ReporterStats};
