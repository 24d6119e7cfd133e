//! Distributed execution: planning, dispatching, and tracking.
//!
//! A client request becomes an execution plan, a list of [`Step`]s ordered
//! by their input/output dependencies. The [`ExecutionPlanner`] orders the
//! steps, threads the error channel through them, and computes concrete
//! routes from the catalog ring and cluster state. The [`Dispatcher`] sends
//! the routed plan to every participating node under a fresh execution id,
//! and each node's [`Session`] runs the local tasks, exchanging partial
//! results until the plan's posting step feeds the reply.
//!
//! Time is measured in ticks delivered by the server loop, ten per second,
//! like a logical clock. Session timeouts count ticks rather than reading
//! the wall clock, which keeps expiry deterministic under test.

pub mod dispatcher;
pub mod graph;
pub mod planner;
pub mod reduce;
pub mod session;
pub mod step;

pub use dispatcher::{Dispatcher, STATUS};
pub use planner::{resolve_descendants, ExecutionPlanner, Plan};
pub use session::{Effect, Session};
pub use step::{Deliver, Dispatch, Internal, Step};

/// Logical clock ticks per second.
pub const TICKS_PER_SECOND: u64 = 10;
