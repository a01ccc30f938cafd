//! Distributed execution substrate for Query Engine
//!
//! A job is split into tasks (fragments). Each task is a small graph of
//! push-driven operators run by one driver thread. Tasks exchange tuples over
//! network channels: a Send operator at the end of one fragment streams to the
//! Receive operator that starts another.
//!
//! # Architecture
//!
//! - **Operators**: sources (Values, Receive), transforms (Project, Limit,
//!   Union) and sinks (Send, Collect). Backpressure is a `false` return from
//!   `push`.
//! - **Fin protocol**: every stream ends with exactly one Fin, which carries
//!   either the accumulated operator profiles or the first failure.
//! - **Transport**: one [`TransportService`] per node multiplexes channels by
//!   tag over TCP. A bounded queue hands decoded tuples to the driver thread.
//!
//! # Example
//!
//! ```ignore
//! use query_distributed::{JobId, NetworkConfig, OperatorConfig, TaskPlan, Worker};
//!
//! let worker = Worker::new("127.0.0.1:0", NetworkConfig::default())?;
//! let plan = TaskPlan::pipeline(JobId::new(), vec![values, collect]);
//! let outcome = worker.submit(plan)?.join()?;
//! for result in &outcome.results {
//!     println!("{} rows", result.len());
//! }
//! ```
//!
//! # Modules
//!
//! - [`codec`]: wire format for tuples and Fins
//! - [`endpoint`]: send/receive endpoints of a channel
//! - [`fin`]: completion signals and profiles
//! - [`network`]: network configuration and framing
//! - [`operators`]: the operator set
//! - [`plan`]: task plan records
//! - [`queue`]: bounded blocking queue
//! - [`task`]: task driver
//! - [`transport`]: per-node network service
//! - [`worker`]: worker node

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod fin;
pub mod network;
pub mod operators;
pub mod plan;
pub mod queue;
pub mod task;
pub mod transport;
pub mod types;
pub mod worker;

pub use codec::{Codec, Message};
pub use endpoint::{Delivery, PayloadHandler, ReceiveEndpoint, SendEndpoint};
pub use error::{DistributedError, Result};
pub use fin::{Failure, Fin, FinCollector, OperatorProfile};
pub use network::NetworkConfig;
pub use operators::{Operator, OperatorContext, OperatorKind, OperatorNode, ResultSet};
pub use plan::{OperatorConfig, OperatorPlan, PinRef, TaskPlan};
pub use queue::BoundedQueue;
pub use task::{Output, Task, TaskOutcome, TaskStatus};
pub use transport::TransportService;
pub use types::{JobId, OperatorId, Tag, TaskId, WorkerId};
pub use worker::{TaskHandle, TaskState, Worker, WorkerStatus};
