//! Distributed render dispatch
//!
//! The terminal render stage has four execution paths, selected by
//! configuration:
//!
//! - [`service::RenderService`] - one external worker, synchronous or
//!   ack-then-webhook
//! - [`worker_pool::WorkerPoolService`] - frame-range chunking across a
//!   pool of homogeneous workers, with polling and chunk concatenation
//! - [`single_pool::SinglePoolService`] - whole jobs round-robined over
//!   sibling workers
//! - [`cloud::CloudRenderService`] - a stateless cloud-function backend
//!
//! Two URL passes run before any payload leaves the orchestrator: signed
//! CDN URLs are renewed (payloads traverse untrusted infrastructure), and
//! external hostnames are mapped to in-cluster DNS for pool workers.

pub mod cloud;
pub mod dispatcher;
pub mod payload;
pub mod service;
pub mod signing;
pub mod single_pool;
pub mod url_rewrite;
pub mod worker_client;
pub mod worker_pool;

pub use cloud::CloudRenderService;
pub use dispatcher::{RenderDispatcher, RenderMode, RenderOutcome};
pub use service::{RenderService, WorkerFlavor};
pub use signing::{BlobStore, HttpBlobStore};
pub use single_pool::SinglePoolService;
pub use worker_client::{ConcatApi, HttpConcatClient, HttpWorkerClient, PollReply, WorkerApi};
pub use worker_pool::{PollConfig, WorkerPoolService};
