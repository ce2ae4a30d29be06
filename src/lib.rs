//! # proxy-link-validator
//!
//! Concurrent validation of `vmess://`, `vless://` and `trojan://` proxy links.
//!
//! Each link is parsed into a [`ConnectionDescriptor`], a tunnel is brought up through
//! a pluggable [`Dialer`], a [`Probe`] measures latency through it, and the verdict is
//! streamed to a [`ResultSink`]. The [`Scheduler`] bounds concurrency and guarantees
//! one [`VerdictRecord`] per input link.

pub mod config;
pub mod dialer;
pub mod error;
pub mod link;
pub mod probe;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod task;
pub mod utils;
pub mod verdict;

pub use config::{Delivery, ValidatorConfig, ValidatorConfigBuilder};
pub use dialer::{Dialer, EngineConfig, EngineDialer, MockBehavior, MockDialer, TunnelHandle};
pub use error::{DialError, FailureKind, ParseError, ProbeError, TaskError, ValidatorError};
pub use link::{parse, ConnectionDescriptor, ProxyKind};
pub use probe::{FixedProbe, HttpProbe, Probe};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use sink::{FileSink, MemorySink, ResultSink};
pub use task::{TaskState, ValidationTask};
pub use verdict::{RunSummary, VerdictRecord};
