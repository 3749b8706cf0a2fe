//! `flowbridge-transport` – the channel transport between dataflow ports and
//! a publish/subscribe bus.
//!
//! A real-time control loop writes into ports; this crate carries those
//! samples onto a bus (and bus messages back into ports) without ever letting
//! a slow bus call run on the control-loop thread.
//!
//! # Modules
//!
//! - [`bus`] – the [`Bus`] contract consumed by the bridge and the
//!   [`ServiceHost`] request/response contract.
//! - [`in_process`] – [`InProcessBus`], a loopback bus on Tokio broadcast
//!   channels used for single-process deployments and tests.
//! - [`element`] – the [`ChannelElement`] capability every link of a chain
//!   implements.
//! - [`buffer`] – [`BufferElement`], the lock-free decoupling point between
//!   real-time writers and everyone else.
//! - [`worker`] – [`PublishWorker`], the single thread that performs every
//!   publish call.
//! - [`publisher`] / [`subscriber`] – the two bus-facing adapters.
//! - [`gate`] – [`CallbackGate`], in-flight callback accounting for
//!   subscribers.
//! - [`naming`] – default topic names.
//! - [`factory`] – [`TransportFactory`], which builds a two-element chain per
//!   connection.
//! - [`config`] – TOML configuration with environment overrides.
//! - [`telemetry`] – `tracing` subscriber initialisation.

pub mod buffer;
pub mod bus;
pub mod config;
pub mod element;
pub mod factory;
pub mod gate;
pub mod in_process;
pub mod naming;
pub mod publisher;
pub mod subscriber;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::BufferElement;
pub use bus::{Bus, Callback, ConsumerHandle, ProducerHandle, ServiceHandle, ServiceHandler, ServiceHost};
pub use config::TransportConfig;
pub use element::{ChannelElement, WriteStatus};
pub use factory::{ChannelStream, TransportFactory};
pub use gate::{CallbackGate, GatePermit};
pub use in_process::InProcessBus;
pub use naming::{TopicNamer, default_topic_name};
pub use publisher::PublisherChannelElement;
pub use subscriber::SubscriberChannelElement;
pub use worker::{Drain, DrainReport, PublishTicket, PublishWorker, WorkerStats};
