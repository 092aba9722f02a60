//! Scheduler/broker adapter (C5).

pub mod broker;
pub mod inmemory;

pub use broker::{Broker, BrokerError, BrokerMessage, Delivery, QueueKind};
pub use inmemory::InMemoryBroker;
