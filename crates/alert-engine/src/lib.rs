//! Price alert evaluation and the ordered tick/trigger stream.
//!
//! [`AlertEngine`] checks a tick against stored alerts and atomically flips
//! the ones that fire; [`StreamDispatcher`] runs a tick stream through the
//! engine and forwards ticks and their triggers, in order, to an
//! [`EventSink`].

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod rules;

pub use dispatcher::{DispatchStats, EventSink, SinkClosed, StreamDispatcher, StreamEvent};
pub use engine::{AlertEngine, Scope, TriggerEvent};
pub use error::EngineError;
pub use rules::{AlertRule, Firing, RuleError};
