//! Cadenza generic container: a real-time audio processing engine.
//!
//! The container hosts a directed graph of signal-processing modules and
//! drives data through them under one of two triggering disciplines: a
//! periodic timer signal, or buffer arrival on external port queues. It
//! enforces bit-exact framing, backpressure, metadata ordering, and state
//! propagation between subgraphs and across container boundaries.
//!
//! Layering, leaves first: buffer management, external port I/O, the
//! threshold engine, the topology process driver, state propagation, the
//! metadata pipeline, the event reconciler, the trigger selector, and the
//! command dispatcher on top.

pub mod buffers;
pub mod command;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod ext_in;
pub mod ext_out;
pub mod graph;
pub mod metadata;
pub mod modules;
pub mod power;
mod reconcile;
mod state_prop;
pub mod threshold;
mod topo_proc;
pub mod trigger;
mod underrun;

pub use command::{
    ClientEvent, CmdAck, Command, CommandMsg, ConnDef, ExtInDecl, ExtOutDecl, GraphOpenPayload,
    MediaFmtDecl, ModuleDef, PeerPortProperty, PortRef, ThresholdDecl,
};
pub use config::{ContainerConfig, PerfMode};
pub use container::{Container, ContainerHandle, TriggerVerdict};
pub use error::{EngineError, Result};
pub use events::{EventCtx, FwkEventFlags, ModuleEventFlags};
pub use ext_out::ExtOutConsumer;
pub use graph::module::{AudioModule, ModuleFlags, ModuleProperties, TriggerKind};
pub use graph::port::{DataFlowState, NonTriggerPolicy, PortState};
pub use threshold::LcmUnit;
