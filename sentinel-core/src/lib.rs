//! Core of the Sentinel Cycle Engine: the cycle FSM, the approval gate, and
//! the adapter contracts (VFS, Verifier, Reflection Sink) the FSM drives.
//! The bundle codec lives in the sibling `sentinel_codec` crate; this crate
//! re-exports the handful of its types the public API surfaces.

pub mod approval;
pub mod config;
pub mod cycle;
pub mod error;
pub mod protocol;
pub mod reflection;
pub mod verifier;
pub mod vfs;

pub use config::Config;
pub use cycle::CycleContext;
pub use cycle::CycleEngine;
pub use cycle::CycleEngineConfig;
pub use cycle::CycleState;
pub use cycle::Curator;
pub use cycle::ProposalGenerator;
pub use cycle::StatusSnapshot;
pub use error::CycleError;
pub use error::Result;
pub use protocol::Event;
pub use protocol::EventBus;
pub use protocol::EventMsg;
