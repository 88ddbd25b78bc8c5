//! Protocol vocabulary: typed messages and control actions

pub mod action;
pub mod message;

pub use action::{ActionCommand, SimulatedAction};
pub use message::{ActionRecording, Message, MessageTag, Registration, TransformUpdate};
