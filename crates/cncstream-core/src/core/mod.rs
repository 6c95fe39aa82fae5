//! Controller events, listeners and the ordered dispatcher

pub mod event;
pub mod listener;
pub mod message;

pub use event::{ControllerEvent, EventDispatcher};
pub use listener::{ControllerListener, ControllerListenerHandle};
pub use message::MessageLevel;
