#![doc = "Real-time loop pacing and measurement for rt-pacer."]

pub mod backend;
pub mod realtime;
pub mod spinner;
pub mod thread;
pub mod timer;

pub use backend::*;
pub use realtime::*;
pub use spinner::*;
pub use thread::*;
pub use timer::*;
