//! Core trait definitions

mod stream;

pub use stream::{StreamReceiver, StreamSender};
