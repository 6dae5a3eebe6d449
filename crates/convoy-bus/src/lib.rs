//! Typed publish/subscribe over named channels, one per chat or user.

pub mod bus;
pub mod event;

pub use bus::{chat_stream_channel, message_persisted_channel, typing_events_channel, StreamBus};
pub use event::{
    BusEvent, ChunkEvent, MessagePersistedEvent, PostProcessingEvent, TypingStartedEvent,
};
