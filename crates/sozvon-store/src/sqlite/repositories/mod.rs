//! Repository implementations.
//!
//! Each repository is a stateless struct whose methods take a `&Connection`.

pub mod message;
pub mod room;

pub use message::MessageRepo;
pub use room::RoomRepo;
