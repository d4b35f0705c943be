pub mod events;
pub mod message;
pub mod streams;
