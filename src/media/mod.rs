pub mod peer;
pub mod room;
pub mod rtc;
pub mod speakers;
pub mod workers;
