pub mod bitrate;
pub mod deletion;
pub mod intake;
pub mod master;
pub mod streaming;
