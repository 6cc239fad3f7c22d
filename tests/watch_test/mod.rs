pub mod recording;
pub mod session;
