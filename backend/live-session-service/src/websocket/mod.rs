pub mod message_types;
pub mod session;

pub use session::LiveSessionSocket;
