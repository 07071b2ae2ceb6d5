pub mod tokens;

pub use tokens::{ConnectionClaims, ConnectionTokens};
