mod db;
mod registry;
mod types;


pub use db::{build_pool, SessionStore};
pub use registry::SessionRegistry;

#[cfg(test)]
pub use db::{format_session_time, parse_session_time};
#[cfg(test)]
pub use types::SessionStatus;
