pub mod record;
pub mod registry;

pub use record::{BadResponse, ContentFilter, PeerRecord, SessionState};
pub use registry::PeerRegistry;
