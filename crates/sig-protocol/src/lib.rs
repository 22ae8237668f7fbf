//! Wire types shared between the session coordinator, the insight manager,
//! and the gateway server: inbound/outbound WebSocket events, the error
//! taxonomy, and the transcript data model.

mod error;
mod events;
mod session_config;
mod transcript;

pub use error::{ErrorCode, GatewayError};
pub use events::{InboundEvent, OutboundEvent};
pub use session_config::{AudioEncoding, SessionConfig};
pub use transcript::{BatchResult, InsightEvent, InsightType, Segment, SessionSnapshotStats};
