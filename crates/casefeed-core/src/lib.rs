pub mod event;
pub mod filter;
pub mod normalize;
pub mod wire;

pub use event::{
    AgentDirectory, AgentProfile, AgentRef, AgentRegistry, EventCategory, EventKind, TimelineEvent,
};
pub use filter::FilterDescriptor;
pub use normalize::{normalize, parse_timestamp, Rejected};
pub use wire::{decode_frame, encode_frame, WireError, WireEvent, WireFrame, WireKind};
