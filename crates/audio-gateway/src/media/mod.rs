//! Media server integration: the control plane client, the source
//! registry, and the per-session state machines built on top of them.

pub mod control;
pub mod registry;
pub mod remote;
pub mod session;

pub use control::{
    MediaControl, MediaControlError, MediaEvent, MediaHandle, MediaKind, Negotiated, UserHandle,
};
pub use registry::{SourceRegistry, SourceResolution};
pub use remote::RemoteMediaControl;
pub use session::{MediaSession, SessionOptions, SessionStatus};
