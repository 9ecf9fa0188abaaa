//! Full-mesh audio: one direct link to every co-member

mod link;
mod session;
mod webrtc_link;

pub use link::{LinkEvent, LinkEvents, LinkFactory, LinkState, MediaLink};
pub use session::{MeshSession, SessionEvent, connect};
pub use webrtc_link::{WebRtcLink, WebRtcLinkFactory};
