pub mod player;
pub mod takeover;

pub use player::Player;
pub use takeover::{LocalPeer, PeerControl};
