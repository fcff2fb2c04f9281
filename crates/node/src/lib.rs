mod bridge;
pub use bridge::BusBridge;

pub mod identity;

mod node;
pub use node::Node;
