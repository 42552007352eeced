// SAC Networks Module
pub mod actor;
pub mod body;
pub mod q_network;
pub mod value;

pub use actor::{ActorNetwork, ActorOutput};
pub use body::{NetworkBody, Normalizer};
pub use q_network::PolicyValueNetwork;
pub use value::{StreamValues, ValueNetwork};
