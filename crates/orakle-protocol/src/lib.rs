pub mod frames;
pub mod http;
pub mod skill_wire;
