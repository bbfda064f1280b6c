pub mod backplane;
pub mod registry;
pub mod roster;

pub use backplane::{Backplane, Group};
pub use registry::Registry;
pub use roster::Roster;
