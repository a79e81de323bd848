pub mod layer;
pub mod protocol;
pub mod registry;
pub mod utils;
