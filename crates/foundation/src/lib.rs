pub mod bounds;
pub mod geo;
pub mod time;

// Coordinates, bounds and clocks shared by the fetch and render sides.
pub use bounds::*;
pub use geo::*;
pub use time::*;
