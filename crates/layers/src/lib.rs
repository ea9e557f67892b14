pub mod headless;
pub mod hover;
pub mod layer;
pub mod sync;
pub mod target;

pub use headless::*;
pub use hover::*;
pub use layer::*;
pub use sync::*;
pub use target::*;
