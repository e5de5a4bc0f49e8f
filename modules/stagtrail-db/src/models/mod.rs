pub mod deer;
pub mod detection;
pub mod image;
pub mod location;

pub use deer::{Deer, NewDeer};
pub use detection::{Detection, DetectionContext, NewDetection};
pub use image::Image;
pub use location::Location;
