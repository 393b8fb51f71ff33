pub mod color;
pub mod crop;
pub mod decode;
pub mod faces;
pub mod layout;
pub mod resize;
pub mod tags;
