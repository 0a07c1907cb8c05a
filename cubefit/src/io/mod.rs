//! File I/O for cubes, maps and parameter cubes

pub mod fits;

pub use fits::{read_cube, read_image, write_cube, write_image};
