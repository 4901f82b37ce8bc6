pub mod device;
pub mod fs;
