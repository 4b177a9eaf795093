pub mod logger;
pub mod uuid;

pub use logger::init_logger;
