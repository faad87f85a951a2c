pub mod catalog;
pub mod frame;
pub mod scanner;
pub mod sn;
pub mod traits;
