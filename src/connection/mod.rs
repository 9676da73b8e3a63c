//! Connection handles and the driver that opens them.

mod driver;
mod handle;

pub use driver::Driver;
pub use handle::Connection;
