mod acquisition;
#[cfg(feature = "caen")]
mod caen;
mod clock;
mod config;
mod dgtz;
pub mod registers;
mod session;
mod sim;

pub use acquisition::*;
#[cfg(feature = "caen")]
pub use caen::*;
pub use clock::*;
pub use config::*;
pub use dgtz::*;
pub use registers::OffsetError;
pub use session::*;
pub use sim::*;
