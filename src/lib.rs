//! AVR in-system programming over serial and USB programmer adapters.

pub mod format;
pub mod opcode;
pub mod part;
pub mod programmer;
pub mod session;
pub mod transport;

pub use self::part::{Part, PartDb};
pub use self::programmer::Programmer;
pub use self::session::{MemoryImage, Session};
