pub mod mailboxes;
pub mod ticketing;

pub use self::mailboxes::*;
pub use self::ticketing::*;
