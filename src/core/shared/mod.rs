pub mod enums;
pub mod schema;
pub mod state;
pub mod test_utils;
pub mod utils;

pub use enums::*;
pub use schema::*;
