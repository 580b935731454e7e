mod de;
mod error;
mod ser;
mod value;

pub use de::*;
pub use error::*;
pub use ser::*;
pub use value::*;
