mod clock;
mod document;
mod error;
mod value;

pub use clock::now_millis;
pub use document::{Document, ID_FIELD, get_path};
pub use error::Error;
pub use value::{Value, ValueKind};
