pub mod fields;
pub mod game_key;
pub mod timestamp;
pub mod transform;

pub use transform::{RejectedRecord, TransformOutput, Transformer};
