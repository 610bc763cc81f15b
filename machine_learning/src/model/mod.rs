mod extractor;
mod layout;
mod linear;
pub mod loss;

pub use extractor::{EmbeddingExtractor, Forward, Mode};
pub use layout::{ParamLayout, ParamSegment};
pub use linear::LinearEmbedder;
