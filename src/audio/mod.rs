//! External audio tool wrappers: prober, encoder, tagger, chapters

pub mod chapters;
pub mod encoder;
pub mod probe;
pub mod tagger;

pub use chapters::{chapters_from_tracks, write_ffmetadata, Chapter};
pub use encoder::Encoder;
pub use probe::Prober;
pub use tagger::{prepare_cover, TagRequest, Tagger};
