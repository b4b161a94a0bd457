pub mod extract;
pub mod markup;
pub mod stream;

pub use extract::{extract_categories, extract_infobox, Infobox};
pub use markup::clean_markup;
pub use stream::{ParseEvent, RawRecord, RecordStream, SkipReason};
