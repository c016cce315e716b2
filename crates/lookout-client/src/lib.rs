pub mod catalog;
pub mod error;
pub mod session;
pub mod source;

pub use catalog::SourceCatalog;
pub use error::{FetchError, HttpErrorClassifier};
pub use session::{HttpSession, HttpSessionFactory};
pub use source::{ApiSource, PageSource, SourceConfig, SourceExtractor, UrlTemplate};
