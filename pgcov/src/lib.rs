//! PL/pgSQL line coverage.
//!
//! Two halves, used in sequence:
//!
//! - [`session`] holds a privileged connection open while the `pgcov`
//!   extension accumulates per-line counters, then cancels its listen call and
//!   harvests one [`FunctionRecord`] per called function.
//! - [`annotate`] turns those records into an HTML report that marks every
//!   source line as hit, missed or not attributable.
//!
//! The annotator never touches the database and the session never renders.

pub mod annotate;
pub mod backend;
pub mod config;
pub mod error;
pub mod hide_list;
pub mod record;
pub mod session;

pub use annotate::{render, RenderPolicy};
pub use config::{ConnectionTarget, APPLICATION_NAME};
pub use error::{BackendError, CoverageError, CoverageResult, ErrorKind};
pub use hide_list::HideList;
pub use record::{FunctionRecord, LineSample, RecordSet};
pub use session::{ListeningSession, SessionOptions, SessionState};
