pub mod run;
pub mod serve;
pub mod validate;

pub use run::{handle_run, RunArgs};
pub use serve::{handle_serve, ServeArgs};
pub use validate::{handle_validate, ValidateArgs};
