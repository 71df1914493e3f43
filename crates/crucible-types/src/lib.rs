mod directive;
mod model;
mod records;
mod task;
mod tool;
mod trace;

pub use directive::*;
pub use model::*;
pub use records::*;
pub use task::*;
pub use tool::*;
pub use trace::*;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
