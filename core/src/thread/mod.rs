mod callback;
mod thread_handler;

pub use callback::{Callback, StepFn};
pub(crate) use callback::integer_ratio;
pub use thread_handler::ThreadHandler;
