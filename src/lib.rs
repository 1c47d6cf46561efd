pub mod il;
pub mod vm;
pub mod weave;

mod util;
