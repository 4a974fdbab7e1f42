pub mod utils;

mod alloc;
mod jobs;
