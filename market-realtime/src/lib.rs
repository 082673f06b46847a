pub mod consumer;

pub use consumer::run;
