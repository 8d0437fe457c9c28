pub mod app;
pub mod dat;
