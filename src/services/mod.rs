//! Application services

pub mod news;

pub use news::NewsService;
