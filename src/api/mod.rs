pub mod client;
pub mod images;
pub mod models;
