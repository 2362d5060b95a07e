pub mod client;
pub mod types;

pub use client::{Fetcher, HttpFetcher};
pub use types::{Method, Request, Response, ResponseType};
