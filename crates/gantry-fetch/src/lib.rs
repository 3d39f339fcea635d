pub mod fetcher;
pub mod fsutil;

pub use fetcher::Fetcher;
