pub mod token;

pub use token::{token_handler, token_options_handler};
