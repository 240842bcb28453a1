pub mod token;

pub use token::{TokenRequestForm, TokenResponseBody};
