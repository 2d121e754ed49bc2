pub mod api;
pub mod configs;
pub mod constants;
pub mod middlewares;
pub mod modules;
pub mod utils;

#[cfg(test)]
mod test;
