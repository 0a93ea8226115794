pub mod connection;
pub mod pool;
pub mod transaction;

#[cfg(test)]
mod tests;
